//! Audio output.
//!
//! The playback manager opens one [`AudioBlock`] per sentence, writes the
//! whole sentence into it, lets it play, and drops it. Nothing is held
//! between sentences.

#[cfg(feature = "playback")]
mod player;
mod wav;

#[cfg(feature = "playback")]
pub use player::CpalOutput;
pub use wav::WavFileOutput;

use crate::error::AudioError;

/// Something that can play mono 16-bit PCM.
pub trait AudioOutput: Send + Sync {
    /// Acquire the device for one block at `sample_rate`.
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioBlock>, AudioError>;

    /// Whether blocks play in real time. When false the caller does not wait
    /// for a block's duration before moving on.
    fn is_realtime(&self) -> bool {
        true
    }
}

/// One acquired output stream. Dropping it stops playback and frees the device.
pub trait AudioBlock: Send {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError>;

    fn play(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self);
}

/// Convert float samples to 16-bit PCM, clamping out-of-range values.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| ((s * 32767.0) as i32).clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}

/// Milliseconds `sample_count` samples take to play at `sample_rate`.
pub fn block_duration_ms(sample_count: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    sample_count as u64 * 1000 / sample_rate as u64
}

/// Discards everything. Useful for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

struct NullBlock;

impl AudioOutput for NullOutput {
    fn open(&self, _sample_rate: u32) -> Result<Box<dyn AudioBlock>, AudioError> {
        Ok(Box::new(NullBlock))
    }

    fn is_realtime(&self) -> bool {
        false
    }
}

impl AudioBlock for NullBlock {
    fn write(&mut self, _samples: &[i16]) -> Result<(), AudioError> {
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Default real-time output for this build.
pub fn default_output() -> Result<Box<dyn AudioOutput>, AudioError> {
    #[cfg(feature = "playback")]
    {
        Ok(Box::new(CpalOutput::new()))
    }
    #[cfg(not(feature = "playback"))]
    {
        Err(AudioError::NoDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_conversion_clamps() {
        let pcm = f32_to_pcm16(&[0.0, 1.0, -1.0, 2.5, -3.0, 0.5]);
        assert_eq!(pcm, vec![0, 32767, -32767, 32767, -32768, 16383]);
    }

    #[test]
    fn duration_from_sample_count() {
        assert_eq!(block_duration_ms(22050, 22050), 1000);
        assert_eq!(block_duration_ms(11025, 22050), 500);
        assert_eq!(block_duration_ms(100, 0), 0);
    }

    #[test]
    fn null_output_accepts_anything() {
        let output = NullOutput;
        assert!(!output.is_realtime());
        let mut block = output.open(44_100).unwrap();
        block.write(&[1, 2, 3]).unwrap();
        block.play().unwrap();
        block.stop();
    }
}
