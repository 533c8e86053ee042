use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use hound::{WavSpec, WavWriter};
use parking_lot::Mutex;

use super::{AudioBlock, AudioOutput};
use crate::error::AudioError;

type SharedWriter = Arc<Mutex<Option<WavWriter<BufWriter<File>>>>>;

/// Appends every block to one 16-bit mono WAV file.
///
/// The file is created on the first block and takes that block's sample
/// rate; later blocks at another rate are rejected. Call
/// [`WavFileOutput::finalize`] when done.
pub struct WavFileOutput {
    path: PathBuf,
    writer: SharedWriter,
    sample_rate: Arc<Mutex<Option<u32>>>,
}

impl WavFileOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Arc::new(Mutex::new(None)),
            sample_rate: Arc::new(Mutex::new(None)),
        }
    }

    pub fn finalize(&self) -> Result<(), AudioError> {
        if let Some(writer) = self.writer.lock().take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl AudioOutput for WavFileOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioBlock>, AudioError> {
        let mut rate = self.sample_rate.lock();
        match *rate {
            Some(existing) if existing != sample_rate => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "{sample_rate} Hz block for a {existing} Hz file"
                )));
            }
            Some(_) => {}
            None => {
                let spec = WavSpec {
                    channels: 1,
                    sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };
                *self.writer.lock() = Some(WavWriter::create(&self.path, spec)?);
                *rate = Some(sample_rate);
            }
        }
        Ok(Box::new(WavBlock {
            writer: self.writer.clone(),
            pending: Vec::new(),
        }))
    }

    fn is_realtime(&self) -> bool {
        false
    }
}

struct WavBlock {
    writer: SharedWriter,
    pending: Vec<i16>,
}

impl AudioBlock for WavBlock {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.pending.extend_from_slice(samples);
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        let mut guard = self.writer.lock();
        if let Some(writer) = guard.as_mut() {
            for &sample in &self.pending {
                writer.write_sample(sample)?;
            }
        }
        self.pending.clear();
        Ok(())
    }

    fn stop(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_appended_to_one_file() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("out.wav");
        let output = WavFileOutput::new(&path);

        for chunk in [[1i16, 2, 3], [4, 5, 6]] {
            let mut block = output.open(22050).unwrap();
            block.write(&chunk).unwrap();
            block.play().unwrap();
        }
        output.finalize().unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 22050);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn stopped_block_writes_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().join("out.wav");
        let output = WavFileOutput::new(&path);
        let mut block = output.open(16000).unwrap();
        block.write(&[7, 7]).unwrap();
        block.stop();
        block.play().unwrap();
        output.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 0);
    }

    #[test]
    fn rate_change_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let output = WavFileOutput::new(scratch.path().join("out.wav"));
        assert!(output.open(22050).is_ok());
        assert!(output.open(24000).is_err());
    }
}
