use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use parking_lot::Mutex;
use tracing::{debug, error};

use super::{AudioBlock, AudioOutput};
use crate::error::AudioError;

/// Plays through the host's default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl AudioOutput for CpalOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn AudioBlock>, AudioError> {
        Ok(Box::new(CpalBlock {
            sample_rate,
            samples: Vec::new(),
            stop_tx: None,
            thread: None,
        }))
    }
}

/// `cpal::Stream` is not `Send`, so each block owns a thread that builds the
/// stream, keeps it alive while playing, and drops it when told to stop.
struct CpalBlock {
    sample_rate: u32,
    samples: Vec<i16>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioBlock for CpalBlock {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.samples.extend_from_slice(samples);
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        self.stop();

        let samples: Arc<[i16]> = Arc::from(std::mem::take(&mut self.samples));
        let source_rate = self.sample_rate;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);

        let thread = std::thread::spawn(move || {
            let stream = match open_stream(samples, source_rate) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::Device(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Blocks until stop() sends or the block is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        });

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);

        match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(AudioError::Device("output thread exited".into())),
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalBlock {
    /// Signals the stream thread without joining it; the thread exits on its own.
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn open_stream(samples: Arc<[i16]>, source_rate: u32) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| AudioError::Device(e.to_string()))?;

    debug!(
        device_rate = config.sample_rate().0,
        source_rate,
        format = ?config.sample_format(),
        "Opening output stream"
    );

    let stream_config: cpal::StreamConfig = config.clone().into();
    match config.sample_format() {
        cpal::SampleFormat::I8 => build_output_stream::<i8>(&device, &stream_config, samples, source_rate),
        cpal::SampleFormat::I16 => build_output_stream::<i16>(&device, &stream_config, samples, source_rate),
        cpal::SampleFormat::I32 => build_output_stream::<i32>(&device, &stream_config, samples, source_rate),
        cpal::SampleFormat::U16 => build_output_stream::<u16>(&device, &stream_config, samples, source_rate),
        cpal::SampleFormat::F32 => build_output_stream::<f32>(&device, &stream_config, samples, source_rate),
        other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    samples: Arc<[i16]>,
    source_rate: u32,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels as usize;
    let step = source_rate as f64 / config.sample_rate.0 as f64;
    let position = Arc::new(Mutex::new(0.0f64));
    let reported = Arc::new(AtomicBool::new(false));

    let err_fn = move |err: cpal::StreamError| {
        if !reported.swap(true, Ordering::Relaxed) {
            error!(error = %err, "Output stream error");
        }
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut pos = position.lock();
                for frame in data.chunks_mut(channels) {
                    let index = *pos as usize;
                    let value = match samples.get(index) {
                        Some(&s) => T::from_sample(s),
                        None => T::EQUILIBRIUM,
                    };
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                    *pos += step;
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::Device(e.to_string()))
}
