//! WAV file playback as a capture source

use super::{AudioSource, CaptureStream, DeviceError, ReadError};
use crate::config::CaptureParams;
use crate::frame::AudioSample;
use hound::{SampleFormat, WavIntoSamples, WavReader};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Plays a 16-bit mono WAV file through the engine
///
/// With `realtime` enabled, reads are paced to the file's sample rate so
/// the engine sees the same timing as a live device.
#[derive(Debug, Clone)]
pub struct WavFileSource {
    path: PathBuf,
    realtime: bool,
}

impl WavFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            realtime: false,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for WavFileSource {
    fn open(&mut self, params: &CaptureParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let reader = WavReader::open(&self.path)
            .map_err(|e| DeviceError::Open(format!("{}: {}", self.path.display(), e)))?;

        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != SampleFormat::Int
        {
            return Err(DeviceError::UnsupportedConfig(format!(
                "{} must be 16-bit mono PCM, got {} ch {}-bit {:?}",
                self.path.display(),
                spec.channels,
                spec.bits_per_sample,
                spec.sample_format
            )));
        }
        if spec.sample_rate != params.sample_rate {
            return Err(DeviceError::UnsupportedConfig(format!(
                "{} is {} Hz, engine expects {} Hz",
                self.path.display(),
                spec.sample_rate,
                params.sample_rate
            )));
        }

        info!(
            "Playing {} ({} samples)",
            self.path.display(),
            reader.len()
        );

        Ok(Box::new(WavStream {
            samples: Some(reader.into_samples()),
            sample_rate: spec.sample_rate,
            realtime: self.realtime,
        }))
    }
}

struct WavStream {
    samples: Option<WavIntoSamples<BufReader<File>, AudioSample>>,
    sample_rate: u32,
    realtime: bool,
}

impl CaptureStream for WavStream {
    fn read(&mut self, buf: &mut [AudioSample], _timeout: Duration) -> Result<usize, ReadError> {
        let samples = self.samples.as_mut().ok_or(ReadError::Closed)?;

        let mut filled = 0;
        for slot in buf.iter_mut() {
            match samples.next() {
                Some(Ok(sample)) => {
                    *slot = sample;
                    filled += 1;
                }
                Some(Err(e)) => return Err(ReadError::Stream(e.to_string())),
                None => break,
            }
        }

        if filled == 0 && !buf.is_empty() {
            debug!("WAV source exhausted");
            return Err(ReadError::EndOfStream);
        }

        if self.realtime {
            thread::sleep(Duration::from_secs_f64(
                filled as f64 / self.sample_rate as f64,
            ));
        }

        Ok(filled)
    }

    fn close(&mut self) {
        self.samples = None;
    }
}
