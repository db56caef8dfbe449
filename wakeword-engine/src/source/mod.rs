//! Audio source capability
//!
//! A source is opened on the processing thread and yields a capture stream
//! the engine reads from with a bounded timeout.

mod microphone;
mod wav;

pub use microphone::MicrophoneSource;
pub use wav::WavFileSource;

use crate::config::CaptureParams;
use crate::frame::AudioSample;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("No input device available")]
    NoDevice,

    #[error("Input device not found: {0}")]
    NotFound(String),

    #[error("Unsupported capture configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to open capture stream: {0}")]
    Open(String),

    #[error("Audio source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("Capture stream error: {0}")]
    Stream(String),

    #[error("Capture stream closed")]
    Closed,

    #[error("End of audio stream")]
    EndOfStream,
}

/// Something that can be opened to capture mono 16-bit audio
pub trait AudioSource: Send {
    fn open(&mut self, params: &CaptureParams) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// An open capture stream
///
/// Owned by the processing thread; need not be `Send`.
pub trait CaptureStream {
    /// Fill `buf` with up to `buf.len()` samples
    ///
    /// Waits at most `timeout`. `Ok(0)` means no audio arrived in time.
    fn read(&mut self, buf: &mut [AudioSample], timeout: Duration) -> Result<usize, ReadError>;

    /// Release the device. Further reads return `ReadError::Closed`.
    fn close(&mut self);
}

impl<S: AudioSource + ?Sized> AudioSource for Box<S> {
    fn open(&mut self, params: &CaptureParams) -> Result<Box<dyn CaptureStream>, DeviceError> {
        (**self).open(params)
    }
}
