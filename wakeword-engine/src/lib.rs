//! Wake-word detection engine library
//!
//! Streams audio from a capture source through an overlapping-window framer
//! into a pluggable classifier, applies per-label thresholds with debounce,
//! and reports detections to an injected event sink.

pub mod classifier;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod frame;
pub mod framer;
pub mod sink;
pub mod source;

// Re-export main types
pub use classifier::{Classifier, ClassifyError, EnergyClassifier, PredictionResult};
pub use config::{CaptureParams, ConfigError, EngineConfig, SAMPLE_RATE};
pub use debounce::{Debouncer, DetectionState};
pub use engine::{DetectionEngine, EngineState, EngineStats};
pub use frame::{AudioFrame, AudioSample, DetectionWindow};
pub use framer::{Framer, FramerError};
pub use sink::{ChannelSink, DetectionEvent, EngineEvent, ErrorKind, EventSink, LogSink};
pub use source::{
    AudioSource, CaptureStream, DeviceError, MicrophoneSource, ReadError, WavFileSource,
};
