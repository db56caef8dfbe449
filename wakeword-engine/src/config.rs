//! Engine configuration
//!
//! Immutable snapshot handed to the engine at construction. Loaded from JSON
//! by the service binary; every field has a default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default capture sample rate (16kHz mono)
pub const SAMPLE_RATE: u32 = 16000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("hop_size ({hop}) must not exceed window_size ({window})")]
    HopTooLarge { hop: usize, window: usize },

    #[error("threshold for '{label}' must be between 0.0 and 1.0, got {value}")]
    ThresholdOutOfRange { label: String, value: f32 },

    #[error("retention horizon of {horizon_ms}ms holds fewer samples than one window ({window} samples)")]
    RetentionTooShort { horizon_ms: u64, window: usize },

    #[error("retention horizon of {horizon_ms}ms at {sample_rate} Hz does not fit in memory")]
    RetentionTooLarge { horizon_ms: u64, sample_rate: u32 },
}

/// Configuration for the detection engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Samples requested from the audio source per read
    pub frame_size: usize,

    /// Samples per classifier window
    pub window_size: usize,

    /// Stride between successive window starts
    pub hop_size: usize,

    /// Per-label confidence thresholds
    pub thresholds: BTreeMap<String, f32>,

    /// Threshold for labels missing from `thresholds`. `None` ignores them.
    pub default_threshold: Option<f32>,

    /// Minimum interval between two detections of the same label
    pub debounce_interval_ms: u64,

    /// Oldest buffered audio kept before samples are dropped
    pub retention_horizon_ms: u64,

    /// Upper bound on a single blocking read
    pub read_timeout_ms: u64,

    /// Consecutive read failures tolerated before the engine stops itself
    pub read_retry_budget: u32,

    /// Pause after a failed read before retrying
    pub read_retry_backoff_ms: u64,

    /// Input device name; `None` selects the host default
    pub device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: 1280,          // 80ms at 16kHz
            window_size: 16000,        // 1s
            hop_size: 8000,            // 50% overlap
            thresholds: BTreeMap::new(),
            default_threshold: Some(0.5),
            debounce_interval_ms: 2000,
            retention_horizon_ms: 5000,
            read_timeout_ms: 1000,
            read_retry_budget: 3,
            read_retry_backoff_ms: 100,
            device: None,
        }
    }
}

impl EngineConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Zero("sample_rate"));
        }
        if self.frame_size == 0 {
            return Err(ConfigError::Zero("frame_size"));
        }
        if self.window_size == 0 {
            return Err(ConfigError::Zero("window_size"));
        }
        if self.hop_size == 0 {
            return Err(ConfigError::Zero("hop_size"));
        }
        if self.hop_size > self.window_size {
            return Err(ConfigError::HopTooLarge {
                hop: self.hop_size,
                window: self.window_size,
            });
        }
        if self.read_timeout_ms == 0 {
            return Err(ConfigError::Zero("read_timeout_ms"));
        }
        if self.read_retry_budget == 0 {
            return Err(ConfigError::Zero("read_retry_budget"));
        }

        for (label, &value) in &self.thresholds {
            check_threshold(label, value)?;
        }
        if let Some(value) = self.default_threshold {
            check_threshold("<default>", value)?;
        }

        if self.retention_samples()? < self.window_size {
            return Err(ConfigError::RetentionTooShort {
                horizon_ms: self.retention_horizon_ms,
                window: self.window_size,
            });
        }

        Ok(())
    }

    /// Threshold applied to `label`, if any
    pub fn threshold_for(&self, label: &str) -> Option<f32> {
        self.thresholds.get(label).copied().or(self.default_threshold)
    }

    /// Number of samples covered by the retention horizon
    pub fn retention_samples(&self) -> Result<usize, ConfigError> {
        self.retention_horizon_ms
            .checked_mul(u64::from(self.sample_rate))
            .and_then(|total| usize::try_from(total / 1000).ok())
            .ok_or(ConfigError::RetentionTooLarge {
                horizon_ms: self.retention_horizon_ms,
                sample_rate: self.sample_rate,
            })
    }

    pub fn debounce_interval(&self) -> Duration {
        Duration::from_millis(self.debounce_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }

    /// Parameters handed to the audio source on open
    pub fn capture_params(&self) -> CaptureParams {
        CaptureParams {
            sample_rate: self.sample_rate,
            frame_size: self.frame_size,
            device: self.device.clone(),
        }
    }
}

fn check_threshold(label: &str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::ThresholdOutOfRange {
            label: label.to_string(),
            value,
        });
    }
    Ok(())
}

/// What an audio source needs to know to open a capture stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParams {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub device: Option<String>,
}
