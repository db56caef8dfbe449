//! Audio frame and detection window types

use std::time::Instant;

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// A chunk of captured audio as delivered by the audio source
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    sequence: u64,
    captured_at: Instant,
    samples: Vec<AudioSample>,
}

impl AudioFrame {
    pub fn new(sequence: u64, captured_at: Instant, samples: Vec<AudioSample>) -> Self {
        Self {
            sequence,
            captured_at,
            samples,
        }
    }

    /// Monotonic sequence number assigned at capture
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Fixed-length classifier input assembled from one or more frames
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionWindow {
    sequence: u64,
    start_sample: u64,
    captured_at: Instant,
    samples: Vec<AudioSample>,
}

impl DetectionWindow {
    pub fn new(
        sequence: u64,
        start_sample: u64,
        captured_at: Instant,
        samples: Vec<AudioSample>,
    ) -> Self {
        Self {
            sequence,
            start_sample,
            captured_at,
            samples,
        }
    }

    /// Index of this window among all windows produced by its framer
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Stream position of the first sample in this window
    pub fn start_sample(&self) -> u64 {
        self.start_sample
    }

    /// Capture time of the newest frame contributing to this window
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn samples(&self) -> &[AudioSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
