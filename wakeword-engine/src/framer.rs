//! Ring buffer that turns capture frames into classifier windows
//!
//! Frames of any size go in; windows of exactly `window_size` samples come
//! out, each starting `hop_size` samples after the previous one. Retention
//! is bounded: when the ring is full the oldest samples are dropped.

use crate::frame::{AudioFrame, AudioSample, DetectionWindow};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use std::time::Instant;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramerError {
    #[error("Out-of-order frame: sequence {got} after {last}")]
    OutOfOrder { last: u64, got: u64 },
}

pub struct Framer {
    ring: HeapRb<AudioSample>,
    window_size: usize,
    hop_size: usize,
    /// Stream index of the oldest retained sample
    read_offset: u64,
    next_window: u64,
    last_sequence: Option<u64>,
    last_captured_at: Option<Instant>,
    samples_dropped: u64,
}

impl Framer {
    /// Create a framer. Capacity is raised to one window if smaller.
    pub fn new(window_size: usize, hop_size: usize, retention_samples: usize) -> Self {
        let capacity = retention_samples.max(window_size).max(1);
        trace!(
            "Creating framer: window={}, hop={}, capacity={}",
            window_size,
            hop_size,
            capacity
        );

        Self {
            ring: HeapRb::new(capacity),
            window_size,
            hop_size,
            read_offset: 0,
            next_window: 0,
            last_sequence: None,
            last_captured_at: None,
            samples_dropped: 0,
        }
    }

    /// Append a frame's samples
    ///
    /// Returns the number of old samples dropped to stay within retention.
    pub fn push(&mut self, frame: &AudioFrame) -> Result<usize, FramerError> {
        if let Some(last) = self.last_sequence {
            if frame.sequence() <= last {
                return Err(FramerError::OutOfOrder {
                    last,
                    got: frame.sequence(),
                });
            }
        }
        self.last_sequence = Some(frame.sequence());
        self.last_captured_at = Some(frame.captured_at());

        let samples = frame.samples();
        let capacity = self.capacity();

        // Only the newest `capacity` samples of an oversized frame can survive
        let incoming = &samples[samples.len().saturating_sub(capacity)..];
        let mut dropped = samples.len() - incoming.len();

        let vacant = self.ring.vacant_len();
        if incoming.len() > vacant {
            dropped += self.ring.skip(incoming.len() - vacant);
        }

        self.ring.push_slice(incoming);

        if dropped > 0 {
            self.read_offset += dropped as u64;
            self.samples_dropped += dropped as u64;
            warn!(
                "Framer over retention, dropped {} oldest samples",
                dropped
            );
        }

        Ok(dropped)
    }

    /// Pop the next window if enough samples are buffered. Never blocks.
    pub fn try_pop_window(&mut self) -> Option<DetectionWindow> {
        if self.ring.occupied_len() < self.window_size {
            return None;
        }

        let samples: Vec<AudioSample> =
            self.ring.iter().take(self.window_size).copied().collect();
        let captured_at = self.last_captured_at.unwrap_or_else(Instant::now);

        let window = DetectionWindow::new(self.next_window, self.read_offset, captured_at, samples);

        let advanced = self.ring.skip(self.hop_size);
        self.read_offset += advanced as u64;
        self.next_window += 1;

        Some(window)
    }

    /// Number of buffered samples
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained samples
    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Total samples dropped by the retention policy
    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped
    }

    /// Discard buffered audio; sequence tracking restarts
    pub fn clear(&mut self) {
        let cleared = self.ring.skip(self.ring.occupied_len());
        self.read_offset += cleared as u64;
        self.last_sequence = None;
        self.last_captured_at = None;
    }
}
