//! Per-label debounce state
//!
//! A sustained utterance spans several overlapping windows; each label is
//! allowed to fire once and then cools down for a fixed interval.
//! Expiry is checked lazily whenever the engine processes a cycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Debounce status of a single label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    /// Ready to fire
    Idle,

    /// Fired recently, suppressed until `until`
    CoolingDown { fired_at: Instant, until: Instant },
}

pub struct Debouncer {
    interval: Duration,
    labels: HashMap<String, DetectionState>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            labels: HashMap::new(),
        }
    }

    /// Move every label whose cooldown has elapsed back to idle
    pub fn expire(&mut self, now: Instant) {
        for (label, state) in self.labels.iter_mut() {
            if let DetectionState::CoolingDown { until, .. } = *state {
                if now >= until {
                    *state = DetectionState::Idle;
                    debug!("Label '{}' cooldown elapsed", label);
                }
            }
        }
    }

    /// Fire `label` if it is idle
    ///
    /// Returns true when the caller should emit a detection. The label is
    /// then cooling down until `now + interval`.
    pub fn try_fire(&mut self, label: &str, now: Instant) -> bool {
        let until = now + self.interval;

        match self.labels.get_mut(label) {
            Some(state @ DetectionState::Idle) => {
                *state = DetectionState::CoolingDown { fired_at: now, until };
                true
            }
            Some(DetectionState::CoolingDown { .. }) => false,
            None => {
                self.labels.insert(
                    label.to_string(),
                    DetectionState::CoolingDown { fired_at: now, until },
                );
                true
            }
        }
    }

    /// Current state of `label`; unseen labels are idle
    pub fn state(&self, label: &str) -> DetectionState {
        self.labels
            .get(label)
            .copied()
            .unwrap_or(DetectionState::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_within_interval() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(2));

        let fired = (0..10)
            .filter(|i| {
                let now = start + Duration::from_millis(100 * i);
                debouncer.expire(now);
                debouncer.try_fire("hey_aether", now)
            })
            .count();

        assert_eq!(fired, 1);
    }

    #[test]
    fn test_fires_again_after_cooldown() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));

        assert!(debouncer.try_fire("hey_aether", start));
        assert!(matches!(
            debouncer.state("hey_aether"),
            DetectionState::CoolingDown { .. }
        ));

        let later = start + Duration::from_millis(499);
        debouncer.expire(later);
        assert!(!debouncer.try_fire("hey_aether", later));

        let after = start + Duration::from_millis(500);
        debouncer.expire(after);
        assert_eq!(debouncer.state("hey_aether"), DetectionState::Idle);
        assert!(debouncer.try_fire("hey_aether", after));
    }

    #[test]
    fn test_labels_are_independent() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(1));

        assert!(debouncer.try_fire("alexa", now));
        assert!(debouncer.try_fire("jarvis", now));
        assert!(!debouncer.try_fire("alexa", now));
        assert_eq!(debouncer.state("computer"), DetectionState::Idle);
    }

    #[test]
    fn test_cooldown_window_recorded() {
        let now = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(750));
        debouncer.try_fire("x", now);

        match debouncer.state("x") {
            DetectionState::CoolingDown { fired_at, until } => {
                assert_eq!(fired_at, now);
                assert_eq!(until - fired_at, Duration::from_millis(750));
            }
            other => panic!("Expected CoolingDown, got {:?}", other),
        }
    }
}
