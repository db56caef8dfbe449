//! Classifier capability
//!
//! The engine only sees this trait. Model loading and feature extraction
//! live behind it.

use crate::frame::DetectionWindow;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("Malformed window: {0}")]
    MalformedWindow(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Classifier panicked: {0}")]
    Panicked(String),
}

/// Per-label confidence scores for one window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionResult {
    scores: BTreeMap<String, f32>,
}

impl PredictionResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, label: impl Into<String>, confidence: f32) -> Self {
        self.insert(label, confidence);
        self
    }

    pub fn insert(&mut self, label: impl Into<String>, confidence: f32) {
        self.scores.insert(label.into(), confidence);
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.scores.get(label).copied()
    }

    /// Scores in label order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.scores.iter().map(|(label, &score)| (label.as_str(), score))
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl<L: Into<String>> FromIterator<(L, f32)> for PredictionResult {
    fn from_iter<I: IntoIterator<Item = (L, f32)>>(iter: I) -> Self {
        Self {
            scores: iter.into_iter().map(|(l, s)| (l.into(), s)).collect(),
        }
    }
}

/// Maps an audio window to per-label confidence scores
///
/// Implementations must be deterministic for a given window and loaded
/// model state, and may take tens of milliseconds per call.
pub trait Classifier: Send + Sync {
    fn classify(&self, window: &DetectionWindow) -> Result<PredictionResult, ClassifyError>;
}

impl<F> Classifier for F
where
    F: Fn(&DetectionWindow) -> Result<PredictionResult, ClassifyError> + Send + Sync,
{
    fn classify(&self, window: &DetectionWindow) -> Result<PredictionResult, ClassifyError> {
        self(window)
    }
}

/// Reference classifier scoring a single label by window loudness
///
/// RMS energy is normalized to full scale and mapped linearly onto
/// [0, 1] between `floor` and `ceiling`. Useful for wiring and tests; it
/// knows nothing about speech.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    label: String,
    floor: f32,
    ceiling: f32,
}

impl EnergyClassifier {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            floor: 0.01,
            ceiling: 0.4,
        }
    }

    /// Set the RMS range mapped onto [0, 1]
    pub fn with_range(mut self, floor: f32, ceiling: f32) -> Self {
        self.floor = floor;
        self.ceiling = ceiling;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn rms(samples: &[i16]) -> f32 {
        let energy: f64 = samples
            .iter()
            .map(|&s| {
                let normalized = s as f64 / i16::MAX as f64;
                normalized * normalized
            })
            .sum();

        (energy / samples.len() as f64).sqrt() as f32
    }
}

impl Classifier for EnergyClassifier {
    fn classify(&self, window: &DetectionWindow) -> Result<PredictionResult, ClassifyError> {
        if window.is_empty() {
            return Err(ClassifyError::MalformedWindow("empty window".to_string()));
        }
        if self.ceiling <= self.floor {
            return Err(ClassifyError::Inference(format!(
                "invalid energy range {}..{}",
                self.floor, self.ceiling
            )));
        }

        let rms = Self::rms(window.samples());
        let confidence = ((rms - self.floor) / (self.ceiling - self.floor)).clamp(0.0, 1.0);
        trace!("Window {} rms={:.4} -> {:.3}", window.sequence(), rms, confidence);

        Ok(PredictionResult::new().with(self.label.clone(), confidence))
    }
}
