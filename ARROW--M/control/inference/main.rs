//! Classifier contract shared by every inference backend.

/// Replay classifier used for simulation and tests.
pub mod scripted;

use std::{
    fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{InferenceError, ValidationError};

/// Labels assumed when a model ships without a labels file.
pub const DEFAULT_LABELS: [&str; 5] = ["Forward", "Right", "Left", "Rotate", "Idle"];

/// Raw image handed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Interleaved channels per pixel (1, 3 or 4).
    pub channels: u8,
    /// Pixel bytes, row major.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Frame {
    /// Builds an RGB frame.
    #[must_use]
    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            channels: 3,
            data,
        }
    }

    /// Uniform grey RGB frame, handy for replays. Dimensions too large to
    /// address yield an empty payload that fails [`validate`](Self::validate).
    #[must_use]
    pub fn blank(width: u32, height: u32) -> Self {
        let len = payload_len(width, height, 3).unwrap_or(0);
        Self::rgb(width, height, vec![127; len])
    }

    /// Checks the dimensions against the payload.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.width == 0 || self.height == 0 {
            return Err(ValidationError::MalformedFrame(format!(
                "zero dimension {}x{}",
                self.width, self.height
            )));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(ValidationError::MalformedFrame(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        let expected = payload_len(self.width, self.height, self.channels).ok_or_else(|| {
            ValidationError::MalformedFrame(format!(
                "{}x{}x{} exceeds addressable size",
                self.width, self.height, self.channels
            ))
        })?;
        if self.data.len() != expected {
            return Err(ValidationError::MalformedFrame(format!(
                "expected {expected} bytes, got {}",
                self.data.len()
            )));
        }
        Ok(())
    }
}

fn payload_len(width: u32, height: u32, channels: u8) -> Option<usize> {
    usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?
        .checked_mul(usize::from(channels))
}

/// Label and confidence produced for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSample {
    /// Predicted label.
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

impl ClassificationSample {
    /// Creates a sample, rejecting confidences outside `[0, 1]`.
    pub fn new(label: impl Into<String>, confidence: f64) -> Result<Self, InferenceError> {
        if !(confidence.is_finite() && (0.0..=1.0).contains(&confidence)) {
            return Err(InferenceError::Prediction(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
        Ok(Self {
            label: label.into(),
            confidence,
        })
    }
}

/// Description of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// File name of the model.
    pub name: String,
    /// Labels after reconciliation with the model outputs.
    pub classes: Vec<String>,
    /// Number of outputs the model produces.
    pub native_classes: usize,
    /// Set when the labels file disagreed with the model outputs.
    pub warning: Option<String>,
}

/// Image classifier backing the control loop.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Loads a model, replacing any previous one.
    async fn load_model(&self, path: &Path) -> Result<ModelInfo, InferenceError>;
    /// Classifies one frame.
    async fn predict(&self, frame: &Frame) -> Result<ClassificationSample, InferenceError>;
    /// Labels of the loaded model.
    fn classes(&self) -> Vec<String>;
    /// Whether a model is loaded.
    fn is_loaded(&self) -> bool;
    /// Drops the loaded model.
    fn unload(&self);
}

/// Path of the labels file that accompanies `model`: `<stem>_labels.txt`.
#[must_use]
pub fn labels_path(model: &Path) -> PathBuf {
    let stem = model
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    model.with_file_name(format!("{stem}_labels.txt"))
}

/// Reads the labels beside `model`, falling back to `defaults`.
#[must_use]
pub fn load_labels(model: &Path, defaults: &[String]) -> Vec<String> {
    let path = labels_path(model);
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let labels: Vec<String> = raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            info!(count = labels.len(), path = %path.display(), "loaded labels file");
            labels
        }
        Err(_) => {
            info!(?defaults, "using default labels");
            defaults.to_vec()
        }
    }
}

/// Pads with `Class_<n>` or truncates so there is one label per output.
///
/// Returns the adjusted labels and a warning when they did not match.
#[must_use]
pub fn reconcile_labels(
    mut labels: Vec<String>,
    native_classes: usize,
) -> (Vec<String>, Option<String>) {
    if labels.len() == native_classes {
        return (labels, None);
    }
    let warning = format!(
        "model output has {native_classes} classes but labels file lists {} classes",
        labels.len()
    );
    warn!("{warning}");
    if labels.len() < native_classes {
        let start = labels.len();
        labels.extend((start..native_classes).map(synthetic_label));
    } else {
        labels.truncate(native_classes);
    }
    (labels, Some(warning))
}

/// Label for an output index, synthesizing one past the end of `labels`.
#[must_use]
pub fn label_for_index(labels: &[String], index: usize) -> String {
    labels
        .get(index)
        .cloned()
        .unwrap_or_else(|| synthetic_label(index))
}

/// Index and value of the highest score; first wins on ties.
#[must_use]
pub fn argmax(scores: &[f64]) -> Option<(usize, f64)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if score <= top => best,
            _ => Some((index, score)),
        })
}

fn synthetic_label(index: usize) -> String {
    format!("Class_{index}")
}
