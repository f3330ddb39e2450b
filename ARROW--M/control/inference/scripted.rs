use std::{collections::VecDeque, path::Path};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    argmax, label_for_index, load_labels, reconcile_labels, ClassificationSample, Classifier,
    Frame, ModelInfo, DEFAULT_LABELS,
};
use crate::errors::InferenceError;

/// One scripted prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptStep {
    /// Raw per-class scores; the highest wins.
    Scores(Vec<f64>),
    /// Fixed label and confidence.
    Label {
        /// Predicted label.
        label: String,
        /// Confidence in `[0, 1]`.
        confidence: f64,
    },
}

#[derive(Debug, Default)]
struct Loaded {
    info: Option<ModelInfo>,
    steps: VecDeque<ScriptStep>,
}

/// Classifier replaying a fixed sequence of predictions.
///
/// Stands in for a real model runtime in simulation and tests. The model
/// file must exist, and labels come from the usual `<stem>_labels.txt`.
#[derive(Debug)]
pub struct ScriptedClassifier {
    native_classes: usize,
    default_labels: Vec<String>,
    script: Vec<ScriptStep>,
    state: Mutex<Loaded>,
}

impl ScriptedClassifier {
    /// Creates a classifier whose model exposes `native_classes` outputs.
    #[must_use]
    pub fn new(native_classes: usize, script: Vec<ScriptStep>) -> Self {
        Self {
            native_classes,
            default_labels: DEFAULT_LABELS.iter().map(|label| (*label).to_string()).collect(),
            script,
            state: Mutex::new(Loaded::default()),
        }
    }

    /// Replaces the labels used when no labels file exists.
    #[must_use]
    pub fn with_default_labels(mut self, labels: Vec<String>) -> Self {
        self.default_labels = labels;
        self
    }

    /// Appends steps to the running script.
    pub fn push_steps(&self, steps: impl IntoIterator<Item = ScriptStep>) {
        self.state.lock().steps.extend(steps);
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn load_model(&self, path: &Path) -> Result<ModelInfo, InferenceError> {
        if !path.is_file() {
            return Err(InferenceError::ModelLoad {
                path: path.display().to_string(),
                reason: "model file not found".into(),
            });
        }
        let labels = load_labels(path, &self.default_labels);
        let (classes, warning) = reconcile_labels(labels, self.native_classes);
        let info = ModelInfo {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            classes,
            native_classes: self.native_classes,
            warning,
        };
        info!(model = %info.name, classes = ?info.classes, "model loaded");
        let mut state = self.state.lock();
        state.info = Some(info.clone());
        state.steps = self.script.iter().cloned().collect();
        Ok(info)
    }

    async fn predict(&self, frame: &Frame) -> Result<ClassificationSample, InferenceError> {
        let mut state = self.state.lock();
        let classes = state
            .info
            .as_ref()
            .map(|info| info.classes.clone())
            .ok_or(InferenceError::NotLoaded)?;
        let step = state
            .steps
            .pop_front()
            .ok_or_else(|| InferenceError::Prediction("script exhausted".into()))?;
        drop(state);
        debug!(width = frame.width, height = frame.height, "scripted prediction");
        match step {
            ScriptStep::Scores(scores) => {
                let (index, confidence) = argmax(&scores)
                    .ok_or_else(|| InferenceError::Prediction("empty score vector".into()))?;
                ClassificationSample::new(label_for_index(&classes, index), confidence)
            }
            ScriptStep::Label { label, confidence } => ClassificationSample::new(label, confidence),
        }
    }

    fn classes(&self) -> Vec<String> {
        self.state
            .lock()
            .info
            .as_ref()
            .map(|info| info.classes.clone())
            .unwrap_or_default()
    }

    fn is_loaded(&self) -> bool {
        self.state.lock().info.is_some()
    }

    fn unload(&self) {
        let mut state = self.state.lock();
        state.info = None;
        state.steps.clear();
    }
}
