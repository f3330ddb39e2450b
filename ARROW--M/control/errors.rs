use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller is not allowed to perform the operation.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationError {
    /// Caller does not hold pilot control.
    #[error("caller is not the current pilot")]
    NotPilot,
    /// Another session already holds control.
    #[error("control is held by another session ({owner})")]
    AlreadyControlled {
        /// Session currently in control.
        owner: String,
    },
    /// The teacher lock is engaged.
    #[error("system is locked by the teacher")]
    SystemLocked,
    /// Operation requires teacher privileges.
    #[error("teacher privileges required")]
    NotTeacher,
}

/// Service is not in a state that allows the operation.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateError {
    /// No classifier model has been loaded.
    #[error("no model loaded")]
    NoModelLoaded,
    /// Inference is switched off.
    #[error("inference is disabled")]
    InferenceDisabled,
}

/// Input rejected before touching shared state.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    /// Frame dimensions or payload are inconsistent.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// Setting value outside its permitted range.
    #[error("{field}={value} out of range: {reason}")]
    OutOfRange {
        /// Setting name.
        field: String,
        /// Rejected value.
        value: f64,
        /// Permitted range description.
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn out_of_range(field: &str, value: f64, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            field: field.to_string(),
            value,
            reason: reason.into(),
        }
    }
}

/// Failure reported by an actuator backend.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorError {
    /// The backend has not been connected.
    #[error("actuator not connected")]
    NotConnected,
    /// Command name not in the movement vocabulary.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// The backend failed to deliver a frame.
    #[error("actuator transport failure: {0}")]
    Transport(String),
}

/// Failure reported by the classifier.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferenceError {
    /// Model could not be loaded.
    #[error("failed to load model {path}: {reason}")]
    ModelLoad {
        /// Model path.
        path: String,
        /// Failure detail.
        reason: String,
    },
    /// Prediction failed.
    #[error("prediction failed: {0}")]
    Prediction(String),
    /// Predict was called without a model.
    #[error("classifier has no model loaded")]
    NotLoaded,
}

/// Top-level error returned by [`crate::orchestrator::ControlService`].
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlError {
    /// Caller lacks the required role.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    /// Service state forbids the request.
    #[error(transparent)]
    State(#[from] StateError),
    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Actuator backend failure.
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
    /// Classifier failure.
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

impl ControlError {
    /// Short family name used in logs and events.
    #[must_use]
    pub const fn family(&self) -> &'static str {
        match self {
            Self::Authorization(_) => "authorization",
            Self::State(_) => "state",
            Self::Validation(_) => "validation",
            Self::Actuator(_) => "actuator",
            Self::Inference(_) => "inference",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_convert_into_families() {
        let err: ControlError = AuthorizationError::NotPilot.into();
        assert_eq!(err.family(), "authorization");
        let err: ControlError = StateError::NoModelLoaded.into();
        assert_eq!(err.to_string(), "no model loaded");
        let err: ControlError = ValidationError::out_of_range("max_speed", 4.0, "(0, 1.5]").into();
        assert!(err.to_string().contains("max_speed=4"));
    }
}
