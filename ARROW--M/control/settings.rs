use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;

/// Upper bound for `max_speed`.
pub const MAX_SPEED_LIMIT: f64 = 1.5;
/// Upper bound for `command_interval_secs`.
pub const MAX_COMMAND_INTERVAL_SECS: f64 = 10.0;
/// Upper bound for `buffer_size`.
pub const MAX_BUFFER_SIZE: usize = 100;

/// Tunable parameters shared by the control components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Minimum frame confidence for a movement to be dispatched.
    pub confidence_threshold: f64,
    /// Speed passed to the actuator with every movement.
    pub max_speed: f64,
    /// Minimum seconds between two movement dispatches.
    pub command_interval_secs: f64,
    /// Consensus window capacity.
    pub buffer_size: usize,
    /// Votes the winning label needs before it is executed.
    pub consensus_required: usize,
    /// Whether frames are classified at all.
    pub inference_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.80,
            max_speed: 0.3,
            command_interval_secs: 1.0,
            buffer_size: 10,
            consensus_required: 7,
            inference_enabled: false,
        }
    }
}

impl Settings {
    /// Command interval as a [`Duration`].
    #[must_use]
    pub fn command_interval(&self) -> Duration {
        Duration::from_secs_f64(self.command_interval_secs)
    }

    /// Checks every range and the cross-field constraint
    /// `consensus_required <= buffer_size`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_confidence_threshold(self.confidence_threshold)?;
        check_max_speed(self.max_speed)?;
        check_command_interval(self.command_interval_secs)?;
        check_buffer_size(self.buffer_size)?;
        check_consensus(self.consensus_required, self.buffer_size)
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    /// New confidence threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    /// New max speed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_speed: Option<f64>,
    /// New command interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_interval_secs: Option<f64>,
    /// New window capacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,
    /// New consensus requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_required: Option<usize>,
    /// New inference flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_enabled: Option<bool>,
}

impl SettingsPatch {
    /// Returns `base` with the patch applied, without validating.
    #[must_use]
    pub fn merged(&self, base: &Settings) -> Settings {
        Settings {
            confidence_threshold: self
                .confidence_threshold
                .unwrap_or(base.confidence_threshold),
            max_speed: self.max_speed.unwrap_or(base.max_speed),
            command_interval_secs: self
                .command_interval_secs
                .unwrap_or(base.command_interval_secs),
            buffer_size: self.buffer_size.unwrap_or(base.buffer_size),
            consensus_required: self.consensus_required.unwrap_or(base.consensus_required),
            inference_enabled: self.inference_enabled.unwrap_or(base.inference_enabled),
        }
    }
}

/// Shared settings guarded by a read/write lock.
///
/// Writers are validated; a rejected write leaves the store untouched.
/// Authorization of writers is the caller's concern.
#[derive(Debug, Default)]
pub struct SettingsStore {
    inner: RwLock<Settings>,
}

impl SettingsStore {
    /// Creates a store from validated initial settings.
    pub fn new(initial: Settings) -> Result<Self, ValidationError> {
        initial.validate()?;
        Ok(Self {
            inner: RwLock::new(initial),
        })
    }

    /// Consistent copy of the current settings.
    #[must_use]
    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    /// Whether inference is enabled.
    #[must_use]
    pub fn inference_enabled(&self) -> bool {
        self.inner.read().inference_enabled
    }

    /// Applies a patch atomically, returning the resulting settings.
    pub fn apply(&self, patch: &SettingsPatch) -> Result<Settings, ValidationError> {
        let mut guard = self.inner.write();
        let next = patch.merged(&guard);
        next.validate()?;
        *guard = next.clone();
        Ok(next)
    }

    /// Sets the confidence threshold.
    pub fn set_confidence_threshold(&self, value: f64) -> Result<(), ValidationError> {
        check_confidence_threshold(value)?;
        self.inner.write().confidence_threshold = value;
        Ok(())
    }

    /// Sets the max speed.
    pub fn set_max_speed(&self, value: f64) -> Result<(), ValidationError> {
        check_max_speed(value)?;
        self.inner.write().max_speed = value;
        Ok(())
    }

    /// Sets the command interval in seconds.
    pub fn set_command_interval_secs(&self, value: f64) -> Result<(), ValidationError> {
        check_command_interval(value)?;
        self.inner.write().command_interval_secs = value;
        Ok(())
    }

    /// Sets the window capacity; must stay at or above `consensus_required`.
    pub fn set_buffer_size(&self, value: usize) -> Result<(), ValidationError> {
        check_buffer_size(value)?;
        let mut guard = self.inner.write();
        check_consensus(guard.consensus_required, value)?;
        guard.buffer_size = value;
        Ok(())
    }

    /// Sets the consensus requirement; must not exceed `buffer_size`.
    pub fn set_consensus_required(&self, value: usize) -> Result<(), ValidationError> {
        let mut guard = self.inner.write();
        check_consensus(value, guard.buffer_size)?;
        guard.consensus_required = value;
        Ok(())
    }

    /// Switches inference on or off, returning the previous value.
    pub fn set_inference_enabled(&self, enabled: bool) -> bool {
        std::mem::replace(&mut self.inner.write().inference_enabled, enabled)
    }
}

fn check_confidence_threshold(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::out_of_range(
            "confidence_threshold",
            value,
            "[0, 1]",
        ))
    }
}

fn check_max_speed(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && value > 0.0 && value <= MAX_SPEED_LIMIT {
        Ok(())
    } else {
        Err(ValidationError::out_of_range(
            "max_speed",
            value,
            format!("(0, {MAX_SPEED_LIMIT}]"),
        ))
    }
}

fn check_command_interval(value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=MAX_COMMAND_INTERVAL_SECS).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::out_of_range(
            "command_interval_secs",
            value,
            format!("[0, {MAX_COMMAND_INTERVAL_SECS}]"),
        ))
    }
}

#[allow(clippy::cast_precision_loss)]
fn check_buffer_size(value: usize) -> Result<(), ValidationError> {
    if (1..=MAX_BUFFER_SIZE).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::out_of_range(
            "buffer_size",
            value as f64,
            format!("[1, {MAX_BUFFER_SIZE}]"),
        ))
    }
}

#[allow(clippy::cast_precision_loss)]
fn check_consensus(required: usize, buffer_size: usize) -> Result<(), ValidationError> {
    if (1..=buffer_size).contains(&required) {
        Ok(())
    } else {
        Err(ValidationError::out_of_range(
            "consensus_required",
            required as f64,
            format!("[1, buffer_size={buffer_size}]"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.command_interval(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let store = SettingsStore::default();
        assert!(store.set_confidence_threshold(1.2).is_err());
        assert!(store.set_max_speed(0.0).is_err());
        assert!(store.set_command_interval_secs(f64::NAN).is_err());
        assert!(store.set_buffer_size(0).is_err());
        assert_eq!(store.snapshot(), Settings::default());
    }

    #[test]
    fn consensus_cannot_exceed_buffer() {
        let store = SettingsStore::default();
        assert!(store.set_consensus_required(11).is_err());
        assert!(store.set_buffer_size(5).is_err());
        store.set_consensus_required(3).unwrap();
        store.set_buffer_size(5).unwrap();
        assert_eq!(store.snapshot().buffer_size, 5);
    }

    #[test]
    fn patch_is_all_or_nothing() {
        let store = SettingsStore::default();
        let bad = SettingsPatch {
            max_speed: Some(0.5),
            buffer_size: Some(3),
            ..SettingsPatch::default()
        };
        assert!(store.apply(&bad).is_err());
        assert!((store.snapshot().max_speed - 0.3).abs() < f64::EPSILON);

        let good = SettingsPatch {
            buffer_size: Some(3),
            consensus_required: Some(2),
            ..SettingsPatch::default()
        };
        let applied = store.apply(&good).unwrap();
        assert_eq!(applied.buffer_size, 3);
        assert_eq!(applied.consensus_required, 2);
    }

    #[test]
    fn inference_toggle_reports_previous() {
        let store = SettingsStore::default();
        assert!(!store.set_inference_enabled(true));
        assert!(store.set_inference_enabled(false));
    }
}
