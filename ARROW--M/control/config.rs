use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    actuator::{ActuatorProfile, MIN_EMERGENCY_REPEATS},
    inference::DEFAULT_LABELS,
    settings::{Settings, SettingsPatch},
};

/// Runtime configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Initial settings, already validated.
    pub settings: Settings,
    /// Actuator backend and speeds.
    pub actuator: ActuatorConfig,
    /// Watchdog cadence and pilot expiry.
    pub watchdog: WatchdogConfig,
    /// Log and event sinks.
    pub telemetry: TelemetryConfig,
    /// Classifier defaults.
    pub model: ModelConfig,
    source_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            actuator: ActuatorConfig::default(),
            watchdog: WatchdogConfig::default(),
            telemetry: TelemetryConfig::default(),
            model: ModelConfig::default(),
            source_dir: PathBuf::from("."),
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from a TOML file. Relative paths are resolved
    /// against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading runtime config {}", path.display()))?;
        let source_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&raw, source_dir).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses configuration from a TOML string; relative paths stay relative
    /// to the working directory.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Self::parse(raw, PathBuf::from("."))
    }

    fn parse(raw: &str, source_dir: PathBuf) -> Result<Self> {
        let document: RuntimeConfigSerde = toml::from_str(raw)?;
        let settings = document.settings.merged(&Settings::default());
        settings
            .validate()
            .context("invalid [settings] section")?;

        let mut actuator = document.actuator;
        if actuator.emergency_repeats < MIN_EMERGENCY_REPEATS {
            bail!(
                "actuator.emergency_repeats must be at least {MIN_EMERGENCY_REPEATS}, got {}",
                actuator.emergency_repeats
            );
        }
        if !(actuator.forward_speed > 0.0 && actuator.turn_speed > 0.0) {
            bail!("actuator speeds must be positive");
        }
        if actuator.backend == ActuatorBackend::JsonLines && actuator.path.is_none() {
            bail!("actuator.path is required for the json_lines backend");
        }
        if document.watchdog.tick_ms == 0 {
            bail!("watchdog.tick_ms must be positive");
        }
        if document.model.default_labels.is_empty() {
            bail!("model.default_labels must not be empty");
        }

        let resolve = |candidate: &Path| {
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                source_dir.join(candidate)
            }
        };
        actuator.path = actuator.path.as_deref().map(resolve);
        let mut telemetry = document.telemetry;
        telemetry.log_path = telemetry.log_path.as_deref().map(resolve);
        telemetry.event_log = telemetry.event_log.as_deref().map(resolve);

        Ok(Self {
            settings,
            actuator,
            watchdog: document.watchdog,
            telemetry,
            model: document.model,
            source_dir,
        })
    }

    /// Resolves a path relative to the configuration file.
    #[must_use]
    pub fn resolve_path(&self, candidate: impl AsRef<Path>) -> PathBuf {
        let candidate = candidate.as_ref();
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.source_dir.join(candidate)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeConfigSerde {
    #[serde(default)]
    settings: SettingsPatch,
    #[serde(default)]
    actuator: ActuatorConfig,
    #[serde(default)]
    watchdog: WatchdogConfig,
    #[serde(default)]
    telemetry: TelemetryConfig,
    #[serde(default)]
    model: ModelConfig,
}

/// Where velocity frames go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorBackend {
    /// In-memory simulation.
    #[default]
    Simulated,
    /// JSON lines appended to `path`.
    JsonLines,
}

/// `[actuator]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: ActuatorBackend,
    /// Output file for the JSON-lines backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Default forward speed in m/s.
    #[serde(default = "default_forward_speed")]
    pub forward_speed: f64,
    /// Default turn rate in rad/s.
    #[serde(default = "default_turn_speed")]
    pub turn_speed: f64,
    /// Zero frames per emergency stop.
    #[serde(default = "default_emergency_repeats")]
    pub emergency_repeats: u32,
    /// Milliseconds between emergency frames.
    #[serde(default = "default_emergency_spacing_ms")]
    pub emergency_spacing_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            backend: ActuatorBackend::default(),
            path: None,
            forward_speed: default_forward_speed(),
            turn_speed: default_turn_speed(),
            emergency_repeats: default_emergency_repeats(),
            emergency_spacing_ms: default_emergency_spacing_ms(),
        }
    }
}

impl ActuatorConfig {
    /// Speeds and emergency behaviour for the actuator.
    #[must_use]
    pub const fn profile(&self) -> ActuatorProfile {
        ActuatorProfile {
            forward_speed: self.forward_speed,
            turn_speed: self.turn_speed,
            emergency_repeats: self.emergency_repeats,
            emergency_spacing: Duration::from_millis(self.emergency_spacing_ms),
        }
    }
}

/// `[watchdog]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Milliseconds between inactivity checks.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Seconds of pilot silence before control is released. Unset keeps
    /// pilots indefinitely.
    #[serde(default)]
    pub pilot_idle_timeout_secs: Option<f64>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            pilot_idle_timeout_secs: None,
        }
    }
}

impl WatchdogConfig {
    /// Tick period.
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Pilot expiry, ignoring non-positive values.
    #[must_use]
    pub fn pilot_idle_timeout(&self) -> Option<Duration> {
        self.pilot_idle_timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// `[telemetry]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// JSON-lines control log.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Rotation threshold for the control log.
    #[serde(default)]
    pub max_log_bytes: Option<u64>,
    /// File receiving control events.
    #[serde(default)]
    pub event_log: Option<PathBuf>,
    /// Events kept for late subscribers.
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_log_bytes: None,
            event_log: None,
            event_backlog: default_event_backlog(),
        }
    }
}

/// `[model]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Labels used when a model has no labels file.
    #[serde(default = "default_labels")]
    pub default_labels: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_labels: default_labels(),
        }
    }
}

const fn default_forward_speed() -> f64 {
    0.3
}

const fn default_turn_speed() -> f64 {
    0.5
}

const fn default_emergency_repeats() -> u32 {
    MIN_EMERGENCY_REPEATS
}

const fn default_emergency_spacing_ms() -> u64 {
    10
}

const fn default_tick_ms() -> u64 {
    100
}

const fn default_event_backlog() -> usize {
    256
}

fn default_labels() -> Vec<String> {
    DEFAULT_LABELS.iter().map(|label| (*label).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.actuator.backend, ActuatorBackend::Simulated);
        assert_eq!(config.watchdog.tick(), Duration::from_millis(100));
        assert_eq!(config.watchdog.pilot_idle_timeout(), None);
        assert_eq!(config.telemetry.event_backlog, 256);
        assert_eq!(config.model.default_labels.len(), 5);
    }

    #[test]
    fn rejects_invalid_settings() {
        let err = RuntimeConfig::from_toml_str("[settings]\nbuffer_size = 4\n").unwrap_err();
        assert!(format!("{err:#}").contains("consensus_required"));
        assert!(RuntimeConfig::from_toml_str("[actuator]\nemergency_repeats = 1\n").is_err());
        assert!(RuntimeConfig::from_toml_str("[actuator]\nbackend = \"json_lines\"\n").is_err());
        assert!(RuntimeConfig::from_toml_str("[bogus]\n").is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arrow.toml");
        fs::write(
            &path,
            r#"
[settings]
confidence_threshold = 0.6
buffer_size = 5
consensus_required = 3

[actuator]
backend = "json_lines"
path = "out/frames.jsonl"
emergency_spacing_ms = 5

[watchdog]
tick_ms = 50
pilot_idle_timeout_secs = 30.0

[telemetry]
log_path = "logs/control.log"
"#,
        )
        .unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.settings.buffer_size, 5);
        assert_eq!(
            config.actuator.path.as_deref(),
            Some(dir.path().join("out/frames.jsonl").as_path())
        );
        assert_eq!(
            config.actuator.profile().emergency_spacing,
            Duration::from_millis(5)
        );
        assert_eq!(
            config.watchdog.pilot_idle_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            config.telemetry.log_path,
            Some(dir.path().join("logs/control.log"))
        );
        assert_eq!(config.resolve_path("m.tflite"), dir.path().join("m.tflite"));
    }
}
