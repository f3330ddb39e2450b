#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Arbitration and dispatch core for a robot shared between many pilots.
//!
//! A classification stream from the current pilot is smoothed by a consensus
//! window, gated on confidence, throttled to the configured command interval
//! and turned into actuator commands. A watchdog stops the robot when the
//! stream goes quiet.

/// Error taxonomy shared by every component.
#[path = "../errors.rs"]
pub mod errors;

/// Injectable time source.
#[path = "../clock.rs"]
pub mod clock;

/// Tunable parameters and their validated setters.
#[path = "../settings.rs"]
pub mod settings;

/// Sliding label window with majority decisions.
#[path = "../consensus.rs"]
pub mod consensus;

/// Exclusive pilot control and the teacher system lock.
#[path = "../arbiter/main.rs"]
pub mod arbiter;

/// Actuator contract and the sport-mode velocity backends.
#[path = "../actuator/main.rs"]
pub mod actuator;

/// Classifier contract, frames and label reconciliation.
#[path = "../inference/main.rs"]
pub mod inference;

/// Rate-limited command dispatch and the inactivity watchdog.
#[path = "../dispatch/main.rs"]
pub mod dispatch;

/// Per-frame orchestration and status snapshots.
#[path = "../orchestrator.rs"]
pub mod orchestrator;

/// TOML runtime configuration.
#[path = "../config.rs"]
pub mod config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Runtime bootstrap wiring configuration to backends.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use arbiter::{lock::SystemLock, AcquireOutcome, Caller, PilotArbiter, PilotSession, SessionId};
pub use actuator::{
    sinks::{JsonLinesSink, SimulatedSink},
    Actuator, ActuatorProfile, MovementCommand, SportModeActuator, SportModeFrame, VelocitySink,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ActuatorBackend, RuntimeConfig};
pub use consensus::{is_idle, ConsensusBuffer, ConsensusDecision, IDLE_LABEL};
pub use dispatch::{
    watchdog::{Watchdog, WatchdogHandle, WatchdogTarget},
    CommandDispatcher, DispatchOutcome, DispatchState, COMMAND_TIMEOUT,
};
pub use errors::{
    ActuatorError, AuthorizationError, ControlError, InferenceError, StateError, ValidationError,
};
pub use inference::{
    scripted::{ScriptStep, ScriptedClassifier},
    ClassificationSample, Classifier, Frame, ModelInfo,
};
pub use orchestration_entry::ControlRuntime;
pub use orchestrator::{
    ControlService, ControlServiceBuilder, FrameReport, InferenceReport, ModelReport,
    StatusSnapshot,
};
pub use settings::{Settings, SettingsPatch, SettingsStore};
pub use telemetry::{ControlTelemetry, ControlTelemetryBuilder};
