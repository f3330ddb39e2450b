//! Turns consensus decisions into actuator calls.
//!
//! Rate-limit and idle-suppression checks are compare-and-update steps under
//! the state mutex. Each accepted movement bumps a generation counter. Actuator
//! calls happen after that mutex is released, under a separate gate; a
//! movement whose generation was superseded while it waited for the gate is
//! dropped, so the actuator never receives a decision older than the last
//! stop. Explicit halts bump an epoch that drops every movement reserved, or
//! predicted, before them.

/// Periodic inactivity check.
pub mod watchdog;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arrow_telemetry::LogLevel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::{
    actuator::Actuator,
    consensus::{is_idle, IDLE_LABEL},
    errors::ActuatorError,
    settings::Settings,
    telemetry::ControlTelemetry,
};

/// Inactivity after which a moving robot is stopped.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Dispatch bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchState {
    /// Last command sent to the actuator, or [`IDLE_LABEL`].
    pub last_label: String,
    /// When the last movement was dispatched.
    pub last_dispatch: Option<Instant>,
    /// Last dispatch or idle frame.
    pub last_activity: Option<Instant>,
    generation: u64,
}

impl Default for DispatchState {
    fn default() -> Self {
        Self {
            last_label: IDLE_LABEL.to_string(),
            last_dispatch: None,
            last_activity: None,
            generation: 0,
        }
    }
}

impl DispatchState {
    /// Whether the robot was last told to move.
    #[must_use]
    pub fn is_moving(&self) -> bool {
        !is_idle(&self.last_label)
    }

    /// Seconds since the last activity, measured at `now`.
    #[must_use]
    pub fn seconds_since_activity(&self, now: Instant) -> Option<f64> {
        self.last_activity
            .map(|last| now.saturating_duration_since(last).as_secs_f64())
    }

    fn settle_idle(&mut self) -> bool {
        if !self.is_moving() {
            return false;
        }
        self.last_label = IDLE_LABEL.to_string();
        self.generation += 1;
        true
    }
}

/// What one [`CommandDispatcher::process`] call did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// A movement was delivered to the actuator.
    pub executed: bool,
    /// A stop was issued, by idle suppression or by the timeout check.
    pub stopped: bool,
    /// Seconds since the last activity once the call finished.
    pub time_since_last_activity: f64,
}

/// Rate-limited command dispatcher with idle suppression and an inactivity
/// stop.
pub struct CommandDispatcher {
    actuator: Arc<dyn Actuator>,
    state: Mutex<DispatchState>,
    gate: Mutex<()>,
    halt_epoch: AtomicU64,
    telemetry: Option<ControlTelemetry>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("backend", &self.actuator.backend())
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    /// Creates a dispatcher driving `actuator`.
    #[must_use]
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self {
            actuator,
            state: Mutex::new(DispatchState::default()),
            gate: Mutex::new(()),
            halt_epoch: AtomicU64::new(0),
            telemetry: None,
        }
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Driven actuator.
    #[must_use]
    pub fn actuator(&self) -> Arc<dyn Actuator> {
        Arc::clone(&self.actuator)
    }

    /// Copy of the bookkeeping.
    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.state.lock().clone()
    }

    /// Counter bumped by every [`stop`](Self::stop) and
    /// [`emergency_stop`](Self::emergency_stop).
    #[must_use]
    pub fn halt_epoch(&self) -> u64 {
        self.halt_epoch.load(Ordering::SeqCst)
    }

    /// Handles one consensus decision.
    ///
    /// `command` is the decision's executable label, `confidence` the score of
    /// the frame that produced it.
    pub fn process(
        &self,
        command: &str,
        confidence: f64,
        settings: &Settings,
        now: Instant,
    ) -> DispatchOutcome {
        self.process_since(self.halt_epoch(), command, confidence, settings, now)
    }

    /// Like [`process`](Self::process) for a decision whose frame arrived at
    /// halt `epoch`. A movement is dropped if the robot was halted since.
    #[instrument(skip(self, settings, now), fields(threshold = settings.confidence_threshold))]
    pub fn process_since(
        &self,
        epoch: u64,
        command: &str,
        confidence: f64,
        settings: &Settings,
        now: Instant,
    ) -> DispatchOutcome {
        let frame_valid = confidence >= settings.confidence_threshold;
        let mut outcome = DispatchOutcome::default();

        if !is_idle(command) && frame_valid {
            let reserved = {
                let mut state = self.state.lock();
                if self.halt_epoch() != epoch {
                    info!(command, "decision predates a halt, dropped");
                    None
                } else if state.last_dispatch.map_or(true, |last| {
                    now.saturating_duration_since(last) >= settings.command_interval()
                }) {
                    state.last_dispatch = Some(now);
                    state.last_activity = Some(now);
                    state.last_label = command.to_string();
                    state.generation += 1;
                    Some(state.generation)
                } else {
                    None
                }
            };
            if let Some(generation) = reserved {
                outcome.executed = self.execute(command, settings.max_speed, generation, epoch);
            }
        } else {
            let needs_stop = {
                let mut state = self.state.lock();
                state.last_activity = Some(now);
                state.settle_idle()
            };
            if needs_stop {
                self.issue_stop("dispatch.stopped");
                outcome.stopped = true;
            }
        }

        outcome.stopped |= self.check_timeout(now);
        outcome.time_since_last_activity =
            self.state.lock().seconds_since_activity(now).unwrap_or(0.0);
        outcome
    }

    /// Stops a robot left moving for longer than [`COMMAND_TIMEOUT`].
    ///
    /// Returns whether a stop was issued. Only the call that observes the
    /// movement label clears it, so a stale movement yields exactly one stop.
    pub fn check_timeout(&self, now: Instant) -> bool {
        let expired = {
            let mut state = self.state.lock();
            let stale = state
                .last_activity
                .is_some_and(|last| now.saturating_duration_since(last) > COMMAND_TIMEOUT);
            stale && state.settle_idle()
        };
        if expired {
            warn!(
                timeout_secs = COMMAND_TIMEOUT.as_secs_f64(),
                "command timeout, stopping robot"
            );
            self.issue_stop("watchdog.stop");
        }
        expired
    }

    /// Marks the robot idle and halts it. Movements decided before the call
    /// are dropped.
    pub fn stop(&self) -> Result<(), ActuatorError> {
        self.halt_epoch.fetch_add(1, Ordering::SeqCst);
        self.state.lock().settle_idle();
        let _gate = self.gate.lock();
        self.actuator.stop()
    }

    /// Halts the robot ahead of any pending dispatch.
    ///
    /// Dispatches reserved before this call but not yet sent are dropped.
    pub fn emergency_stop(&self) -> Result<(), ActuatorError> {
        self.halt_epoch.fetch_add(1, Ordering::SeqCst);
        self.state.lock().settle_idle();
        let result = {
            let _gate = self.gate.lock();
            self.actuator.emergency_stop()
        };
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Critical,
                "emergency.stop",
                json!({ "delivered": result.is_ok() }),
            );
            let _ = tel.event("emergency.stop", json!({ "delivered": result.is_ok() }));
        }
        result
    }

    fn execute(&self, command: &str, speed: f64, generation: u64, epoch: u64) -> bool {
        let _gate = self.gate.lock();
        if self.halt_epoch() != epoch {
            info!(command, "dispatch dropped after halt");
            self.rollback(generation);
            return false;
        }
        if self.state.lock().generation != generation {
            info!(command, "dispatch superseded before delivery");
            return false;
        }
        match self.actuator.execute(command, Some(speed)) {
            Ok(()) => {
                info!(command, speed, "dispatched");
                if let Some(tel) = &self.telemetry {
                    let payload = json!({ "command": command, "speed": speed });
                    let _ = tel.log(LogLevel::Info, "dispatch.executed", payload.clone());
                    let _ = tel.event("dispatch.executed", payload);
                }
                true
            }
            Err(err) => {
                error!(command, %err, "dispatch failed, treating robot as stopped");
                self.rollback(generation);
                if let Err(stop_err) = self.actuator.stop() {
                    warn!(%stop_err, "fail-safe stop not delivered");
                }
                if let Some(tel) = &self.telemetry {
                    let _ = tel.log(
                        LogLevel::Error,
                        "dispatch.failed",
                        json!({ "command": command, "error": err }),
                    );
                }
                false
            }
        }
    }

    fn rollback(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.settle_idle();
        }
    }

    fn issue_stop(&self, reason: &str) {
        let result = {
            let _gate = self.gate.lock();
            self.actuator.stop()
        };
        match &result {
            Ok(()) => info!(reason, "robot stopped"),
            Err(err) => warn!(reason, %err, "stop not delivered"),
        }
        if let Some(tel) = &self.telemetry {
            let payload = json!({ "delivered": result.is_ok() });
            let _ = tel.log(LogLevel::Info, reason, payload.clone());
            let _ = tel.event(reason, payload);
        }
    }
}
