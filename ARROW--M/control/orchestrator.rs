//! The control service: one explicit instance shared by every request
//! handler.
//!
//! Each component guards its own state. No lock is held across a classifier
//! or actuator call, and a failed request leaves arbitration, consensus and
//! dispatch state as it found them.

use std::{path::Path, sync::Arc, time::Duration};

use arrow_telemetry::LogLevel;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::{
    actuator::Actuator,
    arbiter::{lock::SystemLock, AcquireOutcome, Caller, PilotArbiter, SessionId},
    clock::{Clock, SystemClock},
    consensus::ConsensusBuffer,
    dispatch::{
        watchdog::{Watchdog, WatchdogHandle, WatchdogTarget},
        CommandDispatcher,
    },
    errors::{AuthorizationError, ControlError, InferenceError, StateError, ValidationError},
    inference::{Classifier, Frame},
    settings::{Settings, SettingsPatch, SettingsStore},
    telemetry::ControlTelemetry,
};

/// Result of one classification frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    /// Label predicted for this frame.
    pub label: String,
    /// Confidence of the prediction.
    pub confidence: f64,
    /// Threshold the confidence was gated against.
    pub threshold: f64,
    /// Window capacity.
    pub buffer_size: usize,
    /// Votes needed for a movement.
    pub consensus_required: usize,
    /// Window contents after this frame, oldest first.
    pub buffer_contents: Vec<String>,
    /// Most frequent label once the window is full.
    pub winning_label: Option<String>,
    /// Votes for the winning label.
    pub winning_count: usize,
    /// Command the window decided on.
    pub command_to_execute: String,
    /// Whether a movement reached the actuator.
    pub command_executed: bool,
    /// Seconds since the last dispatch or idle frame.
    pub time_since_last_activity: f64,
}

/// Read-only view of the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Whether frames are being classified.
    pub inference_enabled: bool,
    /// Whether the classifier holds a model.
    pub model_loaded: bool,
    /// Name of the loaded model.
    pub current_model: Option<String>,
    /// Actuator backend name.
    pub actuator_backend: String,
    /// Whether the actuator is connected.
    pub actuator_connected: bool,
    /// Whether the teacher lock is engaged.
    pub system_locked: bool,
    /// Current pilot.
    pub pilot: Option<SessionId>,
    /// Current settings.
    pub settings: Settings,
    /// Last command sent to the actuator.
    pub last_dispatched_label: String,
    /// Seconds since the last dispatch or idle frame.
    pub seconds_since_last_activity: Option<f64>,
    /// Window contents, oldest first.
    pub buffer_contents: Vec<String>,
}

/// Outcome of loading a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelReport {
    /// Model name.
    pub model: String,
    /// Labels in output order.
    pub classes: Vec<String>,
    /// Label reconciliation warning, if any.
    pub warning: Option<String>,
}

/// Outcome of starting or stopping inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceReport {
    /// Inference flag after the call.
    pub inference_enabled: bool,
    /// Actuator connectivity after the call.
    pub actuator_connected: bool,
}

/// Builder for [`ControlService`].
pub struct ControlServiceBuilder {
    actuator: Arc<dyn Actuator>,
    classifier: Arc<dyn Classifier>,
    settings: Settings,
    clock: Arc<dyn Clock>,
    pilot_idle_timeout: Option<Duration>,
    telemetry: Option<ControlTelemetry>,
}

impl ControlServiceBuilder {
    /// Initial settings.
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Releases pilots silent for longer than `timeout`.
    #[must_use]
    pub fn pilot_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pilot_idle_timeout = timeout;
        self
    }

    /// Attaches telemetry sinks.
    #[must_use]
    pub fn telemetry(mut self, telemetry: ControlTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the service.
    pub fn build(self) -> Result<ControlService, ValidationError> {
        let settings = SettingsStore::new(self.settings)?;
        let consensus = ConsensusBuffer::new(settings.snapshot().buffer_size);
        let system_lock = Arc::new(SystemLock::new());
        let mut dispatcher = CommandDispatcher::new(self.actuator);
        if let Some(tel) = &self.telemetry {
            dispatcher = dispatcher.with_telemetry(tel.clone());
        }
        Ok(ControlService {
            inner: Arc::new(ServiceInner {
                settings,
                consensus,
                arbiter: PilotArbiter::new(Arc::clone(&system_lock)),
                system_lock,
                dispatcher,
                classifier: self.classifier,
                clock: self.clock,
                current_model: RwLock::new(None),
                pilot_idle_timeout: self.pilot_idle_timeout,
                telemetry: self.telemetry,
            }),
        })
    }
}

struct ServiceInner {
    settings: SettingsStore,
    consensus: ConsensusBuffer,
    arbiter: PilotArbiter,
    system_lock: Arc<SystemLock>,
    dispatcher: CommandDispatcher,
    classifier: Arc<dyn Classifier>,
    clock: Arc<dyn Clock>,
    current_model: RwLock<Option<String>>,
    pilot_idle_timeout: Option<Duration>,
    telemetry: Option<ControlTelemetry>,
}

/// Arbitration and dispatch service. Cloning yields another handle to the
/// same instance.
#[derive(Clone)]
pub struct ControlService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlService")
            .field("pilot", &self.inner.arbiter.current().map(|p| p.session))
            .field("locked", &self.inner.system_lock.is_locked())
            .field("settings", &self.inner.settings.snapshot())
            .finish_non_exhaustive()
    }
}

impl ControlService {
    /// Starts a builder with default settings and the system clock.
    #[must_use]
    pub fn builder(
        actuator: Arc<dyn Actuator>,
        classifier: Arc<dyn Classifier>,
    ) -> ControlServiceBuilder {
        ControlServiceBuilder {
            actuator,
            classifier,
            settings: Settings::default(),
            clock: Arc::new(SystemClock),
            pilot_idle_timeout: None,
            telemetry: None,
        }
    }

    /// Claims pilot control. A change of owner empties the consensus window.
    pub fn acquire_control(&self, caller: &Caller) -> Result<AcquireOutcome, ControlError> {
        let now = self.inner.clock.now();
        let outcome = self.inner.arbiter.acquire(caller, now).map_err(|err| {
            info!(session = %caller.session, %err, "control request refused");
            err
        })?;
        if outcome == AcquireOutcome::Acquired {
            self.inner.consensus.clear();
            info!(session = %caller.session, teacher = caller.teacher, "pilot acquired control");
            self.emit(
                &caller.session,
                LogLevel::Info,
                "pilot.acquired",
                json!({ "session": caller.session, "teacher": caller.teacher }),
            );
        }
        Ok(outcome)
    }

    /// Gives up control and stops the robot.
    pub fn release_control(&self, caller: &Caller) -> Result<(), ControlError> {
        self.inner.arbiter.release(&caller.session)?;
        info!(session = %caller.session, "pilot released control");
        self.halt("pilot.released");
        self.emit(
            &caller.session,
            LogLevel::Info,
            "pilot.released",
            json!({ "session": caller.session }),
        );
        Ok(())
    }

    /// Evicts the current pilot and stops the robot. Teacher only.
    pub fn force_release(&self, caller: &Caller) -> Result<Option<SessionId>, ControlError> {
        require_teacher(caller)?;
        let evicted = self.inner.arbiter.force_release();
        self.inner.consensus.clear();
        self.halt("pilot.force_released");
        warn!(by = %caller.session, evicted = ?evicted, "control force released");
        self.emit(
            &caller.session,
            LogLevel::Warn,
            "pilot.force_released",
            json!({ "by": caller.session, "evicted": evicted }),
        );
        Ok(evicted)
    }

    /// Engages or clears the system lock. Engaging clears the pilot and stops
    /// the robot. Teacher only.
    pub fn set_locked(&self, caller: &Caller, locked: bool) -> Result<(), ControlError> {
        let previous = self.inner.system_lock.set_locked(locked, caller.teacher)?;
        if locked {
            let evicted = self.inner.arbiter.force_release();
            self.inner.consensus.clear();
            self.halt("system.locked");
            warn!(by = %caller.session, evicted = ?evicted, "system locked");
            self.emit(
                &caller.session,
                LogLevel::Warn,
                "system.locked",
                json!({ "by": caller.session, "evicted": evicted, "was_locked": previous }),
            );
        } else {
            info!(by = %caller.session, "system unlocked");
            self.emit(
                &caller.session,
                LogLevel::Info,
                "system.unlocked",
                json!({ "by": caller.session, "was_locked": previous }),
            );
        }
        Ok(())
    }

    /// Whether the system lock is engaged.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.system_lock.is_locked()
    }

    /// Whether `session` holds control.
    #[must_use]
    pub fn is_pilot(&self, session: &SessionId) -> bool {
        self.inner.arbiter.is_pilot(session)
    }

    /// Classifies one frame from the pilot and acts on the consensus.
    #[instrument(skip(self, caller, frame), fields(session = %caller.session))]
    pub async fn submit_frame(
        &self,
        caller: &Caller,
        frame: &Frame,
    ) -> Result<FrameReport, ControlError> {
        if self.inner.system_lock.is_locked() || !self.inner.arbiter.is_pilot(&caller.session) {
            return Err(AuthorizationError::NotPilot.into());
        }
        if !self.inner.classifier.is_loaded() {
            return Err(StateError::NoModelLoaded.into());
        }
        if !self.inner.settings.inference_enabled() {
            return Err(StateError::InferenceDisabled.into());
        }
        frame.validate()?;
        let epoch = self.inner.dispatcher.halt_epoch();

        let sample = self.inner.classifier.predict(frame).await.map_err(|err| {
            warn!(%err, "classification failed, frame dropped");
            err
        })?;
        if !(sample.confidence.is_finite() && (0.0..=1.0).contains(&sample.confidence)) {
            return Err(InferenceError::Prediction(format!(
                "confidence {} outside [0, 1]",
                sample.confidence
            ))
            .into());
        }

        let now = self.inner.clock.now();
        // Settings and control may have changed while the classifier ran.
        let settings = self.inner.settings.snapshot();
        if !settings.inference_enabled {
            return Err(StateError::InferenceDisabled.into());
        }
        if self.inner.system_lock.is_locked() || !self.inner.arbiter.touch(&caller.session, now) {
            return Err(AuthorizationError::NotPilot.into());
        }
        let (decision, contents) = self
            .inner
            .consensus
            .record(sample.label.clone(), settings.consensus_required);
        let outcome =
            self.inner
                .dispatcher
                .process_since(epoch, &decision.command, sample.confidence, &settings, now);

        Ok(FrameReport {
            label: sample.label,
            confidence: sample.confidence,
            threshold: settings.confidence_threshold,
            buffer_size: self.inner.consensus.capacity(),
            consensus_required: settings.consensus_required,
            buffer_contents: contents,
            winning_label: decision.winning_label,
            winning_count: decision.count,
            command_to_execute: decision.command,
            command_executed: outcome.executed,
            time_since_last_activity: outcome.time_since_last_activity,
        })
    }

    /// Consistent view of the whole service.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let now = self.inner.clock.now();
        let dispatch = self.inner.dispatcher.state();
        let actuator = self.inner.dispatcher.actuator();
        StatusSnapshot {
            inference_enabled: self.inner.settings.inference_enabled(),
            model_loaded: self.inner.classifier.is_loaded(),
            current_model: self.inner.current_model.read().clone(),
            actuator_backend: actuator.backend().to_string(),
            actuator_connected: actuator.is_connected(),
            system_locked: self.inner.system_lock.is_locked(),
            pilot: self.inner.arbiter.current().map(|pilot| pilot.session),
            settings: self.inner.settings.snapshot(),
            seconds_since_last_activity: dispatch.seconds_since_activity(now),
            last_dispatched_label: dispatch.last_label,
            buffer_contents: self.inner.consensus.contents(),
        }
    }

    /// Current settings.
    #[must_use]
    pub fn settings(&self) -> Settings {
        self.inner.settings.snapshot()
    }

    /// Applies a settings patch. Pilot or teacher.
    ///
    /// The patch is validated as a whole. A new `buffer_size` resizes the
    /// consensus window; switching inference off stops the robot.
    pub fn update_settings(
        &self,
        caller: &Caller,
        patch: &SettingsPatch,
    ) -> Result<Settings, ControlError> {
        self.require_pilot_or_teacher(caller)?;
        if patch.inference_enabled == Some(true) && !self.inner.classifier.is_loaded() {
            return Err(StateError::NoModelLoaded.into());
        }
        let before = self.inner.settings.snapshot();
        let after = self.inner.settings.apply(patch)?;
        self.inner.arbiter.touch(&caller.session, self.inner.clock.now());

        if after.buffer_size != before.buffer_size {
            self.inner.consensus.configure(after.buffer_size);
        }
        if after.inference_enabled && !before.inference_enabled {
            self.inner.dispatcher.actuator().connect();
        }
        if before.inference_enabled && !after.inference_enabled {
            self.halt("inference.stopped");
        }
        info!(by = %caller.session, ?after, "settings updated");
        self.emit(
            &caller.session,
            LogLevel::Info,
            "settings.updated",
            json!({ "by": caller.session, "patch": patch, "settings": after }),
        );
        Ok(after)
    }

    /// Loads a classifier model. Pilot or teacher.
    pub async fn load_model(
        &self,
        caller: &Caller,
        path: &Path,
    ) -> Result<ModelReport, ControlError> {
        self.require_pilot_or_teacher(caller)?;
        let info = self.inner.classifier.load_model(path).await.map_err(|err| {
            warn!(path = %path.display(), %err, "model load failed");
            err
        })?;
        *self.inner.current_model.write() = Some(info.name.clone());
        self.inner.consensus.clear();
        let level = if info.warning.is_some() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        self.emit(
            &caller.session,
            level,
            "model.loaded",
            json!({ "model": info.name, "classes": info.classes, "warning": info.warning }),
        );
        Ok(ModelReport {
            model: info.name,
            classes: info.classes,
            warning: info.warning,
        })
    }

    /// Drops the model, disabling inference and stopping the robot. Pilot or
    /// teacher.
    pub fn unload_model(&self, caller: &Caller) -> Result<(), ControlError> {
        self.require_pilot_or_teacher(caller)?;
        self.inner.settings.set_inference_enabled(false);
        self.inner.classifier.unload();
        let previous = self.inner.current_model.write().take();
        self.inner.consensus.clear();
        self.halt("model.unloaded");
        self.emit(
            &caller.session,
            LogLevel::Info,
            "model.unloaded",
            json!({ "by": caller.session, "model": previous }),
        );
        Ok(())
    }

    /// Connects the actuator and enables inference. Pilot or teacher.
    pub fn start_inference(&self, caller: &Caller) -> Result<InferenceReport, ControlError> {
        self.require_pilot_or_teacher(caller)?;
        if !self.inner.classifier.is_loaded() {
            return Err(StateError::NoModelLoaded.into());
        }
        let actuator_connected = self.inner.dispatcher.actuator().connect();
        if !actuator_connected {
            warn!("actuator unavailable, movement commands will be dropped");
        }
        self.inner.settings.set_inference_enabled(true);
        self.emit(
            &caller.session,
            LogLevel::Info,
            "inference.started",
            json!({ "by": caller.session, "actuator_connected": actuator_connected }),
        );
        Ok(InferenceReport {
            inference_enabled: true,
            actuator_connected,
        })
    }

    /// Disables inference and stops the robot. Pilot or teacher.
    pub fn stop_inference(&self, caller: &Caller) -> Result<InferenceReport, ControlError> {
        self.require_pilot_or_teacher(caller)?;
        self.inner.settings.set_inference_enabled(false);
        self.halt("inference.stopped");
        self.emit(
            &caller.session,
            LogLevel::Info,
            "inference.stopped",
            json!({ "by": caller.session }),
        );
        Ok(InferenceReport {
            inference_enabled: false,
            actuator_connected: self.inner.dispatcher.actuator().is_connected(),
        })
    }

    /// Disables inference and halts the robot ahead of any pending dispatch.
    /// Open to every caller. Returns whether the stop reached the actuator.
    pub fn emergency_stop(&self, caller: &Caller) -> bool {
        self.inner.settings.set_inference_enabled(false);
        let delivered = match self.inner.dispatcher.emergency_stop() {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "emergency stop not delivered");
                false
            }
        };
        warn!(by = %caller.session, delivered, "emergency stop");
        delivered
    }

    /// Starts the periodic inactivity check on the current tokio runtime.
    #[must_use]
    pub fn spawn_watchdog(&self, tick: Duration) -> WatchdogHandle {
        Watchdog::spawn(Arc::new(self.clone()), tick)
    }

    fn require_pilot_or_teacher(&self, caller: &Caller) -> Result<(), AuthorizationError> {
        if caller.teacher || self.inner.arbiter.is_pilot(&caller.session) {
            Ok(())
        } else {
            Err(AuthorizationError::NotPilot)
        }
    }

    fn halt(&self, reason: &str) {
        if let Err(err) = self.inner.dispatcher.stop() {
            warn!(reason, %err, "stop not delivered");
        }
    }

    fn emit(&self, session: &SessionId, level: LogLevel, event_type: &str, payload: Value) {
        if let Some(tel) = &self.inner.telemetry {
            let _ = tel.log_for(session.as_str(), level, event_type, payload.clone());
            let _ = tel.event(event_type, payload);
        }
    }
}

impl WatchdogTarget for ControlService {
    fn watchdog_tick(&self) {
        let now = self.inner.clock.now();
        self.inner.dispatcher.check_timeout(now);
        let Some(timeout) = self.inner.pilot_idle_timeout else {
            return;
        };
        if let Some(expired) = self.inner.arbiter.expire_idle(now, timeout) {
            self.inner.consensus.clear();
            self.halt("pilot.expired");
            warn!(session = %expired, timeout_secs = timeout.as_secs_f64(), "pilot expired");
            self.emit(
                &expired,
                LogLevel::Warn,
                "pilot.expired",
                json!({ "session": expired, "timeout_secs": timeout.as_secs_f64() }),
            );
        }
    }
}

fn require_teacher(caller: &Caller) -> Result<(), AuthorizationError> {
    if caller.teacher {
        Ok(())
    } else {
        Err(AuthorizationError::NotTeacher)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{
        actuator::testing::CountingActuator,
        clock::ManualClock,
        inference::{
            scripted::{ScriptStep, ScriptedClassifier},
            ClassificationSample, ModelInfo,
        },
    };
    use arrow_telemetry::ControlEventBus;
    use async_trait::async_trait;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Notify;

    struct Harness {
        service: ControlService,
        actuator: Arc<CountingActuator>,
        classifier: Arc<ScriptedClassifier>,
        clock: Arc<ManualClock>,
        bus: Arc<ControlEventBus>,
        dir: TempDir,
    }

    impl Harness {
        fn new(settings: Settings) -> Self {
            let actuator = Arc::new(CountingActuator::default());
            let classifier = Arc::new(ScriptedClassifier::new(5, Vec::new()));
            let clock = Arc::new(ManualClock::new());
            let bus = Arc::new(ControlEventBus::new(64));
            let telemetry = ControlTelemetry::builder("control")
                .event_publisher(bus.clone())
                .build()
                .unwrap();
            let service = ControlService::builder(actuator.clone(), classifier.clone())
                .settings(settings)
                .clock(clock.clone())
                .pilot_idle_timeout(Some(Duration::from_secs(30)))
                .telemetry(telemetry)
                .build()
                .unwrap();
            Self {
                service,
                actuator,
                classifier,
                clock,
                bus,
                dir: tempdir().unwrap(),
            }
        }

        async fn ready(&self, pilot: &Caller) {
            let model = self.dir.path().join("arrows.tflite");
            fs::write(&model, b"model").unwrap();
            self.service.acquire_control(pilot).unwrap();
            self.service.load_model(pilot, &model).await.unwrap();
            self.service.start_inference(pilot).unwrap();
        }

        fn script(&self, labels: &[(&str, f64)]) {
            self.classifier
                .push_steps(labels.iter().map(|(label, confidence)| ScriptStep::Label {
                    label: (*label).to_string(),
                    confidence: *confidence,
                }));
        }
    }

    /// Classifier that parks every prediction until released.
    struct HeldClassifier {
        entered: Notify,
        release: Notify,
        inner: ScriptedClassifier,
    }

    #[async_trait]
    impl Classifier for HeldClassifier {
        async fn load_model(&self, path: &Path) -> Result<ModelInfo, InferenceError> {
            self.inner.load_model(path).await
        }

        async fn predict(&self, frame: &Frame) -> Result<ClassificationSample, InferenceError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.predict(frame).await
        }

        fn classes(&self) -> Vec<String> {
            self.inner.classes()
        }

        fn is_loaded(&self) -> bool {
            self.inner.is_loaded()
        }

        fn unload(&self) {
            self.inner.unload();
        }
    }

    async fn held_service(
        dir: &TempDir,
    ) -> (ControlService, Arc<CountingActuator>, Arc<HeldClassifier>, Caller) {
        let actuator = Arc::new(CountingActuator::default());
        let forward = ScriptStep::Label {
            label: "Forward".into(),
            confidence: 0.95,
        };
        let classifier = Arc::new(HeldClassifier {
            entered: Notify::new(),
            release: Notify::new(),
            inner: ScriptedClassifier::new(5, vec![forward.clone(), forward]),
        });
        let service = ControlService::builder(actuator.clone(), classifier.clone())
            .settings(Settings {
                buffer_size: 1,
                consensus_required: 1,
                command_interval_secs: 0.0,
                ..Settings::default()
            })
            .build()
            .unwrap();
        let model = dir.path().join("arrows.tflite");
        fs::write(&model, b"model").unwrap();
        let pilot = Caller::pilot("a");
        service.acquire_control(&pilot).unwrap();
        service.load_model(&pilot, &model).await.unwrap();
        service.start_inference(&pilot).unwrap();
        (service, actuator, classifier, pilot)
    }

    fn small_window() -> Settings {
        Settings {
            buffer_size: 3,
            consensus_required: 2,
            command_interval_secs: 0.2,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn frames_require_pilot_model_and_inference() {
        let harness = Harness::new(Settings::default());
        let pilot = Caller::pilot("a");
        let frame = Frame::blank(2, 2);
        assert_eq!(
            harness.service.submit_frame(&pilot, &frame).await,
            Err(AuthorizationError::NotPilot.into())
        );
        harness.service.acquire_control(&pilot).unwrap();
        assert_eq!(
            harness.service.submit_frame(&pilot, &frame).await,
            Err(StateError::NoModelLoaded.into())
        );
        let model = harness.dir.path().join("m.tflite");
        fs::write(&model, b"model").unwrap();
        harness.service.load_model(&pilot, &model).await.unwrap();
        assert_eq!(
            harness.service.submit_frame(&pilot, &frame).await,
            Err(StateError::InferenceDisabled.into())
        );
    }

    #[tokio::test]
    async fn consensus_drives_dispatch() {
        let harness = Harness::new(small_window());
        let pilot = Caller::pilot("a");
        harness.ready(&pilot).await;
        harness.script(&[("Forward", 0.9), ("Forward", 0.9), ("Idle", 0.9), ("Idle", 0.9)]);
        let frame = Frame::blank(2, 2);

        let first = harness.service.submit_frame(&pilot, &frame).await.unwrap();
        assert_eq!(first.winning_label, None);
        assert_eq!(first.command_to_execute, "Idle");
        harness.clock.advance_secs(0.1);
        harness.service.submit_frame(&pilot, &frame).await.unwrap();
        harness.clock.advance_secs(0.1);
        let third = harness.service.submit_frame(&pilot, &frame).await.unwrap();
        assert_eq!(third.buffer_contents, vec!["Forward", "Forward", "Idle"]);
        assert_eq!(third.winning_label.as_deref(), Some("Forward"));
        assert_eq!(third.winning_count, 2);
        assert!(third.command_executed);
        assert_eq!(harness.actuator.executes(), 1);

        harness.clock.advance_secs(0.1);
        let fourth = harness.service.submit_frame(&pilot, &frame).await.unwrap();
        assert_eq!(fourth.command_to_execute, "Idle");
        assert_eq!(harness.actuator.stops(), 1);
    }

    #[tokio::test]
    async fn failed_frames_leave_state_untouched() {
        let harness = Harness::new(small_window());
        let pilot = Caller::pilot("a");
        harness.ready(&pilot).await;
        harness.script(&[("Forward", 0.9)]);
        let frame = Frame::blank(2, 2);
        harness.service.submit_frame(&pilot, &frame).await.unwrap();
        let before = harness.service.status();

        let bad = Frame::rgb(2, 2, vec![0; 3]);
        assert!(matches!(
            harness.service.submit_frame(&pilot, &bad).await,
            Err(ControlError::Validation(ValidationError::MalformedFrame(_)))
        ));
        assert!(matches!(
            harness.service.submit_frame(&pilot, &frame).await,
            Err(ControlError::Inference(InferenceError::Prediction(_)))
        ));
        assert_eq!(harness.service.status(), before);
    }

    #[tokio::test]
    async fn new_pilot_starts_with_empty_window() {
        let harness = Harness::new(small_window());
        let a = Caller::pilot("a");
        harness.ready(&a).await;
        harness.script(&[("Left", 0.9)]);
        harness.service.submit_frame(&a, &Frame::blank(1, 1)).await.unwrap();
        assert_eq!(harness.service.status().buffer_contents.len(), 1);

        let b = Caller::pilot("b");
        assert!(matches!(
            harness.service.acquire_control(&b),
            Err(ControlError::Authorization(AuthorizationError::AlreadyControlled { .. }))
        ));
        harness.service.release_control(&a).unwrap();
        assert_eq!(
            harness.service.acquire_control(&b),
            Ok(AcquireOutcome::Acquired)
        );
        assert!(harness.service.status().buffer_contents.is_empty());
        assert_eq!(harness.bus.of_type("pilot.acquired").len(), 2);
    }

    #[tokio::test]
    async fn lock_evicts_pilot_and_blocks_frames() {
        let harness = Harness::new(small_window());
        let pilot = Caller::pilot("a");
        let teacher = Caller::teacher("t");
        harness.ready(&pilot).await;
        assert_eq!(
            harness.service.set_locked(&pilot, true),
            Err(AuthorizationError::NotTeacher.into())
        );
        let stops = harness.actuator.stops();
        harness.service.set_locked(&teacher, true).unwrap();
        assert!(harness.service.is_locked());
        assert!(!harness.service.is_pilot(&pilot.session));
        assert_eq!(harness.actuator.stops(), stops + 1);
        assert_eq!(
            harness.service.submit_frame(&pilot, &Frame::blank(1, 1)).await,
            Err(AuthorizationError::NotPilot.into())
        );
        assert_eq!(
            harness.service.acquire_control(&teacher),
            Ok(AcquireOutcome::Acquired)
        );
        assert_eq!(
            harness.service.submit_frame(&teacher, &Frame::blank(1, 1)).await,
            Err(AuthorizationError::NotPilot.into())
        );
        harness.service.release_control(&teacher).unwrap();
        assert_eq!(
            harness.service.acquire_control(&pilot),
            Err(AuthorizationError::SystemLocked.into())
        );
        harness.service.set_locked(&teacher, false).unwrap();
        assert!(harness.service.acquire_control(&pilot).is_ok());
        assert_eq!(harness.bus.of_type("system.locked").len(), 1);
    }

    #[tokio::test]
    async fn force_release_is_teacher_only() {
        let harness = Harness::new(Settings::default());
        let pilot = Caller::pilot("a");
        harness.service.acquire_control(&pilot).unwrap();
        assert_eq!(
            harness.service.force_release(&Caller::pilot("b")),
            Err(AuthorizationError::NotTeacher.into())
        );
        assert_eq!(
            harness.service.force_release(&Caller::teacher("t")),
            Ok(Some(SessionId::new("a")))
        );
        assert_eq!(harness.service.status().pilot, None);
    }

    #[tokio::test]
    async fn emergency_stop_is_open_to_anyone() {
        let harness = Harness::new(small_window());
        let pilot = Caller::pilot("a");
        harness.ready(&pilot).await;
        assert!(harness.service.emergency_stop(&Caller::pilot("bystander")));
        assert_eq!(harness.actuator.emergencies(), 1);
        assert!(!harness.service.settings().inference_enabled);
        assert_eq!(harness.bus.of_type("emergency.stop").len(), 1);
    }

    #[tokio::test]
    async fn settings_updates_are_gated_and_resize_window() {
        let harness = Harness::new(Settings::default());
        let pilot = Caller::pilot("a");
        let patch = SettingsPatch {
            buffer_size: Some(4),
            consensus_required: Some(3),
            ..SettingsPatch::default()
        };
        assert_eq!(
            harness.service.update_settings(&pilot, &patch),
            Err(AuthorizationError::NotPilot.into())
        );
        harness.service.acquire_control(&pilot).unwrap();
        let applied = harness.service.update_settings(&pilot, &patch).unwrap();
        assert_eq!(applied.buffer_size, 4);
        assert_eq!(harness.service.inner.consensus.capacity(), 4);

        let enable = SettingsPatch {
            inference_enabled: Some(true),
            ..SettingsPatch::default()
        };
        assert_eq!(
            harness.service.update_settings(&Caller::teacher("t"), &enable),
            Err(StateError::NoModelLoaded.into())
        );
        let bad = SettingsPatch {
            consensus_required: Some(9),
            ..SettingsPatch::default()
        };
        assert!(matches!(
            harness.service.update_settings(&pilot, &bad),
            Err(ControlError::Validation(_))
        ));
        assert_eq!(harness.service.settings().consensus_required, 3);
    }

    #[tokio::test]
    async fn unload_disables_inference() {
        let harness = Harness::new(Settings::default());
        let pilot = Caller::pilot("a");
        harness.ready(&pilot).await;
        assert_eq!(
            harness.service.status().current_model.as_deref(),
            Some("arrows.tflite")
        );
        harness.service.unload_model(&pilot).unwrap();
        let status = harness.service.status();
        assert!(!status.inference_enabled);
        assert!(!status.model_loaded);
        assert_eq!(
            harness.service.start_inference(&pilot),
            Err(StateError::NoModelLoaded.into())
        );
    }

    #[tokio::test]
    async fn watchdog_tick_stops_and_expires() {
        let harness = Harness::new(Settings {
            buffer_size: 1,
            consensus_required: 1,
            ..Settings::default()
        });
        let pilot = Caller::pilot("a");
        harness.ready(&pilot).await;
        harness.script(&[("Forward", 0.95)]);
        let report = harness
            .service
            .submit_frame(&pilot, &Frame::blank(1, 1))
            .await
            .unwrap();
        assert!(report.command_executed);

        harness.clock.advance_secs(2.5);
        harness.service.watchdog_tick();
        harness.service.watchdog_tick();
        assert_eq!(harness.actuator.stops(), 1);
        assert_eq!(harness.service.status().last_dispatched_label, "Idle");
        assert!(harness.service.is_pilot(&pilot.session));

        harness.clock.advance_secs(30.0);
        harness.service.watchdog_tick();
        assert!(!harness.service.is_pilot(&pilot.session));
        assert_eq!(harness.bus.of_type("pilot.expired").len(), 1);
        assert_eq!(harness.bus.of_type("watchdog.stop").len(), 1);
    }

    #[tokio::test]
    async fn emergency_stop_preempts_frame_in_classification() {
        let dir = tempdir().unwrap();
        let (service, actuator, classifier, pilot) = held_service(&dir).await;
        let in_flight = tokio::spawn({
            let service = service.clone();
            let pilot = pilot.clone();
            async move { service.submit_frame(&pilot, &Frame::blank(2, 2)).await }
        });
        classifier.entered.notified().await;
        assert!(service.emergency_stop(&Caller::pilot("bystander")));
        classifier.release.notify_one();

        assert_eq!(
            in_flight.await.unwrap(),
            Err(StateError::InferenceDisabled.into())
        );
        assert_eq!(actuator.executes(), 0);
        assert_eq!(actuator.emergencies(), 1);
        assert_eq!(service.status().last_dispatched_label, "Idle");
    }

    #[tokio::test]
    async fn frame_predicted_across_a_halt_does_not_move() {
        let dir = tempdir().unwrap();
        let (service, actuator, classifier, pilot) = held_service(&dir).await;
        let in_flight = tokio::spawn({
            let service = service.clone();
            let pilot = pilot.clone();
            async move { service.submit_frame(&pilot, &Frame::blank(2, 2)).await }
        });
        classifier.entered.notified().await;
        service.emergency_stop(&pilot);
        service.start_inference(&pilot).unwrap();
        classifier.release.notify_one();

        let report = in_flight.await.unwrap().unwrap();
        assert_eq!(report.command_to_execute, "Forward");
        assert!(!report.command_executed);
        assert_eq!(actuator.executes(), 0);

        classifier.release.notify_one();
        let next = service.submit_frame(&pilot, &Frame::blank(2, 2)).await.unwrap();
        assert!(next.command_executed);
        assert_eq!(actuator.executes(), 1);
    }
}
