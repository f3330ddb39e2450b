//! Runtime bootstrap: turns a [`RuntimeConfig`] into a running control
//! service with its sinks and watchdog.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use arrow_telemetry::{ControlEventBus, EventPublisher, FanoutPublisher, FileEventPublisher};
use parking_lot::Mutex;
use tracing::info;

use crate::{
    actuator::{
        sinks::{JsonLinesSink, SimulatedSink},
        Actuator, SportModeActuator,
    },
    config::{ActuatorBackend, RuntimeConfig},
    dispatch::watchdog::WatchdogHandle,
    inference::Classifier,
    orchestrator::ControlService,
    telemetry::ControlTelemetry,
};

/// Control service together with its event bus and watchdog.
pub struct ControlRuntime {
    service: ControlService,
    actuator: Arc<dyn Actuator>,
    events: Arc<ControlEventBus>,
    tick: Duration,
    watchdog: Mutex<Option<WatchdogHandle>>,
}

impl std::fmt::Debug for ControlRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlRuntime")
            .field("service", &self.service)
            .field("tick", &self.tick)
            .field("watchdog_running", &self.watchdog.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl ControlRuntime {
    /// Wires the configured actuator backend, telemetry sinks and settings
    /// around `classifier`.
    pub fn from_config(config: &RuntimeConfig, classifier: Arc<dyn Classifier>) -> Result<Self> {
        let events = Arc::new(ControlEventBus::new(config.telemetry.event_backlog));
        let publisher: Arc<dyn EventPublisher> = match &config.telemetry.event_log {
            Some(path) => {
                let file = FileEventPublisher::new(path)
                    .with_context(|| format!("opening event log {}", path.display()))?;
                Arc::new(FanoutPublisher::new(vec![
                    events.clone() as Arc<dyn EventPublisher>,
                    Arc::new(file),
                ]))
            }
            None => events.clone(),
        };

        let mut builder = ControlTelemetry::builder("arrow-control")
            .event_publisher(publisher)
            .max_log_bytes(config.telemetry.max_log_bytes);
        if let Some(path) = &config.telemetry.log_path {
            builder = builder.log_path(path);
        }
        let telemetry = builder.build().context("initialising control telemetry")?;

        let profile = config.actuator.profile();
        let actuator: Arc<dyn Actuator> = match config.actuator.backend {
            ActuatorBackend::Simulated => {
                Arc::new(SportModeActuator::new(SimulatedSink::default(), profile))
            }
            ActuatorBackend::JsonLines => {
                let path = config
                    .actuator
                    .path
                    .as_ref()
                    .context("actuator.path is required for the json_lines backend")?;
                Arc::new(SportModeActuator::new(JsonLinesSink::new(path), profile))
            }
        };
        info!(backend = actuator.backend(), "actuator backend selected");

        let service = ControlService::builder(Arc::clone(&actuator), classifier)
            .settings(config.settings.clone())
            .pilot_idle_timeout(config.watchdog.pilot_idle_timeout())
            .telemetry(telemetry)
            .build()
            .context("building control service")?;

        Ok(Self {
            service,
            actuator,
            events,
            tick: config.watchdog.tick(),
            watchdog: Mutex::new(None),
        })
    }

    /// Service handle for request handlers.
    #[must_use]
    pub const fn service(&self) -> &ControlService {
        &self.service
    }

    /// In-memory event bus.
    #[must_use]
    pub fn events(&self) -> Arc<ControlEventBus> {
        Arc::clone(&self.events)
    }

    /// Starts the watchdog on the current tokio runtime. Idempotent.
    pub fn start(&self) {
        let mut watchdog = self.watchdog.lock();
        if watchdog.is_none() {
            *watchdog = Some(self.service.spawn_watchdog(self.tick));
        }
    }

    /// Stops the watchdog and disconnects the actuator, halting the robot.
    pub async fn shutdown(&self) {
        let handle = self.watchdog.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.actuator.disconnect();
        info!("control runtime stopped");
    }
}
