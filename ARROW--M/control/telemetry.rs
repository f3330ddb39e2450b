use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use arrow_telemetry::{ControlEvent, EventPublisher, JsonLinesLogger, LogLevel, LogRecord};
use serde_json::Value;

/// Builder for control telemetry sinks.
pub struct ControlTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    max_log_bytes: Option<u64>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControlTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            max_log_bytes: None,
            min_level: LogLevel::Debug,
            event_publisher: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Rotates the log once it grows past `bytes`.
    #[must_use]
    pub fn max_log_bytes(mut self, bytes: Option<u64>) -> Self {
        self.max_log_bytes = bytes;
        self
    }

    /// Drops log records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<ControlTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(
                JsonLinesLogger::with_rotation(path, self.max_log_bytes)?.min_level(self.min_level),
            ),
            None => None,
        };
        Ok(ControlTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
            }),
        })
    }
}

/// Telemetry handle shared across control components.
#[derive(Clone)]
pub struct ControlTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for ControlTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlTelemetry")
            .field("module", &self.inner.module)
            .field("logger", &self.inner.logger.is_some())
            .field("events", &self.inner.publisher.is_some())
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLinesLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl ControlTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> ControlTelemetryBuilder {
        ControlTelemetryBuilder::new(module)
    }

    /// Module name stamped on records and events.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.inner.module
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.write(None, level, message, metadata)
    }

    /// Logs structured metadata tagged with the session it concerns.
    pub fn log_for(
        &self,
        session: &str,
        level: LogLevel,
        message: &str,
        metadata: Value,
    ) -> Result<()> {
        self.write(Some(session), level, message, metadata)
    }

    fn write(
        &self,
        session: Option<&str>,
        level: LogLevel,
        message: &str,
        metadata: Value,
    ) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Some(session) = session {
                record = record.with_session(session);
            }
            logger.log(&record.with_metadata(metadata))?;
        }
        Ok(())
    }

    /// Emits an event to the configured publisher.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.inner.publisher {
            publisher.publish(ControlEvent::new(&self.inner.module, event_type, payload))?;
        }
        Ok(())
    }
}
