use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
    /// Safety-critical condition (emergency stops, forced releases).
    Critical,
}

/// One line of the control log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the record (`control.dispatch`, `control.arbiter`, ...).
    pub component: String,
    /// Severity.
    pub level: LogLevel,
    /// Short dotted message key.
    pub message: String,
    /// Pilot session the record relates to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Arbitrary JSON fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            component: component.into(),
            level,
            message: message.into(),
            session: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// Tags the record with a session identifier.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Merges the fields of a JSON object into the metadata map.
    ///
    /// Non-object values are stored under `value`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("value".into(), other);
            }
        }
        self
    }
}

struct LogFile {
    file: File,
    written: u64,
}

/// Thread-safe JSON-lines logger.
///
/// When `max_bytes` is set the current file is renamed to `<file>.1` once a
/// write would take it past the budget, and a fresh file is started. Only one
/// rotated generation is kept.
pub struct JsonLinesLogger {
    path: PathBuf,
    max_bytes: Option<u64>,
    min_level: LogLevel,
    writer: Mutex<LogFile>,
}

impl std::fmt::Debug for JsonLinesLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesLogger")
            .field("path", &self.path)
            .field("max_bytes", &self.max_bytes)
            .field("min_level", &self.min_level)
            .finish()
    }
}

impl JsonLinesLogger {
    /// Creates or opens a logger at the desired path without rotation.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_rotation(path, None)
    }

    /// Creates or opens a logger that rotates after `max_bytes`.
    pub fn with_rotation(path: impl AsRef<Path>, max_bytes: Option<u64>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes: max_bytes.filter(|bytes| *bytes > 0),
            min_level: LogLevel::Debug,
            writer: Mutex::new(LogFile { file, written }),
        })
    }

    /// Drops records below `level`.
    #[must_use]
    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Writes a record as a single JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        if record.level < self.min_level {
            return Ok(());
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        if let Some(budget) = self.max_bytes {
            if writer.written > 0 && writer.written + line.len() as u64 > budget {
                self.rotate(&mut writer)?;
            }
        }
        writer.file.write_all(&line)?;
        writer.file.flush()?;
        writer.written += line.len() as u64;
        Ok(())
    }

    /// Returns the active log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path the previous generation is moved to on rotation.
    #[must_use]
    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".1");
        self.path.with_file_name(name)
    }

    fn rotate(&self, writer: &mut LogFile) -> Result<()> {
        writer.file.flush()?;
        fs::rename(&self.path, self.rotated_path())?;
        writer.file = open_append(&self.path)?;
        writer.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLinesLogger::new(dir.path().join("control.log")).unwrap();
        logger
            .log(
                &LogRecord::new("control.dispatch", LogLevel::Info, "dispatch.executed")
                    .with_session("pilot-a")
                    .with_metadata(serde_json::json!({ "label": "Forward" })),
            )
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"dispatch.executed\""));
        assert!(content.contains("\"session\":\"pilot-a\""));
        assert!(content.contains("\"label\":\"Forward\""));
    }

    #[test]
    fn rotates_past_budget() {
        let dir = tempdir().unwrap();
        let logger =
            JsonLinesLogger::with_rotation(dir.path().join("control.log"), Some(200)).unwrap();
        for _ in 0..6 {
            logger
                .log(&LogRecord::new("control", LogLevel::Info, "tick"))
                .unwrap();
        }
        assert!(logger.rotated_path().exists());
        let current = fs::metadata(logger.path()).unwrap().len();
        assert!(current <= 200);
    }

    #[test]
    fn filters_below_min_level() {
        let dir = tempdir().unwrap();
        let logger = JsonLinesLogger::new(dir.path().join("control.log"))
            .unwrap()
            .min_level(LogLevel::Warn);
        logger
            .log(&LogRecord::new("control", LogLevel::Info, "quiet"))
            .unwrap();
        logger
            .log(&LogRecord::new("control", LogLevel::Critical, "loud"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(!content.contains("quiet"));
        assert!(content.contains("CRITICAL"));
    }
}
