use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tracing::info;

use super::{SportModeFrame, VelocitySink};
use crate::errors::ActuatorError;

/// Records frames in memory instead of driving hardware.
///
/// Only frame changes are logged so a steady command stream stays quiet.
#[derive(Debug, Default)]
pub struct SimulatedSink {
    frames: Mutex<Vec<SportModeFrame>>,
}

impl SimulatedSink {
    /// Every frame received, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<SportModeFrame> {
        self.frames.lock().clone()
    }

    /// Number of zero frames received.
    #[must_use]
    pub fn stop_frames(&self) -> usize {
        self.frames.lock().iter().filter(|frame| frame.is_zero()).count()
    }
}

impl VelocitySink for SimulatedSink {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&self) -> Result<(), ActuatorError> {
        info!("running in simulation mode");
        Ok(())
    }

    fn send(&self, frame: &SportModeFrame) -> Result<(), ActuatorError> {
        let mut frames = self.frames.lock();
        if frames.last() != Some(frame) {
            let [vx, vy, vyaw] = frame.velocity;
            info!("[SIM] command vx={vx:.2} vy={vy:.2} vyaw={vyaw:.2}");
        }
        frames.push(*frame);
        Ok(())
    }
}

/// Appends frames as JSON lines for an external driver process to consume.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesSink {
    /// Creates a sink writing to `path` once opened.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VelocitySink for JsonLinesSink {
    fn name(&self) -> &str {
        "json_lines"
    }

    fn open(&self) -> Result<(), ActuatorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| ActuatorError::Transport(err.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| ActuatorError::Transport(err.to_string()))?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    fn send(&self, frame: &SportModeFrame) -> Result<(), ActuatorError> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(ActuatorError::NotConnected)?;
        let line = json!({ "sent_at": Utc::now().to_rfc3339(), "frame": frame });
        let mut data =
            serde_json::to_vec(&line).map_err(|err| ActuatorError::Transport(err.to_string()))?;
        data.push(b'\n');
        file.write_all(&data)
            .and_then(|()| file.flush())
            .map_err(|err| ActuatorError::Transport(err.to_string()))
    }

    fn close(&self) {
        self.file.lock().take();
    }
}
