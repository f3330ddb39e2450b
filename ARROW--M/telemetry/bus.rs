use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Event describing a control-plane transition (pilot change, dispatch, stop).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Unique identifier.
    pub id: Uuid,
    /// Component producing the event.
    pub source: String,
    /// Event type (e.g. `dispatch.executed`).
    pub event_type: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ControlEvent {
    /// Creates an event stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Sink for control events.
///
/// Publishing is synchronous: the control core emits events while handling
/// frames and from the watchdog, neither of which may block on I/O for long.
pub trait EventPublisher: Send + Sync {
    /// Publishes an event.
    fn publish(&self, event: ControlEvent) -> Result<()>;
}

/// In-memory broadcast bus with a bounded replay backlog.
#[derive(Debug, Clone)]
pub struct ControlEventBus {
    sender: broadcast::Sender<ControlEvent>,
    backlog: Arc<Mutex<VecDeque<ControlEvent>>>,
    backlog_limit: usize,
}

impl ControlEventBus {
    /// Creates a bus retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            backlog_limit: capacity,
        }
    }

    /// Subscribes to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained backlog, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ControlEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Retained events of the given type, oldest first.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<ControlEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl EventPublisher for ControlEventBus {
    fn publish(&self, event: ControlEvent) -> Result<()> {
        {
            let mut backlog = self.backlog.lock();
            backlog.push_back(event.clone());
            while backlog.len() > self.backlog_limit {
                backlog.pop_front();
            }
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Appends events as JSON lines, e.g. for an operator audit trail.
#[derive(Debug)]
pub struct FileEventPublisher {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileEventPublisher {
    /// Creates a publisher appending to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventPublisher for FileEventPublisher {
    fn publish(&self, event: ControlEvent) -> Result<()> {
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&data)?;
        file.flush()?;
        Ok(())
    }
}

/// Fans an event out to several publishers; the first error is reported after
/// every publisher has been tried.
pub struct FanoutPublisher {
    targets: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    /// Creates a fan-out over the given publishers.
    #[must_use]
    pub fn new(targets: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { targets }
    }
}

impl EventPublisher for FanoutPublisher {
    fn publish(&self, event: ControlEvent) -> Result<()> {
        let mut first_error = None;
        for target in &self.targets {
            if let Err(err) = target.publish(event.clone()) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
