use std::{sync::Arc, time::Duration};

use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Work performed on every watchdog tick.
pub trait WatchdogTarget: Send + Sync + 'static {
    /// Runs one inactivity check.
    fn watchdog_tick(&self);
}

/// Periodic task independent of request traffic.
#[derive(Debug)]
pub struct Watchdog;

impl Watchdog {
    /// Spawns the loop on the current tokio runtime.
    ///
    /// The first check runs one `tick` after spawning.
    #[must_use]
    pub fn spawn(target: Arc<dyn WatchdogTarget>, tick: Duration) -> WatchdogHandle {
        let tick = tick.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(tick_ms = tick.as_millis(), "watchdog started");
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!(ticks, "watchdog shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        ticks += 1;
                        debug!(ticks, "watchdog tick");
                        target.watchdog_tick();
                    }
                }
            }
        });
        WatchdogHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

/// Handle to a running watchdog. Dropping it leaves the task running.
#[derive(Debug)]
pub struct WatchdogHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals the loop and waits for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(%err, "watchdog task ended abnormally");
            }
        }
    }
}
