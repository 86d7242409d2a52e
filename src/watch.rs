//! Polling rescan trigger.
//!
//! Stands in for an external notifier: every tick it fingerprints the
//! modification time and size of the root configuration, each fragment,
//! each `conf-dir` and the lease file, and calls
//! [`LeaseMonitor::rescan`] when the fingerprint moves.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::change::ChangeEvent;
use crate::error::Result;
use crate::monitor::LeaseMonitor;

/// `(path, modified, len)` for every watched path; missing paths carry `None`.
type Fingerprint = Vec<(PathBuf, Option<(SystemTime, u64)>)>;

fn fingerprint(paths: &[PathBuf]) -> Fingerprint {
    paths
        .iter()
        .map(|path| (path.clone(), stat(path)))
        .collect()
}

fn stat(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}

pub struct PollTrigger {
    monitor: Arc<LeaseMonitor>,
    interval: Duration,
    last: Option<Fingerprint>,
}

impl PollTrigger {
    /// Polls at the monitor's configured interval.
    pub fn new(monitor: Arc<LeaseMonitor>) -> Self {
        let interval = monitor.config().poll_interval();
        Self {
            monitor,
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Paths from the last good scan, or just the root configuration before
    /// the first one.
    async fn watch_paths(&self) -> Vec<PathBuf> {
        match self.monitor.last_snapshot().await {
            Some(snapshot) => snapshot.watch_paths(),
            None => vec![self.monitor.config().resolved_dnsmasq_config()],
        }
    }

    /// Rescans if anything watched changed since the previous poll.
    ///
    /// Returns `Ok(None)` when nothing changed. The first poll always
    /// rescans.
    pub async fn poll(&mut self) -> Result<Option<Vec<ChangeEvent>>> {
        let paths = self.watch_paths().await;
        let current = tokio::task::spawn_blocking(move || fingerprint(&paths)).await?;
        if self.last.as_ref() == Some(&current) {
            return Ok(None);
        }

        debug!("Watched files changed, rescanning");
        self.last = Some(current);
        self.monitor.rescan().await.map(Some)
    }

    /// Polls until the task is cancelled. Scan failures are logged and retried
    /// on the next change.
    pub async fn run(mut self) {
        info!("Polling dnsmasq files every {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.poll().await {
                Ok(Some(events)) if !events.is_empty() => {
                    info!("Detected {} lease changes", events.len());
                }
                Ok(_) => {}
                Err(error) => warn!("Rescan failed: {}", error),
            }
        }
    }
}
