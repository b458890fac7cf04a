use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Outcome of one pass over the cache directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Regular files inspected
    pub scanned: usize,
    pub deleted: usize,
    /// Entries that could not be inspected or removed
    pub errors: usize,
}

/// Periodic background removal of expired cache entries
pub struct CacheEvictor;

impl CacheEvictor {
    /// Spawn the sweep loop. The first sweep runs one `interval` after start.
    ///
    /// With a zero interval, an empty directory or a zero TTL nothing is
    /// spawned and the returned handle is inert.
    pub fn start(interval: Duration, dir: impl Into<PathBuf>, ttl: Duration) -> EvictorHandle {
        let dir = dir.into();
        if interval.is_zero() || dir.as_os_str().is_empty() || ttl.is_zero() {
            info!(
                "Cache evictor not started (interval={:?}, dir={:?}, ttl={:?})",
                interval, dir, ttl
            );
            return EvictorHandle {
                stop_tx: None,
                task: None,
            };
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            info!(
                "Cache evictor started: dir={:?}, ttl={:?}, interval={:?}",
                dir, ttl, interval
            );
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let sweep_dir = dir.clone();
                        // A stop request does not interrupt a running sweep
                        match tokio::task::spawn_blocking(move || sweep_expired(&sweep_dir, ttl)).await {
                            Ok(report) => info!(
                                scanned = report.scanned,
                                deleted = report.deleted,
                                errors = report.errors,
                                "Cache sweep completed"
                            ),
                            Err(e) => error!("Cache sweep task failed: {}", e),
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            info!("Cache evictor stopped");
        });

        EvictorHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Stops the evictor when [`EvictorHandle::stop`] is called or the handle is dropped
#[derive(Debug)]
pub struct EvictorHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EvictorHandle {
    /// Signal the loop to exit after any in-progress sweep. Does not wait.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// True while the background loop exists
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Handle around an already spawned loop
    #[cfg(test)]
    pub(crate) fn from_task(stop_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }
}

impl Drop for EvictorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Delete every regular file under `dir` whose mtime is older than `now - ttl`.
///
/// Directories are never removed; per-entry failures are logged and skipped.
pub fn sweep_expired(dir: &Path, ttl: Duration) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = SystemTime::now().checked_sub(ttl) else {
        return report;
    };

    debug!("Sweeping {:?} for entries modified before {:?}", dir, cutoff);

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error walking cache directory {:?}: {}", dir, e);
                report.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        report.scanned += 1;

        let modified = match entry.metadata().map(|m| m.modified()) {
            Ok(Ok(modified)) => modified,
            Ok(Err(e)) => {
                warn!("No mtime for {:?}: {}", entry.path(), e);
                report.errors += 1;
                continue;
            }
            Err(e) => {
                warn!("Failed to stat {:?}: {}", entry.path(), e);
                report.errors += 1;
                continue;
            }
        };

        if modified < cutoff {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Evicted {:?}", entry.path());
                    report.deleted += 1;
                }
                // Already gone, e.g. expired inline by a concurrent read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to delete {:?}: {}", entry.path(), e);
                    report.errors += 1;
                }
            }
        }
    }

    report
}
