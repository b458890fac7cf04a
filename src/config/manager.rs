use anyhow::Result;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use super::Config;

/// Anything that can hand out the latest validated configuration snapshot.
///
/// The supervisor re-reads from here on every reload notification instead of
/// trusting whatever accompanied the notification.
pub trait SnapshotSource: Send + Sync {
    fn current(&self) -> Arc<Config>;
}

/// Shared, swappable slot holding the current snapshot
#[derive(Debug, Clone)]
pub struct SnapshotCell {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SnapshotCell {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Replace the stored snapshot
    pub fn replace(&self, config: Config) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(config);
    }
}

impl SnapshotSource for SnapshotCell {
    fn current(&self) -> Arc<Config> {
        Arc::clone(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Configuration manager with hot-reload support
pub struct ConfigManager {
    snapshot: SnapshotCell,
    config_path: PathBuf,
    _watcher: Option<RecommendedWatcher>,
    notifier: Option<mpsc::Sender<()>>,
}

impl ConfigManager {
    /// Load the initial configuration. A missing file runs with defaults;
    /// anything unparseable or invalid is an error.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Config::load_or_default(&config_path).await?;

        Ok(ConfigManager {
            snapshot: SnapshotCell::new(config),
            config_path,
            _watcher: None,
            notifier: None,
        })
    }

    /// Channel poked (best effort) after every successful reload
    pub fn set_notifier(&mut self, notifier: mpsc::Sender<()>) {
        self.notifier = Some(notifier);
    }

    /// Cloneable handle onto the snapshot this manager keeps current
    pub fn snapshot(&self) -> SnapshotCell {
        self.snapshot.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Start watching for configuration file changes
    pub fn start_hot_reload(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);
        let snapshot = self.snapshot.clone();
        let config_path = self.config_path.clone();
        let notifier = self.notifier.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if let Err(e) = tx.blocking_send(event) {
                        error!("Failed to send file change event: {}", e);
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        // Watch the directory too, so editors that replace the file are seen
        if config_path.exists() {
            watcher.watch(&config_path, RecursiveMode::NonRecursive)?;
        }
        let parent = match config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        watcher.watch(parent, RecursiveMode::NonRecursive)?;

        info!("Started watching config file: {:?}", config_path);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handle_config_change(&event, &snapshot, &config_path, notifier.as_ref()).await;
            }
        });

        self._watcher = Some(watcher);
        Ok(())
    }

    /// Manually reload configuration from file
    pub async fn reload_config(&self) -> Result<()> {
        info!(
            "Manually reloading configuration from {:?}",
            self.config_path
        );

        let new_config = Config::from_file_with_env(&self.config_path).await?;
        self.snapshot.replace(new_config);
        info!("Configuration reloaded successfully");
        notify_reload(self.notifier.as_ref());
        Ok(())
    }
}

impl SnapshotSource for ConfigManager {
    fn current(&self) -> Arc<Config> {
        self.snapshot.current()
    }
}

/// Handle configuration file change events
async fn handle_config_change(
    event: &Event,
    snapshot: &SnapshotCell,
    config_path: &Path,
    notifier: Option<&mpsc::Sender<()>>,
) {
    use notify::EventKind;

    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
        return;
    }

    let config_file_changed = event.paths.iter().any(|path| {
        path == config_path
            || (path.file_name().is_some() && path.file_name() == config_path.file_name())
    });
    if !config_file_changed {
        return;
    }

    debug!("Config file change detected: {:?}", event);

    // Let the writer finish before reading
    tokio::time::sleep(Duration::from_millis(100)).await;

    match Config::from_file_with_env(config_path).await {
        Ok(new_config) => {
            if *snapshot.current() == new_config {
                debug!("Config file touched without changes");
                return;
            }
            snapshot.replace(new_config);
            info!("Configuration hot-reloaded successfully");
            notify_reload(notifier);
        }
        Err(e) => {
            warn!(
                "Failed to hot-reload configuration (keeping current): {}",
                e
            );
        }
    }
}

/// Non-blocking send; a pending notification already covers this change.
fn notify_reload(notifier: Option<&mpsc::Sender<()>>) {
    let Some(tx) = notifier else {
        return;
    };
    match tx.try_send(()) {
        Ok(()) => debug!("Sent reload notification"),
        Err(TrySendError::Full(())) => {
            warn!("Reload notification dropped: one is already pending")
        }
        Err(TrySendError::Closed(())) => debug!("Reload listener is gone"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_reload_publishes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[http]\nport = 9000\n").unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let mut manager = ConfigManager::new(&path).await.unwrap();
        manager.set_notifier(tx);
        assert_eq!(manager.current().http.port, 9000);

        std::fs::write(&path, "[http]\nport = 9001\n").unwrap();
        manager.reload_config().await.unwrap();

        assert_eq!(manager.current().http.port, 9001);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[http]\nport = 9000\n").unwrap();

        let manager = ConfigManager::new(&path).await.unwrap();
        std::fs::write(
            &path,
            "[http.forward_proxy]\nenabled = true\n[http.forward_proxy.cache]\nenabled = true\n",
        )
        .unwrap();

        assert!(manager.reload_config().await.is_err());
        assert_eq!(manager.current().http.port, 9000);
    }

    #[test]
    fn test_notification_channel_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        notify_reload(Some(&tx));
        notify_reload(Some(&tx));
        notify_reload(Some(&tx));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
