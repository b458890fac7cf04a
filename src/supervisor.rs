//! Lifecycle of the listener and the cache evictor.
//!
//! The supervisor owns the active configuration snapshot together with the
//! subsystems built from it. On a reload it diffs the old and new snapshots
//! and restarts only what the difference touches.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEvictor, EvictorHandle};
use crate::config::{Config, SnapshotSource};
use crate::error::ProxyResult;
use crate::proxy::ServerHandle;

const FALLBACK_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const FALLBACK_INTERVAL: Duration = Duration::from_secs(3600);

/// Which subsystems a configuration change invalidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartPlan {
    pub restart_server: bool,
    pub restart_evictor: bool,
}

impl RestartPlan {
    pub fn is_empty(&self) -> bool {
        !self.restart_server && !self.restart_evictor
    }
}

/// Compare two snapshots.
///
/// Any difference in the `http` subtree restarts the listener. The evictor
/// restarts when whether it should run changes, or when it keeps running with
/// a different interval, directory or TTL.
pub fn plan_restart(old: &Config, new: &Config) -> RestartPlan {
    let restart_server = old.http != new.http;

    let was_running = old.evictor_should_run();
    let should_run = new.evictor_should_run();
    let restart_evictor = if was_running != should_run {
        true
    } else if should_run {
        evictor_params(old) != evictor_params(new)
    } else {
        false
    };

    RestartPlan {
        restart_server,
        restart_evictor,
    }
}

/// `(interval, dir, ttl)` as the evictor would be started with them
fn evictor_params(config: &Config) -> (Duration, PathBuf, Duration) {
    let cache = &config.http.forward_proxy.cache;
    let interval = config
        .proxy_cache_cleanup
        .interval()
        .unwrap_or(FALLBACK_INTERVAL);
    let ttl = cache.ttl().unwrap_or(FALLBACK_TTL);
    (interval, cache.cache_dir.clone(), ttl)
}

struct ActiveTopology {
    config: Arc<Config>,
    server: Option<ServerHandle>,
    evictor: Option<EvictorHandle>,
}

/// Starts, stops and hot-reloads the proxy's long-running subsystems
pub struct ServiceSupervisor {
    source: Arc<dyn SnapshotSource>,
    topology: Mutex<ActiveTopology>,
}

impl ServiceSupervisor {
    /// Take the source's current snapshot as the initial one. Nothing is started yet.
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        let config = source.current();
        Self {
            source,
            topology: Mutex::new(ActiveTopology {
                config,
                server: None,
                evictor: None,
            }),
        }
    }

    /// Bring running subsystems in line with the active snapshot. Safe to call repeatedly.
    pub async fn start_services(&self) {
        let mut topology = self.topology.lock().await;
        Self::start_locked(&mut topology).await;
    }

    /// Stop both subsystems, leaving the snapshot in place
    pub async fn stop_services(&self) {
        let mut topology = self.topology.lock().await;
        Self::stop_server(&mut topology).await;
        Self::stop_evictor(&mut topology);
    }

    /// Apply the source's latest snapshot.
    ///
    /// An invalid snapshot is rejected and the current one stays active.
    /// Returns the restart plan that was carried out.
    pub async fn reload(&self) -> ProxyResult<RestartPlan> {
        let new_config = self.source.current();
        if let Err(e) = new_config.validate() {
            error!("Rejecting reloaded configuration: {}", e);
            return Err(e);
        }

        let mut topology = self.topology.lock().await;
        let plan = plan_restart(&topology.config, &new_config);

        if plan.is_empty() {
            debug!("Configuration reloaded; no subsystem affected");
            topology.config = new_config;
            return Ok(plan);
        }

        info!(
            restart_server = plan.restart_server,
            restart_evictor = plan.restart_evictor,
            "Applying configuration change"
        );
        if plan.restart_server {
            Self::stop_server(&mut topology).await;
        }
        if plan.restart_evictor {
            Self::stop_evictor(&mut topology);
        }
        topology.config = new_config;
        Self::start_locked(&mut topology).await;

        Ok(plan)
    }

    /// Terminal stop
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.stop_services().await;
        info!("All services stopped");
    }

    /// Serve reload notifications until `shutdown` resolves, then stop everything.
    pub async fn run<F>(&self, mut reload_rx: mpsc::Receiver<()>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut reloads_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                notified = reload_rx.recv(), if reloads_open => match notified {
                    Some(()) => {
                        info!("Configuration change detected, reloading services");
                        if let Err(e) = self.reload().await {
                            warn!("Configuration reload failed, keeping previous configuration: {}", e);
                        }
                    }
                    None => {
                        debug!("Reload channel closed");
                        reloads_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&self.topology.lock().await.config)
    }

    /// Bound address of the running listener
    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.topology
            .lock()
            .await
            .server
            .as_ref()
            .map(ServerHandle::local_addr)
    }

    pub async fn server_running(&self) -> bool {
        self.topology
            .lock()
            .await
            .server
            .as_ref()
            .is_some_and(ServerHandle::is_running)
    }

    pub async fn evictor_running(&self) -> bool {
        self.topology
            .lock()
            .await
            .evictor
            .as_ref()
            .is_some_and(EvictorHandle::is_running)
    }

    async fn start_locked(topology: &mut ActiveTopology) {
        let config = Arc::clone(&topology.config);

        if config.http.enabled {
            if topology.server.is_none() {
                match ServerHandle::start(Arc::clone(&config)).await {
                    Ok(server) => topology.server = Some(server),
                    Err(e) => error!("Failed to start HTTP server: {}", e),
                }
            }
        } else {
            if topology.server.is_some() {
                info!("HTTP server disabled by configuration");
            }
            Self::stop_server(topology).await;
        }

        if config.evictor_should_run() {
            if topology.evictor.is_none() {
                let (interval, dir, ttl) = evictor_params(&config);
                topology.evictor = Some(CacheEvictor::start(interval, dir, ttl));
            }
        } else {
            if topology.evictor.is_some() {
                info!("Cache evictor disabled by configuration");
            }
            Self::stop_evictor(topology);
        }
    }

    async fn stop_server(topology: &mut ActiveTopology) {
        if let Some(server) = topology.server.take() {
            server.stop().await;
        }
    }

    fn stop_evictor(topology: &mut ActiveTopology) {
        // An in-progress sweep finishes on its own
        if let Some(mut evictor) = topology.evictor.take() {
            evictor.stop();
        }
    }
}
