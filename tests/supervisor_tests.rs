use fwdproxy::config::{Config, SnapshotCell, StaticDirConfig};
use fwdproxy::supervisor::ServiceSupervisor;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

fn caching_config(cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.http.addr = "127.0.0.1".to_string();
    config.http.port = 0;
    config.http.forward_proxy.enabled = true;
    config.http.forward_proxy.cache.enabled = true;
    config.http.forward_proxy.cache.cache_dir = cache_dir.to_path_buf();
    config.http.forward_proxy.cache.cache_ttl = "1h".to_string();
    config
}

fn supervisor_for(config: Config) -> (SnapshotCell, ServiceSupervisor) {
    let cell = SnapshotCell::new(config);
    let supervisor = ServiceSupervisor::new(Arc::new(cell.clone()));
    (cell, supervisor)
}

#[tokio::test]
async fn test_start_twice_keeps_one_listener_and_one_evictor() {
    let cache_dir = TempDir::new().unwrap();
    let (_cell, supervisor) = supervisor_for(caching_config(cache_dir.path()));

    supervisor.start_services().await;
    let first_addr = supervisor.server_addr().await.expect("server started");
    supervisor.start_services().await;

    assert_eq!(supervisor.server_addr().await, Some(first_addr));
    assert!(supervisor.server_running().await);
    assert!(supervisor.evictor_running().await);

    supervisor.shutdown().await;
    assert!(!supervisor.server_running().await);
    assert!(!supervisor.evictor_running().await);
    assert!(supervisor.server_addr().await.is_none());
}

#[tokio::test]
async fn test_static_path_change_leaves_evictor_alone() {
    let cache_dir = TempDir::new().unwrap();
    let assets = TempDir::new().unwrap();
    let mut config = caching_config(cache_dir.path());
    config.http.static_files.enabled = true;
    config.http.static_files.dirs.insert(
        "assets".to_string(),
        StaticDirConfig {
            path: assets.path().join("v1"),
        },
    );
    let (cell, supervisor) = supervisor_for(config.clone());
    supervisor.start_services().await;

    config
        .http
        .static_files
        .dirs
        .get_mut("assets")
        .unwrap()
        .path = assets.path().join("v2");
    cell.replace(config);

    let plan = supervisor.reload().await.unwrap();
    assert!(plan.restart_server);
    assert!(!plan.restart_evictor);
    assert!(supervisor.server_running().await);
    assert!(supervisor.evictor_running().await);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_interval_change_leaves_listener_alone() {
    let cache_dir = TempDir::new().unwrap();
    let mut config = caching_config(cache_dir.path());
    let (cell, supervisor) = supervisor_for(config.clone());
    supervisor.start_services().await;
    let addr = supervisor.server_addr().await.unwrap();

    config.proxy_cache_cleanup.interval = "15m".to_string();
    cell.replace(config);

    let plan = supervisor.reload().await.unwrap();
    assert!(!plan.restart_server);
    assert!(plan.restart_evictor);
    assert_eq!(supervisor.server_addr().await, Some(addr));
    assert!(supervisor.evictor_running().await);
    assert_eq!(supervisor.config().await.proxy_cache_cleanup.interval, "15m");

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_snapshot() {
    let cache_dir = TempDir::new().unwrap();
    let config = caching_config(cache_dir.path());
    let (cell, supervisor) = supervisor_for(config.clone());
    supervisor.start_services().await;
    let addr = supervisor.server_addr().await.unwrap();

    let mut broken = config.clone();
    broken.http.forward_proxy.cache.cache_ttl = "forever".to_string();
    cell.replace(broken);

    assert!(supervisor.reload().await.is_err());
    assert_eq!(*supervisor.config().await, config);
    assert_eq!(supervisor.server_addr().await, Some(addr));
    assert!(supervisor.evictor_running().await);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_disabling_http_stops_only_the_listener() {
    let cache_dir = TempDir::new().unwrap();
    let mut config = caching_config(cache_dir.path());
    let (cell, supervisor) = supervisor_for(config.clone());
    supervisor.start_services().await;

    config.http.enabled = false;
    cell.replace(config);
    supervisor.reload().await.unwrap();

    assert!(!supervisor.server_running().await);
    assert!(supervisor.evictor_running().await);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_run_applies_notifications_until_shutdown() {
    let cache_dir = TempDir::new().unwrap();
    let mut config = caching_config(cache_dir.path());
    let (cell, supervisor) = supervisor_for(config.clone());
    let supervisor = Arc::new(supervisor);
    supervisor.start_services().await;

    let (reload_tx, reload_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let runner = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            supervisor
                .run(reload_rx, async {
                    let _ = stop_rx.await;
                })
                .await;
        })
    };

    config.http.forward_proxy.domains = vec!["example.com".to_string()];
    cell.replace(config);
    reload_tx.send(()).await.unwrap();

    let mut applied = false;
    for _ in 0..50 {
        if supervisor.config().await.http.forward_proxy.domains == ["example.com"] {
            applied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(applied, "reload notification should be applied");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(20), runner)
        .await
        .expect("run returns after shutdown")
        .unwrap();
    assert!(!supervisor.server_running().await);
    assert!(!supervisor.evictor_running().await);
}

#[tokio::test]
async fn test_supervised_evictor_sweeps_expired_entries() {
    let cache_dir = TempDir::new().unwrap();
    let expired = cache_dir.path().join("expired.cache");
    let fresh = cache_dir.path().join("fresh.cache");
    std::fs::write(&expired, b"old").unwrap();
    std::fs::write(&fresh, b"new").unwrap();
    File::options()
        .write(true)
        .open(&expired)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(2 * 3600))
        .unwrap();

    let mut config = caching_config(cache_dir.path());
    config.http.enabled = false;
    config.proxy_cache_cleanup.interval = "100ms".to_string();
    let (_cell, supervisor) = supervisor_for(config);
    supervisor.start_services().await;

    let mut swept = false;
    for _ in 0..50 {
        if !expired.exists() {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(swept, "expired entry should be removed");
    assert!(fresh.exists());

    supervisor.shutdown().await;
}
