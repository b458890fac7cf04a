//! # fwdproxy - caching forward HTTP/HTTPS proxy
//!
//! A forward proxy that relays `CONNECT` tunnels, forwards plain HTTP requests
//! and keeps a content-addressed disk cache for an allow-list of domains.
//!
//! ## Core features
//!
//! - **Tunnelling**: opaque byte relay for `CONNECT host:port`
//! - **Disk cache**: TTL-bounded entries keyed by normalized request, with
//!   one origin fetch per key at a time
//! - **Eviction**: periodic background sweep of expired entries
//! - **Static files**: optional `/static/<key>/` directory mounts
//! - **Hot reload**: configuration changes restart only the affected subsystems
//! - **Graceful shutdown**: bounded drain of open connections
//!
//! ## Example
//!
//! ```rust,no_run
//! use fwdproxy::config::SnapshotCell;
//! use fwdproxy::{Config, ServiceSupervisor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_or_default("config.toml").await?;
//!     let supervisor = ServiceSupervisor::new(Arc::new(SnapshotCell::new(config)));
//!     supervisor.start_services().await;
//!     fwdproxy::graceful_shutdown::wait_for_signal().await;
//!     supervisor.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod graceful_shutdown;
pub mod proxy;
pub mod supervisor;

// Re-export commonly used types
pub use cache::{CacheEvictor, CacheKey, CacheStore, EvictorHandle};
pub use config::{Config, ConfigManager};
pub use error::{ErrorSeverity, FetchFailure, ProxyError, ProxyResult};
pub use proxy::{Fetcher, ProxyDispatcher, ServerHandle, TunnelRelay};
pub use supervisor::{plan_restart, RestartPlan, ServiceSupervisor};
