//! # Proxy front end
//!
//! Everything between the listening socket and the origin:
//!
//! - [`http_server`]: listener lifecycle, CONNECT detection and graceful drain
//! - [`handler`]: per-request dispatch (tunnel, static files, cache or direct fetch)
//! - [`http_client`]: pooled outbound HTTP/HTTPS client with deadlines
//! - [`tunnel`]: opaque TCP relay for `CONNECT`
//! - [`static_files`]: `/static/<key>/` directory mounts
//! - [`headers`]: hop-by-hop header handling

pub mod handler;
pub mod headers;
pub mod http_client;
pub mod http_server;
pub mod static_files;
pub mod tunnel;

pub use handler::{CacheStatus, ProxyDispatcher, X_CACHE_STATUS};
pub use http_client::{Fetcher, OriginResponse, ProxyRequest};
pub use http_server::{ServerHandle, SHUTDOWN_GRACE};
pub use static_files::StaticRoutes;
pub use tunnel::TunnelRelay;
