use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Method, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::key::CacheKey;
use super::single_flight::{FlightRole, InflightTracker};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::http_client::{Fetcher, OriginResponse, ProxyRequest};

/// Content type of a hit whose path has no recognizable extension
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Response produced by [`CacheStore::serve_or_fetch`]
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub response: OriginResponse,
    /// True only when the body came from a fresh on-disk entry
    pub served_from_cache: bool,
}

/// Disk-backed, TTL-bounded response cache in front of a [`Fetcher`].
///
/// One file per [`CacheKey`] holding the raw body; the file's mtime is the
/// stored-at time. Storage problems never fail a request: they are logged
/// and the request proceeds as if the cache were absent.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    dir: PathBuf,
    ttl: Duration,
    fetcher: Fetcher,
    inflight: InflightTracker<ProxyResult<CacheOutcome>>,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, fetcher: Fetcher) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                dir: dir.into(),
                ttl,
                fetcher,
                inflight: InflightTracker::new(),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// A zero TTL or an empty directory turns the store into a pass-through
    pub fn is_enabled(&self) -> bool {
        !self.inner.ttl.is_zero() && !self.inner.dir.as_os_str().is_empty()
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.dir.join(key.file_name())
    }

    /// Serve a fresh entry if there is one, otherwise fetch from the origin
    /// and persist 2xx bodies.
    ///
    /// Concurrent misses for the same GET/HEAD key share one origin fetch.
    pub async fn serve_or_fetch(&self, request: ProxyRequest) -> ProxyResult<CacheOutcome> {
        if !self.is_enabled() {
            let response = self.inner.fetcher.fetch(request).await?;
            return Ok(CacheOutcome {
                response,
                served_from_cache: false,
            });
        }

        let key = CacheKey::new(&request.method, &request.uri);
        let path = self.entry_path(&key);
        let request_path = request.uri.path().to_string();

        if let Some(hit) = self.lookup(&path, &request_path).await {
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        // Requests with bodies may differ beyond the key; never share their fetch
        if !is_coalescable(&request.method) {
            return self.fetch_and_store(request, &path, &key).await;
        }

        loop {
            match self.inner.inflight.register(key.canonical()) {
                FlightRole::Leader(guard) => {
                    // Another leader may have stored the entry since our lookup
                    let outcome = match self.lookup(&path, &request_path).await {
                        Some(hit) => Ok(hit),
                        None => self.fetch_and_store(request, &path, &key).await,
                    };
                    guard.complete(outcome.clone());
                    return outcome;
                }
                FlightRole::Waiter(mut rx) => {
                    debug!(key = %key, "Waiting on in-flight origin fetch");
                    match rx.recv().await {
                        Ok(outcome) => return outcome,
                        Err(_) => {
                            debug!(key = %key, "In-flight fetch abandoned, registering again");
                        }
                    }
                }
            }
        }
    }

    async fn lookup(&self, path: &Path, request_path: &str) -> Option<CacheOutcome> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to stat cache entry {:?}: {}", path, e);
                return None;
            }
        };
        let stored_at = match metadata.modified() {
            Ok(t) => t,
            Err(e) => {
                warn!("Cache entry {:?} has no mtime: {}", path, e);
                return None;
            }
        };

        // A timestamp in the future counts as brand new
        let age = SystemTime::now()
            .duration_since(stored_at)
            .unwrap_or(Duration::ZERO);
        if age >= self.inner.ttl {
            debug!("Cache entry {:?} expired ({:?} old)", path, age);
            remove_entry(path).await;
            return None;
        }

        match tokio::fs::read(path).await {
            Ok(body) => Some(CacheOutcome {
                response: hit_response(Bytes::from(body), stored_at, request_path),
                served_from_cache: true,
            }),
            Err(e) => {
                warn!("Failed to read cache entry {:?}, discarding: {}", path, e);
                remove_entry(path).await;
                None
            }
        }
    }

    async fn fetch_and_store(
        &self,
        request: ProxyRequest,
        path: &Path,
        key: &CacheKey,
    ) -> ProxyResult<CacheOutcome> {
        let response = self.inner.fetcher.fetch(request).await?;

        if response.is_success() {
            match self.persist(path, &response.body).await {
                Ok(()) => debug!(key = %key, bytes = response.body.len(), "Stored cache entry"),
                Err(e) => warn!(key = %key, "Failed to write cache entry: {}", e),
            }
        } else {
            debug!(key = %key, status = %response.status, "Not caching non-2xx response");
        }

        Ok(CacheOutcome {
            response,
            served_from_cache: false,
        })
    }

    /// Write to a sibling temp file and rename it into place
    async fn persist(&self, path: &Path, body: &Bytes) -> ProxyResult<()> {
        create_cache_dir(&self.inner.dir).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProxyError::cache(format!("invalid cache path {:?}", path)))?;
        let tmp = self
            .inner
            .dir
            .join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        let written = async {
            tokio::fs::write(&tmp, body).await?;
            restrict_file_mode(&tmp).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ProxyError::cache(format!("{:?}: {}", path, e)));
        }
        Ok(())
    }
}

fn is_coalescable(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

fn hit_response(body: Bytes, stored_at: SystemTime, request_path: &str) -> OriginResponse {
    let content_type = mime_guess::from_path(request_path)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE);

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(stored_at)) {
        headers.insert(LAST_MODIFIED, value);
    }

    OriginResponse {
        status: StatusCode::OK,
        headers,
        body,
    }
}

async fn remove_entry(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove cache entry {:?}: {}", path, e);
        }
    }
}

async fn create_cache_dir(dir: &Path) -> ProxyResult<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o750);
    builder
        .create(dir)
        .await
        .map_err(|e| ProxyError::cache(format!("cannot create cache dir {:?}: {}", dir, e)))
}

#[cfg(unix)]
async fn restrict_file_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640)).await
}

#[cfg(not(unix))]
async fn restrict_file_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}
