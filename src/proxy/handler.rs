use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::headers::copy_end_to_end_headers;
use super::http_client::{Fetcher, OriginResponse, ProxyRequest};
use super::static_files::StaticRoutes;
use super::tunnel::{TunnelRelay, CONNECTION_ESTABLISHED};
use crate::cache::CacheStore;
use crate::config::{host_without_port, Config};
use crate::error::{ErrorSeverity, ProxyError, ProxyResult};

pub const X_CACHE_STATUS: &str = "x-cache-status";

/// Longest CONNECT request head accepted on a hijacked connection
const MAX_CONNECT_HEAD: usize = 8 * 1024;

/// Relay for a tunnel that outlives the request which opened it
pub type TunnelTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How a response relates to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Per-request entry point of one server generation.
///
/// Built from a single configuration snapshot; a reload that touches the
/// `http` settings replaces the whole dispatcher with the listener.
#[derive(Clone)]
pub struct ProxyDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: Arc<Config>,
    /// Port actually bound, which differs from the configured one for port 0
    listen_port: u16,
    static_routes: StaticRoutes,
    fetcher: Fetcher,
    cache: Option<CacheStore>,
    tunnel: TunnelRelay,
    /// Where upgraded tunnels go to be tracked; spawned freely when absent
    tunnel_tasks: Option<mpsc::UnboundedSender<TunnelTask>>,
}

impl ProxyDispatcher {
    pub fn new(config: Arc<Config>, listen_port: u16) -> Self {
        Self::build(config, listen_port, None)
    }

    /// Dispatcher whose upgraded tunnels are handed to `tunnel_tasks`
    /// instead of being spawned detached
    pub fn with_tunnel_tasks(
        config: Arc<Config>,
        listen_port: u16,
        tunnel_tasks: mpsc::UnboundedSender<TunnelTask>,
    ) -> Self {
        Self::build(config, listen_port, Some(tunnel_tasks))
    }

    fn build(
        config: Arc<Config>,
        listen_port: u16,
        tunnel_tasks: Option<mpsc::UnboundedSender<TunnelTask>>,
    ) -> Self {
        let fetcher = Fetcher::new();
        let proxy = &config.http.forward_proxy;

        let static_routes = StaticRoutes::from_config(&config.http.static_files);
        if !config.http.static_files.enabled {
            info!("Static file serving is disabled");
        }

        let cache = if !proxy.enabled {
            info!("Forward proxy is disabled");
            None
        } else if !proxy.cache.enabled || proxy.cache.cache_dir.as_os_str().is_empty() {
            info!("Proxy caching is disabled (globally, or no cache dir specified)");
            None
        } else {
            match proxy.cache.ttl() {
                Ok(ttl) if ttl.is_zero() => {
                    info!("Proxy caching disabled: TTL is zero");
                    None
                }
                Ok(ttl) => {
                    info!(
                        "Proxy caching enabled: dir={:?}, ttl={:?}",
                        proxy.cache.cache_dir, ttl
                    );
                    Some(CacheStore::new(&proxy.cache.cache_dir, ttl, fetcher.clone()))
                }
                Err(e) => {
                    warn!("Invalid proxy cache TTL, disabling caching: {}", e);
                    None
                }
            }
        };

        Self {
            inner: Arc::new(DispatcherInner {
                config,
                listen_port,
                static_routes,
                fetcher,
                cache,
                tunnel: TunnelRelay::new(),
                tunnel_tasks,
            }),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    fn proxy_enabled(&self) -> bool {
        self.inner.config.http.forward_proxy.enabled
    }

    pub async fn handle_request(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        let request_id = Uuid::new_v4();
        let method = req.method().clone();
        let uri = req.uri().clone();
        debug!(%request_id, %method, %uri, "Request received");

        match self.process_request(req).await {
            Ok(response) => {
                debug!(%request_id, status = %response.status(), "Request completed");
                Ok(response)
            }
            Err(e) => {
                match e.severity() {
                    ErrorSeverity::Low => debug!(%request_id, %method, %uri, "Request rejected: {}", e),
                    ErrorSeverity::Medium => warn!(%request_id, %method, %uri, "Request failed: {}", e),
                    _ => error!(%request_id, %method, %uri, "Request failed: {}", e),
                }
                Ok(error_response(&e))
            }
        }
    }

    async fn process_request(&self, mut req: Request<Body>) -> ProxyResult<Response<Body>> {
        if req.method() == Method::CONNECT {
            if !self.proxy_enabled() {
                return Err(ProxyError::not_found("forward proxy is disabled"));
            }
            return self.upgrade_connect(&mut req).await;
        }

        let is_relative = req.uri().scheme().is_none();
        if is_relative {
            if let Some(response) = self.inner.static_routes.serve(&req).await {
                return Ok(response);
            }
        }

        if !self.proxy_enabled() {
            return Err(ProxyError::not_found(format!(
                "no handler for {}",
                req.uri().path()
            )));
        }

        let host_header = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        if is_relative && self.is_self_request(host_header.as_deref()) {
            warn!(
                "Detected self-request loop for {} {}, returning 404",
                req.method(),
                req.uri()
            );
            return Err(ProxyError::not_found("request addressed to the proxy itself"));
        }

        let target = if is_relative {
            let host = host_header
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ProxyError::bad_request("missing host information"))?;
            absolute_uri(req.uri(), &host)?
        } else {
            req.uri().clone()
        };

        let (parts, body) = req.into_parts();
        let target_host = target.authority().map(|a| a.as_str().to_string()).unwrap_or_default();
        let request = ProxyRequest::new(parts.method, target, parts.headers, body);

        let (origin, status) = match &self.inner.cache {
            Some(cache)
                if self
                    .inner
                    .config
                    .http
                    .forward_proxy
                    .should_cache_domain(&target_host) =>
            {
                let outcome = cache.serve_or_fetch(request).await?;
                let status = if outcome.served_from_cache {
                    CacheStatus::Hit
                } else {
                    CacheStatus::Miss
                };
                (outcome.response, status)
            }
            _ => (self.inner.fetcher.fetch(request).await?, CacheStatus::Bypass),
        };

        Ok(client_response(origin, status))
    }

    /// True when the Host header names this proxy (loopback, `localhost` or the
    /// configured listen address, on our port or without one)
    fn is_self_request(&self, host_header: Option<&str>) -> bool {
        let Some(host_header) = host_header else {
            return false;
        };
        let host = host_without_port(host_header);
        let port = if host_header.len() > host.len() {
            host_header
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse::<u16>().ok())
        } else {
            None
        };

        let listen_host = self.inner.config.http.addr.trim_matches(|c| c == '[' || c == ']');
        let is_local = host.eq_ignore_ascii_case("localhost")
            || host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
            || (!listen_host.is_empty()
                && host.trim_matches(|c| c == '[' || c == ']').eq_ignore_ascii_case(listen_host));
        let port_matches = match port {
            None => true,
            Some(p) => p == self.inner.listen_port || p == self.inner.config.http.port,
        };
        is_local && port_matches
    }

    /// CONNECT arriving on an already established HTTP connection
    async fn upgrade_connect(&self, req: &mut Request<Body>) -> ProxyResult<Response<Body>> {
        let target = connect_target(req.uri())?;
        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or_else(|| ProxyError::hijack_unsupported("connection cannot be upgraded"))?;

        let upstream = self.inner.tunnel.dial(&target).await?;
        info!("Tunnel established for {}", target);

        let relay_target = target.clone();
        let relay: TunnelTask = Box::pin(async move {
            match on_upgrade.await {
                Ok(upgraded) => TunnelRelay::relay(upgraded, upstream, &relay_target).await,
                Err(e) => warn!("Failed to take over client connection for {}: {}", relay_target, e),
            }
        });
        match &self.inner.tunnel_tasks {
            Some(tasks) => {
                if tasks.send(relay).is_err() {
                    return Err(ProxyError::tunnel(target, "server is shutting down"));
                }
            }
            None => {
                tokio::spawn(relay);
            }
        }

        Ok(Response::new(Body::empty()))
    }

    /// CONNECT that opened the connection: parse the head ourselves, answer
    /// with the literal status line and relay the raw stream, including any
    /// bytes the client already pipelined after the head.
    pub async fn handle_raw_connect<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut conn = BufReader::new(stream);

        let target = match read_connect_head(&mut conn).await {
            Ok(target) => target,
            Err(e) => {
                debug!(%peer, "Rejecting CONNECT: {}", e);
                write_raw_error(&mut conn, &e).await;
                return;
            }
        };

        if !self.proxy_enabled() {
            let e = ProxyError::not_found("forward proxy is disabled");
            write_raw_error(&mut conn, &e).await;
            return;
        }

        debug!(%peer, "CONNECT request to {}", target);
        let upstream = match self.inner.tunnel.dial(&target).await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("Failed to dial CONNECT target: {}", e);
                write_raw_error(&mut conn, &e).await;
                return;
            }
        };

        if let Err(e) = conn.write_all(CONNECTION_ESTABLISHED).await {
            warn!("Failed to confirm tunnel to {} for {}: {}", target, peer, e);
            return;
        }
        info!("Tunnel established for {}", target);
        TunnelRelay::relay(conn, upstream, &target).await;
    }
}

/// `http://<host><path?query>` for an origin-form request
fn absolute_uri(uri: &Uri, host: &str) -> ProxyResult<Uri> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let absolute = Uri::builder()
        .scheme("http")
        .authority(host)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::bad_request(format!("invalid host {:?}: {}", host, e)))?;
    Ok(absolute)
}

/// `host:port` named by a CONNECT request target
fn connect_target(uri: &Uri) -> ProxyResult<String> {
    match uri.authority() {
        Some(authority) if authority.port_u16().is_some() && !authority.host().is_empty() => {
            Ok(authority.as_str().to_string())
        }
        _ => Err(ProxyError::bad_request(
            "CONNECT requires host:port target",
        )),
    }
}

/// Read `CONNECT host:port HTTP/1.x` plus headers up to the blank line
async fn read_connect_head<R>(conn: &mut R) -> ProxyResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0usize;
    let mut request_line = String::new();
    loop {
        let mut line = String::new();
        let n = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            conn.read_line(&mut line),
        )
        .await
        .map_err(|_| ProxyError::bad_request("timed out reading CONNECT request"))??;
        if n == 0 {
            return Err(ProxyError::bad_request("connection closed mid-request"));
        }
        total += n;
        if total > MAX_CONNECT_HEAD {
            return Err(ProxyError::bad_request("CONNECT request head too large"));
        }
        if line.trim_end_matches(&['\r', '\n'][..]).is_empty() {
            break;
        }
        if request_line.is_empty() {
            request_line = line;
        }
    }

    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("CONNECT"), Some(target), Some(version)) if version.starts_with("HTTP/1.") => {
            let uri: Uri = target
                .parse()
                .map_err(|_| ProxyError::bad_request("CONNECT requires host:port target"))?;
            connect_target(&uri)
        }
        _ => Err(ProxyError::bad_request("malformed CONNECT request line")),
    }
}

async fn write_raw_error<W>(conn: &mut W, err: &ProxyError)
where
    W: AsyncWrite + Unpin,
{
    let status = err.status_code();
    let body = err.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
        body
    );
    let _ = conn.write_all(response.as_bytes()).await;
    let _ = conn.shutdown().await;
}

fn client_response(origin: OriginResponse, status: CacheStatus) -> Response<Body> {
    let mut response = Response::new(Body::from(origin.body));
    *response.status_mut() = origin.status;
    copy_end_to_end_headers(&origin.headers, response.headers_mut());
    response
        .headers_mut()
        .insert(X_CACHE_STATUS, HeaderValue::from_static(status.as_str()));
    response
}

fn error_response(err: &ProxyError) -> Response<Body> {
    let mut response = Response::new(Body::from(err.to_string()));
    *response.status_mut() = err.status_code();
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dispatcher(proxy_enabled: bool, port: u16) -> ProxyDispatcher {
        let mut config = Config::default();
        config.http.addr = "127.0.0.1".to_string();
        config.http.port = port;
        config.http.forward_proxy.enabled = proxy_enabled;
        ProxyDispatcher::new(Arc::new(config), port)
    }

    async fn status_of(d: &ProxyDispatcher, req: Request<Body>) -> StatusCode {
        d.handle_request(req).await.unwrap().status()
    }

    #[test]
    fn test_self_request_detection() {
        let d = dispatcher(true, 3128);
        assert!(d.is_self_request(Some("localhost:3128")));
        assert!(d.is_self_request(Some("LOCALHOST")));
        assert!(d.is_self_request(Some("127.0.0.1:3128")));
        assert!(d.is_self_request(Some("[::1]:3128")));
        assert!(!d.is_self_request(Some("localhost:9999")));
        assert!(!d.is_self_request(Some("example.com:3128")));
        assert!(!d.is_self_request(None));

        let mut config = Config::default();
        config.http.addr = "proxy.internal".to_string();
        config.http.port = 3128;
        let named = ProxyDispatcher::new(Arc::new(config), 3128);
        assert!(named.is_self_request(Some("Proxy.Internal:3128")));
        assert!(!named.is_self_request(Some("proxy.internal:80")));
    }

    #[tokio::test]
    async fn test_relative_request_to_self_is_404() {
        let d = dispatcher(true, 3128);
        let req = Request::get("/loop")
            .header(HOST, "localhost:3128")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(&d, req).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_relative_request_without_host_is_400() {
        let d = dispatcher(true, 3128);
        let req = Request::get("/a").body(Body::empty()).unwrap();
        assert_eq!(status_of(&d, req).await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_disabled_proxy_is_404() {
        let d = dispatcher(false, 3128);
        let req = Request::get("http://example.com/").body(Body::empty()).unwrap();
        assert_eq!(status_of(&d, req).await, StatusCode::NOT_FOUND);

        let connect = Request::connect("example.com:443").body(Body::empty()).unwrap();
        assert_eq!(status_of(&d, connect).await, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_connect_without_upgrade_handle_is_500() {
        let d = dispatcher(true, 3128);
        let connect = Request::connect("example.com:443").body(Body::empty()).unwrap();
        assert_eq!(status_of(&d, connect).await, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_connect_without_port_is_400() {
        let d = dispatcher(true, 3128);
        let connect = Request::connect("example.com").body(Body::empty()).unwrap();
        assert_eq!(status_of(&d, connect).await, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_absolute_uri_rebuild() {
        let uri: Uri = "/a/b?x=1".parse().unwrap();
        let abs = absolute_uri(&uri, "example.com:8080").unwrap();
        assert_eq!(abs, "http://example.com:8080/a/b?x=1");
        assert!(absolute_uri(&uri, "bad host").is_err());
    }

    #[tokio::test]
    async fn test_connect_head_parsing() {
        let raw: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nextra";
        let mut reader = BufReader::new(raw);
        assert_eq!(read_connect_head(&mut reader).await.unwrap(), "example.com:443");

        let mut bad = BufReader::new(&b"CONNECT example.com HTTP/1.1\r\n\r\n"[..]);
        assert!(matches!(
            read_connect_head(&mut bad).await,
            Err(ProxyError::BadRequest { .. })
        ));
    }

    #[test]
    fn test_client_response_strips_hop_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        let origin = OriginResponse {
            status: StatusCode::CREATED,
            headers,
            body: bytes::Bytes::from_static(b"<p>"),
        };

        let response = client_response(origin, CacheStatus::Bypass);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[X_CACHE_STATUS], "BYPASS");
        assert!(!response.headers().contains_key("connection"));
        assert!(!response.headers().contains_key("keep-alive"));
        assert_eq!(response.headers()["content-type"], "text/html");
    }

    #[test]
    fn test_cache_store_built_only_when_usable() {
        let mut config = Config::default();
        config.http.forward_proxy.enabled = true;
        config.http.forward_proxy.cache.enabled = true;
        config.http.forward_proxy.cache.cache_dir = PathBuf::from("/tmp/fwdproxy-test");
        let d = ProxyDispatcher::new(Arc::new(config.clone()), 0);
        assert!(d.inner.cache.is_some());

        config.http.forward_proxy.cache.cache_ttl = "0".to_string();
        let d = ProxyDispatcher::new(Arc::new(config), 0);
        assert!(d.inner.cache.is_none());
    }
}
