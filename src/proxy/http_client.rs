use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HOST};
use hyper::service::Service;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::debug;

use super::headers::{strip_hop_by_hop_headers, PROXY_CONNECTION};
use crate::error::{FetchFailure, ProxyError, ProxyResult};

/// Whole request budget: connect, headers and the full body
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub const POOL_MAX_IDLE_PER_HOST: usize = 100;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type HttpsClient = Client<TimeoutConnector<HttpsConnector<HttpConnector>>, Body>;

/// An inbound request rewritten to an absolute target
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Absolute URI (scheme and authority present)
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Body) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
        }
    }

    /// Bodiless request, mostly for tests and cache probes
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri, HeaderMap::new(), Body::empty())
    }
}

/// A fully buffered origin response
///
/// `Bytes` makes the body cheap to hand to the cache writer, the client and
/// every request coalesced onto the same fetch.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Outbound HTTP/HTTPS client used for every origin fetch.
///
/// - one pooled hyper client per generation, cloned cheaply into handlers
/// - never follows redirects and never consults proxy environment variables
/// - hard deadline around the whole exchange, body included
#[derive(Clone)]
pub struct Fetcher {
    client: HttpsClient,
    timeout: Duration,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: build_client(),
            timeout,
        }
    }

    /// Issue `request` against its origin and buffer the response.
    ///
    /// Any status code is a successful fetch; only transport-level problems
    /// are errors.
    pub async fn fetch(&self, request: ProxyRequest) -> ProxyResult<OriginResponse> {
        let target = request.uri.to_string();
        let outbound = build_outbound_request(request)
            .map_err(|e| ProxyError::fetch_failed(&target, FetchFailure::InvalidRequest, e.to_string()))?;

        debug!(target = %target, "Fetching from origin");

        let exchange = async {
            let response = self
                .client
                .request(outbound)
                .await
                .map_err(|e| classify_transport_error(&target, e))?;
            let (parts, body) = response.into_parts();
            let body = hyper::body::to_bytes(body).await.map_err(|e| {
                ProxyError::fetch_failed(&target, FetchFailure::Body, e.to_string())
            })?;
            Ok::<_, ProxyError>(OriginResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::fetch_failed(
                &target,
                FetchFailure::Timeout,
                format!("no complete response within {:?}", self.timeout),
            )),
        }
    }
}

fn build_client() -> HttpsClient {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));

    let https = HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .wrap_connector(http);

    Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(TimeoutConnector::new(https, TLS_HANDSHAKE_TIMEOUT))
}

fn build_outbound_request(request: ProxyRequest) -> ProxyResult<Request<Body>> {
    if request.uri.scheme().is_none() || request.uri.authority().is_none() {
        return Err(ProxyError::bad_request(format!(
            "target URI is not absolute: {}",
            request.uri
        )));
    }

    let mut headers = request.headers;
    strip_hop_by_hop_headers(&mut headers);
    headers.remove(PROXY_CONNECTION);
    // The client derives Host from the URI
    headers.remove(HOST);

    let mut outbound = Request::builder()
        .method(request.method)
        .uri(request.uri)
        .body(request.body)?;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

fn classify_transport_error(target: &str, err: hyper::Error) -> ProxyError {
    let kind = if err.is_timeout() {
        FetchFailure::Timeout
    } else if err.is_connect() {
        FetchFailure::Connect
    } else {
        FetchFailure::Transport
    };
    ProxyError::fetch_failed(target, kind, err.to_string())
}

/// Connector wrapper bounding the TLS handshake on top of the TCP connect
/// timeout already enforced by [`HttpConnector`].
#[derive(Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    handshake_timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    pub fn new(inner: C, handshake_timeout: Duration) -> Self {
        Self {
            inner,
            handshake_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("connection setup timed out after {0:?}")]
struct ConnectTimedOut(Duration);

impl<C> Service<Uri> for TimeoutConnector<C>
where
    C: Service<Uri> + Send,
    C::Response: Send + 'static,
    C::Future: Send + 'static,
    C::Error: Into<BoxError>,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        // TCP connect has its own budget inside the inner connector
        let budget = CONNECT_TIMEOUT + self.handshake_timeout;
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            match tokio::time::timeout(budget, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(ConnectTimedOut(budget)) as BoxError),
            }
        })
    }
}
