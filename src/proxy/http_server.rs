use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::handler::{ProxyDispatcher, TunnelTask};
use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};

/// How long in-flight connections get to finish once shutdown starts
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Time a new connection has to send its first bytes
const FIRST_BYTES_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Shutdown request carried to the accept loop: `Some(grace)` once stop begins
type ShutdownRx = watch::Receiver<Option<Duration>>;

/// A bound, running HTTP listener
///
/// Plain requests go through hyper. Connections that open with `CONNECT` are
/// taken over before hyper sees them so the tunnel can answer with the exact
/// `Connection Established` status line.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<Option<Duration>>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bind `config.listen_addr()` and start accepting
    pub async fn start(config: Arc<Config>) -> ProxyResult<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::bind(&addr, e.to_string()))?;
        let local_addr = listener.local_addr()?;

        let (tunnel_tx, tunnel_rx) = mpsc::unbounded_channel();
        let dispatcher = ProxyDispatcher::with_tunnel_tasks(config, local_addr.port(), tunnel_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let accept_task = tokio::spawn(accept_loop(listener, dispatcher, tunnel_rx, shutdown_rx));

        info!("HTTP server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.accept_task.is_finished()
    }

    /// Stop accepting, let open connections finish within [`SHUTDOWN_GRACE`],
    /// then force-close whatever remains
    pub async fn stop(self) {
        self.stop_with_grace(SHUTDOWN_GRACE).await
    }

    pub async fn stop_with_grace(self, grace: Duration) {
        info!("Stopping HTTP server on {}", self.local_addr);
        let _ = self.shutdown_tx.send(Some(grace));
        if let Err(e) = self.accept_task.await {
            error!("HTTP server task failed: {}", e);
        }
        info!("HTTP server on {} stopped", self.local_addr);
    }
}

/// Connections and the tunnels upgraded out of them share one task set, so
/// both are drained and, past the grace period, aborted together.
async fn accept_loop(
    listener: TcpListener,
    dispatcher: ProxyDispatcher,
    mut tunnel_rx: mpsc::UnboundedReceiver<TunnelTask>,
    mut shutdown_rx: ShutdownRx,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown_rx) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        dispatcher.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(tunnel) = tunnel_rx.recv() => {
                connections.spawn(tunnel);
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    // Release the port before draining so a replacement can bind right away
    drop(listener);

    let grace = (*shutdown_rx.borrow()).unwrap_or(SHUTDOWN_GRACE);
    debug!("Draining {} open connection(s)", connections.len());
    let drained = tokio::time::timeout(grace, async {
        loop {
            tokio::select! {
                // A tunnel is queued before its connection task ends
                biased;
                Some(tunnel) = tunnel_rx.recv() => {
                    connections.spawn(tunnel);
                }
                finished = connections.join_next() => {
                    if finished.is_none() {
                        break;
                    }
                }
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "Graceful shutdown timed out after {:?}; force-closing {} connection(s)",
            grace,
            connections.len()
        );
        connections.shutdown().await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    dispatcher: ProxyDispatcher,
    mut shutdown_rx: ShutdownRx,
) {
    let sniffed = tokio::select! {
        _ = wait_for_shutdown(&mut shutdown_rx) => return,
        sniffed = tokio::time::timeout(FIRST_BYTES_TIMEOUT, starts_with_connect(&stream)) => sniffed,
    };
    match sniffed {
        Ok(Ok(true)) => {
            dispatcher.handle_raw_connect(stream, peer).await;
            return;
        }
        Ok(Ok(false)) => {}
        Ok(Err(e)) => {
            debug!("Failed to read from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Connection from {} sent nothing, closing", peer);
            return;
        }
    }

    let service = service_fn(move |mut req: Request<Body>| {
        let dispatcher = dispatcher.clone();
        req.extensions_mut().insert(peer);
        async move { dispatcher.handle_request(req).await }
    });
    let conn = Http::new()
        .http1_only(true)
        .serve_connection(stream, service)
        .with_upgrades();
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("HTTP connection error from {}: {}", peer, e);
            }
        }
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!("HTTP connection error from {} during shutdown: {}", peer, e);
            }
        }
    }
}

/// Peek at the first bytes without consuming them. `false` as soon as they
/// diverge from `CONNECT `, or on EOF before anything arrived. A client that
/// stalls mid-prefix is bounded by [`FIRST_BYTES_TIMEOUT`].
async fn starts_with_connect(stream: &TcpStream) -> io::Result<bool> {
    let mut buf = [0u8; CONNECT_PREFIX.len()];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 || buf[..n] != CONNECT_PREFIX[..n] {
            return Ok(false);
        }
        if n == CONNECT_PREFIX.len() {
            return Ok(true);
        }
        // Partial prefix; peek returns the same bytes until more arrive
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Resolves once stop was requested or the handle is gone
async fn wait_for_shutdown(rx: &mut ShutdownRx) {
    while rx.borrow().is_none() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn local_config() -> Arc<Config> {
        let mut config = Config::default();
        config.http.addr = "127.0.0.1".to_string();
        config.http.port = 0;
        Arc::new(config)
    }

    async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_start_serves_and_stop_releases_port() {
        let server = ServerHandle::start(local_config()).await.unwrap();
        let addr = server.local_addr();
        assert!(server.is_running());

        // Proxy is disabled by default, so a relative request is a 404
        let response = raw_exchange(
            addr,
            b"GET /anything HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "got {response}");

        server.stop().await;
        TcpListener::bind(addr).await.expect("port released after stop");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.http.addr = "127.0.0.1".to_string();
        config.http.port = taken.local_addr().unwrap().port();

        let err = ServerHandle::start(Arc::new(config)).await.err().unwrap();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_hold_up_stop() {
        let server = ServerHandle::start(local_config()).await.unwrap();
        let _idle = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), server.stop_with_grace(Duration::from_secs(10)))
            .await
            .expect("idle connections close on shutdown");
    }

    #[tokio::test]
    async fn test_connect_prefix_detection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        for (payload, expected) in [
            (&b"CONNECT example.com:443 HTTP/1.1\r\n\r\n"[..], true),
            (&b"GET / HTTP/1.1\r\n\r\n"[..], false),
            (&b"CONNEX"[..], false),
        ] {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let (server_side, _) = listener.accept().await.unwrap();
            client.write_all(payload).await.unwrap();

            let detected = starts_with_connect(&server_side).await.unwrap();
            assert_eq!(detected, expected, "payload {:?}", String::from_utf8_lossy(payload));
        }
    }
}
