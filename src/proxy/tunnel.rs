//! CONNECT tunnelling: an opaque byte pipe between client and target.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Status line written to a hijacked client once the target is dialed
pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[derive(Debug, Clone)]
pub struct TunnelRelay {
    dial_timeout: Duration,
}

impl Default for TunnelRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRelay {
    pub fn new() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
        }
    }

    pub fn with_dial_timeout(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }

    /// Open the TCP connection to `target` (`host:port`)
    pub async fn dial(&self, target: &str) -> ProxyResult<TcpStream> {
        match tokio::time::timeout(self.dial_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(ProxyError::tunnel(target, e.to_string())),
            Err(_) => Err(ProxyError::tunnel(
                target,
                format!("dial timed out after {:?}", self.dial_timeout),
            )),
        }
    }

    /// Relay bytes both ways until either side finishes, then close both.
    ///
    /// Each direction runs as its own task; when the first ends the other is
    /// aborted, which drops every half of both connections. Cancelling the
    /// relay itself aborts both directions too.
    pub async fn relay<C>(client: C, target: TcpStream, label: &str)
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (target_read, target_write) = target.into_split();

        let mut pipes = JoinSet::new();
        pipes.spawn(async move { ("client->target", pipe(client_read, target_write).await) });
        pipes.spawn(async move { ("target->client", pipe(target_read, client_write).await) });

        if let Some(first) = pipes.join_next().await {
            report(label, first);
        }
        pipes.shutdown().await;
        debug!(tunnel = %label, "Tunnel closed");
    }
}

async fn pipe<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    copied
}

fn report(label: &str, finished: Result<(&'static str, io::Result<u64>), JoinError>) {
    match finished {
        Ok((direction, Ok(bytes))) => debug!(tunnel = %label, direction, bytes, "Tunnel direction finished"),
        Ok((direction, Err(e))) if is_connection_closed(&e) => {
            debug!(tunnel = %label, direction, "Tunnel peer closed: {}", e)
        }
        Ok((direction, Err(e))) => warn!(tunnel = %label, direction, "Error during transfer: {}", e),
        Err(e) => warn!(tunnel = %label, "Transfer task failed: {}", e),
    }
}

/// Errors that just mean the other side went away
pub fn is_connection_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_closed_connection_classification() {
        assert!(is_connection_closed(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_connection_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_connection_closed(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_connection_closed(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_connection_closed(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_dial_failure_is_tunnel_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TunnelRelay::new().dial(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Tunnel { .. }));
    }

    #[tokio::test]
    async fn test_relay_is_bidirectional_and_closes_both_sides() {
        // Target echoes one message and then hangs up
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = target_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong:").await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let (client_side, proxy_side) = tokio::io::duplex(1024);
        let target = TunnelRelay::new()
            .dial(&target_addr.to_string())
            .await
            .unwrap();
        let relay = tokio::spawn(TunnelRelay::relay(proxy_side, target, "test"));

        let mut client_side = client_side;
        client_side.write_all(b"hello").await.unwrap();
        let mut received = Vec::new();
        client_side.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"pong:hello");
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should finish once the target closes")
            .unwrap();
    }
}
