//! SNI passthrough relay.
//!
//! Inbound TLS connections are never terminated here. The ClientHello is read
//! through a recording adapter so the server name can be extracted, then the
//! recorded bytes are replayed to the chosen backend and the rest of the
//! connection is piped through untouched.

pub mod relay;
pub mod router;

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use rustls::server::Acceptor;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error};

use crate::error::SniError;
use relay::relay;
use router::{RouteError, Router};

/// Sent to clients whose ClientHello names no server.
const MISSING_SNI_RESPONSE: &[u8] = b"HTTP/1.1 502 OK\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 21\r\n\
\r\n\
nginx, malformed data";

/// A typical ClientHello fits in one or two TCP segments.
const INITIAL_REPLAY_CAPACITY: usize = 2048;

/// What was learned from a peeked ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloInfo {
    server_name: Option<String>,
}

impl ClientHelloInfo {
    /// The requested server name, empty when the client sent none.
    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_default()
    }
}

/// Read-only view over a stream that mirrors every byte read into `seen`.
///
/// Writes fail immediately so the TLS state machine can never send anything
/// to the real client.
struct RecordingReader<'a, S> {
    inner: &'a mut S,
    seen: &'a mut Vec<u8>,
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordingReader<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        this.seen.extend_from_slice(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncWrite for RecordingReader<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "client hello peek is read-only",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Extract the server name from the ClientHello at the start of `stream`.
///
/// Returns the parsed hello together with every byte consumed from `stream`,
/// which must be replayed to whatever backend the connection is handed to.
/// The handshake is abandoned as soon as the ClientHello is parsed.
pub async fn peek_client_hello<S>(
    stream: &mut S,
    limit: Duration,
) -> Result<(ClientHelloInfo, Vec<u8>), SniError>
where
    S: AsyncRead + Unpin,
{
    let mut replay = Vec::with_capacity(INITIAL_REPLAY_CAPACITY);

    let server_name = {
        let reader = RecordingReader {
            inner: stream,
            seen: &mut replay,
        };
        let acceptor = LazyConfigAcceptor::new(Acceptor::default(), reader);
        let start = match tokio::time::timeout(limit, acceptor).await {
            Ok(Ok(start)) => start,
            Ok(Err(e)) => return Err(SniError::Handshake(e)),
            Err(_) => return Err(SniError::Timeout),
        };
        start.client_hello().server_name().map(str::to_owned)
    };

    Ok((ClientHelloInfo { server_name }, replay))
}

/// Deadlines applied to each relayed connection.
#[derive(Debug, Clone, Copy)]
pub struct SniTimeouts {
    pub client_hello: Duration,
    pub connect: Duration,
}

/// TCP listener that routes connections by SNI.
pub struct SniTransport {
    listener: TcpListener,
}

impl SniTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the relay, spawning one task per accepted connection.
    pub fn start(self, router: Arc<Router>, timeouts: SniTimeouts) {
        tokio::spawn(run_accept_loop(self.listener, router, timeouts));
    }
}

async fn run_accept_loop(listener: TcpListener, router: Arc<Router>, timeouts: SniTimeouts) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(client, peer, router.clone(), timeouts));
            }
            Err(e) => {
                error!("SNI accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    timeouts: SniTimeouts,
) {
    let (hello, replay) = match peek_client_hello(&mut client, timeouts.client_hello).await {
        Ok(peeked) => peeked,
        Err(e) => {
            debug!(%peer, "SNI peek failed: {}", e);
            return;
        }
    };

    let backend = match router.route(hello.server_name()) {
        Ok(backend) => backend,
        Err(RouteError::MissingServerName) => {
            debug!(%peer, "empty SNI rejected");
            if let Err(e) = client.write_all(MISSING_SNI_RESPONSE).await {
                debug!(%peer, "failed to write rejection: {}", e);
            }
            let _ = client.shutdown().await;
            return;
        }
        Err(e) => {
            debug!(%peer, "{}", e);
            return;
        }
    };

    let upstream = match tokio::time::timeout(timeouts.connect, backend.connect()).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            debug!(%peer, %backend, "backend dial failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, %backend, "backend dial timed out");
            return;
        }
    };

    match relay(client, upstream, &replay).await {
        Ok(stats) => debug!(
            %peer,
            %backend,
            sni = hello.server_name(),
            sent = stats.client_to_backend,
            received = stats.backend_to_client,
            "relay finished"
        ),
        Err(e) => debug!(%peer, %backend, "relay aborted: {}", e),
    }
}
