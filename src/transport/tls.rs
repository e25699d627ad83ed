//! DNS-over-TLS transport.
//!
//! Each client connection is handled independently: complete the TLS
//! handshake with the node's certificate, read one length-prefixed query,
//! resolve it and write back one length-prefixed response. DoT messages are
//! prefixed with a 2-byte big-endian length in both directions.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use super::{Protocol, QueryLogger};
use crate::limiter::RateLimiter;
use crate::pool::{BufferPool, PooledBuffer};
use crate::resolver::Resolver;

/// Upper bound on the server-side TLS handshake.
const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on reading the framed query once the handshake is done.
pub const QUERY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// DoT transport for the DNS proxy.
///
/// Binds to a local address and accepts connections from clients.
/// Each connection is handled in a separate task.
pub struct TlsTransport {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsTransport {
    /// Bind a TCP listener that will serve TLS with `tls_config`.
    pub async fn bind(addr: SocketAddr, tls_config: Arc<ServerConfig>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls_config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the DoT transport.
    ///
    /// Spawns an accept loop that handles each connection in a separate task.
    pub fn start(self, resolver: Arc<Resolver>, limiter: Arc<RateLimiter>, pool: Arc<BufferPool>) {
        tokio::spawn(run_accept_loop(
            self.listener,
            self.acceptor,
            resolver,
            limiter,
            pool,
        ));
    }
}

/// Accept loop - spawns a handler task for each incoming connection.
async fn run_accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    resolver: Arc<Resolver>,
    limiter: Arc<RateLimiter>,
    pool: Arc<BufferPool>,
) {
    loop {
        match listener.accept().await {
            Ok((client, peer)) => {
                tokio::spawn(handle_connection(
                    client,
                    peer,
                    acceptor.clone(),
                    resolver.clone(),
                    limiter.clone(),
                    pool.clone(),
                ));
            }
            Err(e) => {
                error!("DoT accept error: {}", e);
            }
        }
    }
}

/// Handle a single DoT connection: handshake, then one exchange.
async fn handle_connection(
    client: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    resolver: Arc<Resolver>,
    limiter: Arc<RateLimiter>,
    pool: Arc<BufferPool>,
) {
    let mut stream = match tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(client)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(%peer, "DoT handshake failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, "DoT handshake timed out");
            return;
        }
    };

    if let Err(e) =
        serve_exchange(&mut stream, &resolver, &limiter, &pool, QUERY_READ_TIMEOUT).await
    {
        debug!(%peer, "DoT exchange failed: {}", e);
    }
}

/// Serve one length-prefixed query/response exchange on `stream`.
///
/// Rate-limited and unresolvable queries close the exchange without a
/// response; only I/O failures are returned as errors. A query that is not
/// fully read within `read_timeout` fails with [`io::ErrorKind::TimedOut`].
pub async fn serve_exchange<S>(
    stream: &mut S,
    resolver: &Resolver,
    limiter: &RateLimiter,
    pool: &BufferPool,
    read_timeout: Duration,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let logger = QueryLogger::new(Protocol::Dot);

    let query = match tokio::time::timeout(read_timeout, read_frame(stream, pool)).await {
        Ok(query) => query?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "DoT query not received in time",
            ));
        }
    };

    if !limiter.allow() {
        resolver.stats().record_rate_limited();
        logger.rate_limited();
        return Ok(());
    }

    let start_time = Instant::now();
    let resolution = match resolver.resolve(&query).await {
        Ok(resolution) => resolution,
        Err(e) => {
            logger.failed(&e);
            return Ok(());
        }
    };
    drop(query);
    logger.resolved(&resolution, start_time.elapsed().as_secs_f64() * 1000.0);

    let Ok(response_len) = u16::try_from(resolution.response.len()) else {
        warn!(
            domain = %resolution.domain,
            bytes = resolution.response.len(),
            "DoT response too large to frame"
        );
        return Ok(());
    };

    let mut framed = Vec::with_capacity(2 + resolution.response.len());
    framed.extend_from_slice(&response_len.to_be_bytes());
    framed.extend_from_slice(&resolution.response);

    stream.write_all(&framed).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Read one length-prefixed message into a pooled buffer.
async fn read_frame<'p, S>(stream: &mut S, pool: &'p BufferPool) -> io::Result<PooledBuffer<'p>>
where
    S: AsyncRead + Unpin,
{
    let msg_len = stream.read_u16().await? as usize;
    let mut query = pool.get(msg_len);
    stream.read_exact(&mut query).await?;
    Ok(query)
}
