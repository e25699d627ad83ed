//! Bidirectional byte pump between a client and its backend.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction by a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Relay `client` and `backend` until both directions reach EOF.
///
/// `replay` holds client bytes already consumed while peeking and is
/// written to the backend before any live client bytes. Each direction
/// half-closes its destination once its source is exhausted. The first I/O
/// error in either direction aborts the whole relay.
pub async fn relay<C, B>(client: C, backend: B, replay: &[u8]) -> io::Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upload = async {
        backend_write.write_all(replay).await?;
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await?;
        backend_write.shutdown().await?;
        Ok::<_, io::Error>(replay.len() as u64 + copied)
    };

    let download = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<_, io::Error>(copied)
    };

    let (client_to_backend, backend_to_client) = futures::future::try_join(upload, download).await?;

    Ok(RelayStats {
        client_to_backend,
        backend_to_client,
    })
}
