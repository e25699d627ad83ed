//! Backend selection for relayed connections.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::config::Config;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("client hello carries no server name")]
    MissingServerName,
    #[error("server name {0} is outside the allowed suffix")]
    NotAllowed(String),
}

/// Where a relayed connection goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// This node's own service on the loopback alternate port.
    Local(SocketAddr),
    /// The named host itself on the public TLS port.
    Remote { host: String, port: u16 },
}

impl Backend {
    pub async fn connect(&self) -> io::Result<TcpStream> {
        match self {
            Backend::Local(addr) => TcpStream::connect(addr).await,
            Backend::Remote { host, port } => TcpStream::connect((host.as_str(), *port)).await,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local(addr) => write!(f, "{addr}"),
            Backend::Remote { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Maps a ClientHello server name to a backend.
pub struct Router {
    host: String,
    local_backend: SocketAddr,
    backend_port: u16,
    allowed_suffix: Option<String>,
}

impl Router {
    pub fn new(
        host: impl Into<String>,
        local_backend: SocketAddr,
        backend_port: u16,
        allowed_suffix: Option<String>,
    ) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            local_backend,
            backend_port,
            allowed_suffix: allowed_suffix.map(|s| s.to_ascii_lowercase()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.host.clone(),
            config.local_backend,
            config.backend_port,
            config.allowed_suffix.clone(),
        )
    }

    /// Pick the backend for `server_name`.
    ///
    /// Blank names are rejected, as are names outside the allowed suffix
    /// when one is configured.
    pub fn route(&self, server_name: &str) -> Result<Backend, RouteError> {
        let name = server_name.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(RouteError::MissingServerName);
        }

        if let Some(suffix) = &self.allowed_suffix {
            if !name.ends_with(suffix.as_str()) {
                return Err(RouteError::NotAllowed(name));
            }
        }

        if name == self.host {
            return Ok(Backend::Local(self.local_backend));
        }

        Ok(Backend::Remote {
            host: name,
            port: self.backend_port,
        })
    }
}
