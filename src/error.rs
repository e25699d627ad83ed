//! Error types shared across the proxy.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::upstream::UpstreamError;

/// Failure while turning a raw DNS query into a response.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed dns query: {0}")]
    MalformedQuery(String),
    #[error("dns query carries no question")]
    EmptyQuestion,
    #[error("override for {domain} maps to invalid ipv4 address {value:?}")]
    InvalidOverrideAddress { domain: String, value: String },
    #[error("upstream forward failed: {0}")]
    UpstreamForward(#[from] UpstreamError),
}

impl EngineError {
    /// Whether the failure was caused by the request itself rather than by
    /// the upstream resolver.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, EngineError::UpstreamForward(_))
    }
}

/// Failure while peeking the ClientHello of an inbound connection.
#[derive(Debug, Error)]
pub enum SniError {
    #[error("no parseable client hello: {0}")]
    Handshake(#[source] io::Error),
    #[error("timed out waiting for client hello")]
    Timeout,
}

/// Failure while loading the configuration or the TLS material it names.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config field `host` must not be empty")]
    MissingHost,
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("tls material: {0}")]
    Tls(String),
}
