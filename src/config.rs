//! Proxy configuration.
//!
//! Loaded once from a JSON file at startup and shared read-only afterwards.
//! Only `host` and `domains` are required; everything else has a default
//! matching a typical single-node deployment.

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Upstream resolver used for every query without a local override.
pub const DEFAULT_UPSTREAM: &str = "https://1.1.1.1/dns-query";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's own hostname.
    pub host: String,
    /// Override table: lookup key -> IPv4 literal.
    pub domains: FxHashMap<String, String>,
    /// When set, SNI names must end with this suffix to be relayed.
    pub allowed_suffix: Option<String>,

    pub sni_listen: SocketAddr,
    pub dot_listen: SocketAddr,
    pub doh_listen: SocketAddr,

    /// Backend for connections naming `host`.
    pub local_backend: SocketAddr,
    /// Port dialled for every other name.
    pub backend_port: u16,

    pub upstream: String,
    pub upstream_timeout_secs: u64,
    pub client_hello_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Root of the `<cert_dir>/<host>/{fullchain,privkey}.pem` layout.
    pub cert_dir: PathBuf,

    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rate: u32,
    /// Bucket capacity.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rate: 10, burst: 50 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: String::new(),
            domains: FxHashMap::default(),
            allowed_suffix: None,
            sni_listen: SocketAddr::from(([0, 0, 0, 0], 443)),
            dot_listen: SocketAddr::from(([0, 0, 0, 0], 853)),
            doh_listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            local_backend: SocketAddr::from(([127, 0, 0, 1], 8443)),
            backend_port: 443,
            upstream: DEFAULT_UPSTREAM.to_string(),
            upstream_timeout_secs: 5,
            client_hello_timeout_secs: 5,
            connect_timeout_secs: 5,
            cert_dir: PathBuf::from("/etc/letsencrypt/live"),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&data)
    }

    /// Parse and validate config JSON.
    ///
    /// Host, override keys and the allowed suffix are lowercased so later
    /// comparisons are case-insensitive.
    pub fn from_slice(data: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_slice(data)?;

        config.host = config.host.trim().to_ascii_lowercase();
        if config.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }

        config.domains = config
            .domains
            .into_iter()
            .map(|(key, value)| (key.to_lowercase(), value.trim().to_string()))
            .collect();
        for (key, value) in &config.domains {
            if value.parse::<Ipv4Addr>().is_err() {
                warn!(key = %key, value = %value, "override maps to an invalid ipv4 address");
            }
        }

        config.allowed_suffix = config
            .allowed_suffix
            .map(|suffix| suffix.trim().to_ascii_lowercase())
            .filter(|suffix| !suffix.is_empty());

        config.rate_quota()?;
        config.check_nonzero()?;
        Ok(config)
    }

    /// Timeouts and the backend port must be non-zero.
    fn check_nonzero(&self) -> Result<(), ConfigError> {
        let fields = [
            ("upstream_timeout_secs", self.upstream_timeout_secs),
            ("client_hello_timeout_secs", self.client_hello_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("backend_port", u64::from(self.backend_port)),
        ];

        match fields.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::InvalidValue {
                field,
                reason: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Rate and burst as non-zero values.
    pub fn rate_quota(&self) -> Result<(NonZeroU32, NonZeroU32), ConfigError> {
        let rate = NonZeroU32::new(self.rate_limit.rate).ok_or(ConfigError::InvalidValue {
            field: "rate_limit.rate",
            reason: "must be greater than zero".to_string(),
        })?;
        let burst = NonZeroU32::new(self.rate_limit.burst).ok_or(ConfigError::InvalidValue {
            field: "rate_limit.burst",
            reason: "must be greater than zero".to_string(),
        })?;
        Ok((rate, burst))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn client_hello_timeout(&self) -> Duration {
        Duration::from_secs(self.client_hello_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn cert_chain_path(&self) -> PathBuf {
        self.cert_dir.join(&self.host).join("fullchain.pem")
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.host).join("privkey.pem")
    }

    /// Build the server-side TLS config from this node's certificate.
    pub fn load_server_tls(&self) -> Result<Arc<ServerConfig>, ConfigError> {
        let certs = load_certs(&self.cert_chain_path())?;
        let key = load_private_key(&self.private_key_path())?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        Ok(Arc::new(config))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    let file = File::open(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::Tls(format!("{}: {}", path.display(), e)))?
        .ok_or_else(|| ConfigError::Tls(format!("{}: no private key found", path.display())))
}
