//! Transport layer implementations for the DNS proxy.
//!
//! Provides DNS-over-TLS and DNS-over-HTTPS front ends that deframe client
//! queries, hand them to the [`Resolver`](crate::resolver::Resolver) and
//! frame the responses.

pub mod https;
pub mod tls;

use tracing::debug;

use crate::error::EngineError;
use crate::resolver::{Resolution, Source};

/// Maximum size of a DNS message on a stream transport.
pub const MAX_DNS_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy)]
pub enum Protocol {
    Dot,
    Doh,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Dot => "DoT",
            Protocol::Doh => "DoH",
        }
    }
}

/// Logger for DNS query events.
pub struct QueryLogger {
    protocol: Protocol,
}

impl QueryLogger {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn resolved(&self, resolution: &Resolution, elapsed_ms: f64) {
        let outcome = match resolution.source {
            Source::Override => "OVERRIDDEN",
            Source::Upstream => "FORWARDED",
        };
        debug!(
            protocol = self.protocol.as_str(),
            domain = %resolution.domain,
            total_ms = elapsed_ms,
            bytes = resolution.response.len(),
            "{outcome}"
        );
    }

    pub fn failed(&self, error: &EngineError) {
        debug!(protocol = self.protocol.as_str(), error = %error, "query failed");
    }

    pub fn rate_limited(&self) {
        debug!(protocol = self.protocol.as_str(), "rate limit exceeded");
    }
}
