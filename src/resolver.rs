//! DNS query resolution logic.
//!
//! Handles the core query processing pipeline:
//! 1. Decode the query (exactly one question)
//! 2. Look the question name up in the override table
//! 3. Synthesize a local answer, or forward the raw query upstream
//!
//! Transports handle the framing, the resolver handles decisions.

use std::net::Ipv4Addr;
use std::time::Instant;

use crate::dns::DnsQuery;
use crate::error::EngineError;
use crate::filter::OverrideTable;
use crate::stats::{Stats, StatsSnapshot};
use crate::upstream::Upstream;

/// Action to take for a DNS query.
pub enum QueryAction {
    /// Query matches an override, return this response immediately.
    Override { response: Vec<u8>, domain: String },
    /// Query should be forwarded to upstream.
    Forward { domain: String },
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Override,
    Upstream,
}

/// A finished resolution, ready to be framed by a transport.
#[derive(Debug)]
pub struct Resolution {
    pub response: Vec<u8>,
    pub domain: String,
    pub source: Source,
}

/// Resolver handles DNS query processing decisions.
///
/// Shared by every transport; holds the override table, the upstream client
/// and the outcome counters.
pub struct Resolver {
    overrides: OverrideTable,
    upstream: Upstream,
    stats: Stats,
}

impl Resolver {
    pub fn new(overrides: OverrideTable, upstream: Upstream) -> Self {
        Self {
            overrides,
            upstream,
            stats: Stats::new(),
        }
    }

    /// Decode a query and decide what to do with it.
    ///
    /// Call this with the raw DNS query (without any transport framing).
    pub fn process_query(&self, query: &[u8]) -> Result<QueryAction, EngineError> {
        let parsed = DnsQuery::parse(query)?;
        let domain = parsed.domain();

        let Some((_, value)) = self.overrides.lookup(&domain) else {
            return Ok(QueryAction::Forward { domain });
        };

        let addr: Ipv4Addr = value.parse().map_err(|_| EngineError::InvalidOverrideAddress {
            domain: domain.clone(),
            value: value.to_string(),
        })?;
        let response = parsed.override_response(addr)?;

        Ok(QueryAction::Override { response, domain })
    }

    /// Resolve a query end to end, forwarding upstream when no override
    /// applies. Upstream bytes are returned unmodified.
    pub async fn resolve(&self, query: &[u8]) -> Result<Resolution, EngineError> {
        let start_time = Instant::now();

        let result = match self.process_query(query) {
            Ok(QueryAction::Override { response, domain }) => Ok(Resolution {
                response,
                domain,
                source: Source::Override,
            }),
            Ok(QueryAction::Forward { domain }) => {
                self.upstream
                    .forward(query)
                    .await
                    .map(|response| Resolution {
                        response,
                        domain,
                        source: Source::Upstream,
                    })
                    .map_err(EngineError::from)
            }
            Err(e) => Err(e),
        };

        let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(r) if r.source == Source::Override => self.stats.record_overridden(elapsed_ms),
            Ok(_) => self.stats.record_forwarded(elapsed_ms),
            Err(_) => self.stats.record_failed(elapsed_ms),
        }

        result
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_snapshot_and_reset(&self) -> StatsSnapshot {
        self.stats.snapshot_and_reset()
    }

    /// Returns the number of override entries.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    pub fn upstream_uri(&self) -> &http::Uri {
        self.upstream.uri()
    }
}
