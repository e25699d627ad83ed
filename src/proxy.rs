//! Proxy orchestration.
//!
//! Builds the shared state, binds every listener and runs until the process
//! is terminated.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::Config;
use crate::filter::OverrideTable;
use crate::limiter::RateLimiter;
use crate::pool::BufferPool;
use crate::resolver::Resolver;
use crate::sni::router::Router;
use crate::sni::{SniTimeouts, SniTransport};
use crate::transport::https::{BODY_READ_TIMEOUT, DohHandler, HttpsTransport};
use crate::transport::tls::TlsTransport;
use crate::upstream::Upstream;

/// Run the proxy with the given configuration.
///
/// Any failure before all three listeners are serving is returned; after
/// that the proxy runs indefinitely.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let pool = Arc::new(BufferPool::default());
    let (rate, burst) = config.rate_quota()?;
    let limiter = Arc::new(RateLimiter::new(rate, burst));

    let upstream = Upstream::new(&config.upstream, config.upstream_timeout(), pool.clone())
        .context("invalid upstream resolver")?;
    let resolver = Arc::new(Resolver::new(OverrideTable::new(&config.domains), upstream));
    let router = Arc::new(Router::from_config(&config));

    let tls_config = config
        .load_server_tls()
        .context("failed to load DoT certificate")?;

    let sni = SniTransport::bind(config.sni_listen)
        .await
        .with_context(|| format!("failed to bind SNI listener on {}", config.sni_listen))?;
    let dot = TlsTransport::bind(config.dot_listen, tls_config)
        .await
        .with_context(|| format!("failed to bind DoT listener on {}", config.dot_listen))?;
    let doh = HttpsTransport::bind(config.doh_listen)
        .await
        .with_context(|| format!("failed to bind DoH listener on {}", config.doh_listen))?;

    info!(
        host = %config.host,
        overrides = resolver.override_count(),
        upstream = %resolver.upstream_uri(),
        "proxy starting"
    );
    info!(sni = %config.sni_listen, dot = %config.dot_listen, doh = %config.doh_listen, "listening");

    sni.start(
        router,
        SniTimeouts {
            client_hello: config.client_hello_timeout(),
            connect: config.connect_timeout(),
        },
    );
    dot.start(resolver.clone(), limiter.clone(), pool);
    doh.start(Arc::new(DohHandler::new(
        resolver.clone(),
        limiter,
        BODY_READ_TIMEOUT,
    )));

    // Log stats every minute
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            let stats = resolver.stats_snapshot_and_reset();
            info!(
                requests = stats.requests,
                overridden = stats.overridden,
                forwarded = stats.forwarded,
                failed = stats.failed,
                rate_limited = stats.rate_limited,
                avg_response_ms = stats.avg_response_ms,
                "[stats]"
            );
        }
    });

    std::future::pending::<()>().await;

    Ok(())
}
