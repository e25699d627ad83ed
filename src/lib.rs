//! ssni - SNI passthrough router and DNS override proxy.
//!
//! Relays TLS connections by the server name in their ClientHello without
//! terminating them, and answers DNS-over-TLS / DNS-over-HTTPS queries from
//! a local override table, forwarding everything else to an upstream
//! resolver.

pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod limiter;
pub mod pool;
pub mod proxy;
pub mod resolver;
pub mod sni;
pub mod stats;
pub mod transport;
pub mod upstream;
