//! Benchmarks for ClientHello peeking.
//!
//! Measures the cost of extracting the server name from a real ClientHello,
//! including recording the bytes for replay.

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use tokio::runtime::Runtime;

use ssni::sni::peek_client_hello;
use ssni::sni::router::Router;

fn build_client_hello(server_name: &str) -> Vec<u8> {
    let config = ClientConfig::builder()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    let name = ServerName::try_from(server_name.to_string()).expect("valid server name");
    let mut conn = ClientConnection::new(Arc::new(config), name).expect("client connection");

    let mut hello = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut hello).expect("write client hello");
    }
    hello
}

fn bench_peek(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let hello = build_client_hello("edge.example.com");

    let mut group = c.benchmark_group("sni");
    group.throughput(Throughput::Bytes(hello.len() as u64));

    let hello = hello.as_slice();
    group.bench_function(BenchmarkId::new("peek_client_hello", "in_memory"), |b| {
        b.to_async(&rt).iter(|| async move {
            let mut input: &[u8] = hello;
            peek_client_hello(&mut input, Duration::from_secs(1))
                .await
                .expect("client hello")
        })
    });

    group.finish();
}

fn bench_route(c: &mut Criterion) {
    let router = Router::new(
        "edge.example.com",
        "127.0.0.1:8443".parse().expect("socket addr"),
        443,
        Some(".example.com".to_string()),
    );

    let mut group = c.benchmark_group("sni");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("route", "local"), |b| {
        b.iter(|| router.route(criterion::black_box("edge.example.com")))
    });

    group.bench_function(BenchmarkId::new("route", "remote"), |b| {
        b.iter(|| router.route(criterion::black_box("api.example.com")))
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_peek(&mut criterion);
    bench_route(&mut criterion);
    criterion.final_summary();
}
