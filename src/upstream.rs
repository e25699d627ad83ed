//! Upstream DNS-over-HTTPS client.
//!
//! Every query without a local override is POSTed verbatim to a single
//! upstream resolver and the response body is returned unmodified.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;

use crate::error::ConfigError;
use crate::pool::BufferPool;

/// Media type of wire-format DNS messages.
pub const DNS_MESSAGE: &str = "application/dns-message";

/// Largest DNS message we accept back from the upstream.
pub const MAX_RESPONSE_SIZE: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),
    #[error("reading body failed: {0}")]
    Body(#[from] hyper::Error),
    #[error("upstream answered {0}")]
    Status(StatusCode),
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("response exceeds 65535 bytes")]
    TooLarge,
    #[error("building request failed: {0}")]
    InvalidRequest(#[from] http::Error),
}

/// HTTPS client bound to one upstream resolver.
pub struct Upstream {
    uri: Uri,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
    pool: Arc<BufferPool>,
}

impl Upstream {
    /// Create a client for `url`.
    ///
    /// `https` is the deployment scheme; plain `http` is accepted for local
    /// resolvers.
    pub fn new(url: &str, timeout: Duration, pool: Arc<BufferPool>) -> Result<Self, ConfigError> {
        let uri: Uri = url.parse().map_err(|e| ConfigError::InvalidValue {
            field: "upstream",
            reason: format!("{url}: {e}"),
        })?;
        match uri.scheme_str() {
            Some("https") | Some("http") => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "upstream",
                    reason: format!("unsupported scheme {other:?}"),
                });
            }
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            uri,
            client,
            timeout,
            pool,
        })
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Forward a raw query and return the raw response.
    pub async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        tokio::time::timeout(self.timeout, self.exchange(query))
            .await
            .map_err(|_| UpstreamError::Timeout(self.timeout))?
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let request = Request::post(self.uri.clone())
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .header(header::ACCEPT, DNS_MESSAGE)
            .body(Full::new(Bytes::copy_from_slice(query)))?;

        let response = self.client.request(request).await?;
        if !response.status().is_success() {
            return Err(UpstreamError::Status(response.status()));
        }

        // Drain every frame; a body may arrive in many chunks.
        let mut body = response.into_body();
        let mut buf = self.pool.get_empty();
        while let Some(frame) = body.frame().await {
            let Ok(data) = frame?.into_data() else {
                continue;
            };
            if buf.len() + data.len() > MAX_RESPONSE_SIZE {
                return Err(UpstreamError::TooLarge);
            }
            buf.extend_from_slice(&data);
        }

        Ok(buf.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use http::Response;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Serve `status` and `body` for every request on a loopback port.
    pub(crate) async fn mock_upstream(status: StatusCode, body: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let body = Bytes::from(body);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let body = body.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let body = body.clone();
                        async move {
                            assert_eq!(req.method(), http::Method::POST);
                            assert_eq!(
                                req.headers().get(header::CONTENT_TYPE).unwrap(),
                                DNS_MESSAGE
                            );
                            let mut response = Response::new(Full::new(body));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        addr
    }

    pub(crate) fn upstream_for(addr: SocketAddr) -> Upstream {
        Upstream::new(
            &format!("http://{addr}/dns-query"),
            Duration::from_secs(5),
            Arc::new(BufferPool::new(512, 8)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn forward_returns_body_unmodified() {
        let addr = mock_upstream(StatusCode::OK, vec![1, 2, 3, 4, 5]).await;

        let response = upstream_for(addr).forward(&[9, 9, 9]).await.unwrap();

        assert_eq!(response, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn forward_drains_bodies_larger_than_pool_buffer() {
        let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let addr = mock_upstream(StatusCode::OK, body.clone()).await;

        let response = upstream_for(addr).forward(&[0; 12]).await.unwrap();

        assert_eq!(response, body);
    }

    #[tokio::test]
    async fn forward_rejects_non_success_status() {
        let addr = mock_upstream(StatusCode::SERVICE_UNAVAILABLE, Vec::new()).await;

        let err = upstream_for(addr).forward(&[0; 12]).await.unwrap_err();

        assert!(matches!(
            err,
            UpstreamError::Status(StatusCode::SERVICE_UNAVAILABLE)
        ));
    }

    #[tokio::test]
    async fn forward_rejects_oversized_body() {
        let addr = mock_upstream(StatusCode::OK, vec![0; MAX_RESPONSE_SIZE + 1]).await;

        let err = upstream_for(addr).forward(&[0; 12]).await.unwrap_err();

        assert!(matches!(err, UpstreamError::TooLarge));
    }

    #[tokio::test]
    async fn forward_fails_when_upstream_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = upstream_for(addr).forward(&[0; 12]).await.unwrap_err();

        assert!(matches!(err, UpstreamError::Request(_)));
    }

    #[test]
    fn new_rejects_unknown_scheme() {
        let pool = Arc::new(BufferPool::default());

        assert!(Upstream::new("ftp://1.1.1.1/dns-query", Duration::from_secs(1), pool).is_err());
    }
}
