//! DNS-over-HTTPS transport.
//!
//! Serves RFC 8484 style requests on a single path. TLS is terminated in
//! front of this listener, so it speaks plain HTTP/1.1 on loopback.
//!
//! - `POST /dns-query` with the raw DNS message as body
//! - `GET /dns-query?dns=<base64url without padding>`

use std::convert::Infallible;
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tracing::{debug, error};

use super::{MAX_DNS_MESSAGE_SIZE, Protocol, QueryLogger};
use crate::limiter::RateLimiter;
use crate::resolver::Resolver;
use crate::upstream::DNS_MESSAGE;

/// The only path answered by the DoH listener.
pub const DOH_PATH: &str = "/dns-query";

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on receiving a POST body.
pub const BODY_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// DoH transport for the DNS proxy.
pub struct HttpsTransport {
    listener: TcpListener,
}

impl HttpsTransport {
    /// Bind the HTTP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start the DoH transport.
    ///
    /// Spawns an accept loop; hyper drives each connection in its own task.
    pub fn start(self, handler: Arc<DohHandler>) {
        tokio::spawn(run_accept_loop(self.listener, handler));
    }
}

async fn run_accept_loop(listener: TcpListener, handler: Arc<DohHandler>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("DoH accept error: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler.handle(req).await) }
            });

            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT);
            if let Err(e) = builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, "DoH connection error: {}", e);
            }
        });
    }
}

/// Request handler shared by every DoH connection.
pub struct DohHandler {
    resolver: Arc<Resolver>,
    limiter: Arc<RateLimiter>,
    body_timeout: Duration,
    logger: QueryLogger,
}

impl DohHandler {
    pub fn new(resolver: Arc<Resolver>, limiter: Arc<RateLimiter>, body_timeout: Duration) -> Self {
        Self {
            resolver,
            limiter,
            body_timeout,
            logger: QueryLogger::new(Protocol::Doh),
        }
    }

    /// Answer one HTTP request.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if req.uri().path() != DOH_PATH {
            return text_response(StatusCode::NOT_FOUND, "Unsupported path");
        }

        if !self.limiter.allow() {
            self.resolver.stats().record_rate_limited();
            self.logger.rate_limited();
            return text_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
        }

        let method = req.method().clone();
        let query = match method {
            Method::GET => match dns_param(req.uri()) {
                None => {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        "Missing 'dns' query parameter",
                    );
                }
                Some(Err(_)) => {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        "Invalid 'dns' query parameter",
                    );
                }
                Some(Ok(query)) => Bytes::from(query),
            },
            Method::POST => match tokio::time::timeout(
                self.body_timeout,
                Limited::new(req.into_body(), MAX_DNS_MESSAGE_SIZE).collect(),
            )
            .await
            {
                Err(_) => {
                    return text_response(StatusCode::REQUEST_TIMEOUT, "Request body timed out");
                }
                Ok(Ok(collected)) => collected.to_bytes(),
                Ok(Err(e)) if e.is::<LengthLimitError>() => {
                    return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
                }
                Ok(Err(e)) => {
                    debug!("DoH body read failed: {}", e);
                    return text_response(StatusCode::BAD_REQUEST, "Unreadable request body");
                }
            },
            _ => {
                let mut response = text_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "Only GET and POST methods are allowed",
                );
                response
                    .headers_mut()
                    .insert(header::ALLOW, HeaderValue::from_static("GET, POST"));
                return response;
            }
        };

        if query.is_empty() {
            return text_response(StatusCode::BAD_REQUEST, "Empty DNS query");
        }

        let start_time = Instant::now();
        match self.resolver.resolve(&query).await {
            Ok(resolution) => {
                self.logger
                    .resolved(&resolution, start_time.elapsed().as_secs_f64() * 1000.0);
                let mut response = Response::new(Full::new(Bytes::from(resolution.response)));
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, HeaderValue::from_static(DNS_MESSAGE));
                response
            }
            Err(e) => {
                self.logger.failed(&e);
                if e.is_client_error() {
                    text_response(StatusCode::BAD_REQUEST, "Failed to process DNS query")
                } else {
                    text_response(StatusCode::BAD_GATEWAY, "Upstream resolver failed")
                }
            }
        }
    }
}

/// Decode the `dns` query parameter, if present.
fn dns_param(uri: &Uri) -> Option<Result<Vec<u8>, base64::DecodeError>> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "dns")
        .map(|(_, value)| URL_SAFE_NO_PAD.decode(value.as_bytes()))
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    use hickory_proto::op::Message;
    use hickory_proto::rr::RecordType;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::RData;
    use http_body_util::StreamBody;
    use hyper::body::Frame;
    use hyper_util::client::legacy::Client;
    use hyper_util::rt::TokioExecutor;
    use rustc_hash::FxHashMap;

    use crate::dns::tests::build_query;
    use crate::filter::OverrideTable;
    use crate::resolver::tests::resolver_with;
    use crate::upstream::tests::{mock_upstream, upstream_for};

    fn handler(resolver: Resolver, burst: u32) -> DohHandler {
        let limiter = RateLimiter::new(NonZeroU32::new(1).unwrap(), NonZeroU32::new(burst).unwrap());
        DohHandler::new(Arc::new(resolver), Arc::new(limiter), BODY_READ_TIMEOUT)
    }

    fn post(path: &str, body: Vec<u8>) -> Request<Full<Bytes>> {
        Request::post(path)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::get(uri).body(Full::new(Bytes::new())).unwrap()
    }

    async fn body(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn post_and_get_produce_identical_responses() {
        let handler = handler(resolver_with(&[("example", "203.0.113.9")], Vec::new()).await, 10);
        let query = build_query(0x5151, "www.example.com.", RecordType::A);
        let encoded = URL_SAFE_NO_PAD.encode(&query);

        let posted = handler.handle(post(DOH_PATH, query.clone())).await;
        let fetched = handler.handle(get(&format!("{DOH_PATH}?dns={encoded}"))).await;

        assert_eq!(posted.status(), StatusCode::OK);
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(posted.headers()[header::CONTENT_TYPE], DNS_MESSAGE);
        let posted = body(posted).await;
        assert_eq!(posted, body(fetched).await);

        let message = Message::from_vec(&posted).unwrap();
        assert_eq!(message.id(), 0x5151);
        assert_eq!(
            message.answers()[0].data(),
            &RData::A(A("203.0.113.9".parse().unwrap()))
        );
    }

    #[tokio::test]
    async fn unmatched_query_returns_upstream_bytes() {
        let upstream_body = vec![0x42; 5000];
        let handler = handler(resolver_with(&[], upstream_body.clone()).await, 10);
        let query = build_query(3, "rust-lang.org.", RecordType::A);

        let response = handler.handle(post(DOH_PATH, query)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, upstream_body);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);

        let response = handler.handle(get("/resolve?dns=AAAA")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_without_dns_param_is_bad_request() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);

        let response = handler.handle(get("/dns-query?name=example.com")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_with_padded_or_invalid_base64_is_bad_request() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);

        let padded = handler.handle(get("/dns-query?dns=AAE%3D")).await;
        let garbage = handler.handle(get("/dns-query?dns=!!!")).await;

        assert_eq!(padded.status(), StatusCode::BAD_REQUEST);
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);
        let request = Request::put(DOH_PATH)
            .body(Full::new(Bytes::from_static(b"x")))
            .unwrap();

        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, POST");
    }

    #[tokio::test]
    async fn empty_post_is_bad_request() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);

        let response = handler.handle(post(DOH_PATH, Vec::new())).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_query_is_bad_request() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);

        let response = handler.handle(post(DOH_PATH, vec![0xFF; 5])).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_post_is_rejected() {
        let handler = handler(resolver_with(&[], Vec::new()).await, 10);

        let response = handler
            .handle(post(DOH_PATH, vec![0; MAX_DNS_MESSAGE_SIZE + 1]))
            .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn stalled_post_body_times_out() {
        let resolver = resolver_with(&[], Vec::new()).await;
        let limiter = RateLimiter::new(NonZeroU32::new(1).unwrap(), NonZeroU32::new(10).unwrap());
        let handler = DohHandler::new(
            Arc::new(resolver),
            Arc::new(limiter),
            Duration::from_millis(50),
        );
        let stalled = StreamBody::new(futures::stream::pending::<Result<Frame<Bytes>, Infallible>>());
        let request = Request::post(DOH_PATH)
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .body(stalled)
            .unwrap();

        let response = handler.handle(request).await;

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn rate_limited_request_is_429() {
        let handler = handler(resolver_with(&[("example", "203.0.113.9")], Vec::new()).await, 1);
        let query = build_query(1, "www.example.com.", RecordType::A);

        let first = handler.handle(post(DOH_PATH, query.clone())).await;
        let second = handler.handle(post(DOH_PATH, query)).await;

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway() {
        let addr = mock_upstream(StatusCode::SERVICE_UNAVAILABLE, Vec::new()).await;
        let resolver = Resolver::new(OverrideTable::new(&FxHashMap::default()), upstream_for(addr));
        let handler = handler(resolver, 10);
        let query = build_query(1, "rust-lang.org.", RecordType::A);

        let response = handler.handle(post(DOH_PATH, query)).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn transport_serves_over_http() {
        let handler = handler(resolver_with(&[("example", "203.0.113.9")], Vec::new()).await, 10);
        let transport = HttpsTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        transport.start(Arc::new(handler));

        let client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let query = build_query(0x0909, "example.com.", RecordType::A);
        let request = Request::post(format!("http://{addr}{DOH_PATH}"))
            .header(header::CONTENT_TYPE, DNS_MESSAGE)
            .body(Full::new(Bytes::from(query)))
            .unwrap();

        let response = client.request(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(Message::from_vec(&bytes).unwrap().id(), 0x0909);
    }
}
