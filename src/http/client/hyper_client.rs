//! Hyper HTTP client configuration for high-performance upstream requests.
//!
//! Implements optimized connection pool settings for highload scenarios:
//! - Max connections per host: 2048 (idle pool)
//! - Max idle connection duration: 30s
//! - Connection timeout: 3s
//! - TCP keep-alive: 30s
//! - TCP_NODELAY: enabled
//! - HTTP/2 optimizations: adaptive window, large initial window, keep-alive
//! - Retry canceled requests: enabled

use std::time::Duration;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::dns::GaiResolver;
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

/// Error type carried by proxied request bodies. Request bodies may
/// originate from axum (`axum::Error`) or from a hand-built `Empty` (the
/// probe path), so the client is generic over a boxed `std::error::Error`
/// rather than tied to `hyper::Error`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Connection pool configuration constants.
pub const CONNS_PER_HOST: usize = 2048;
pub const MAX_IDLE_CONN_DURATION: Duration = Duration::from_secs(30);
#[allow(dead_code)]
pub const MAX_CONN_WAIT_TIMEOUT: Duration = Duration::from_millis(500);
#[allow(dead_code)]
pub const RW_BUFFER_SIZE: usize = 16 << 10;
#[allow(dead_code)]
pub const RW_TIMEOUT: Duration = Duration::from_secs(10);
#[allow(dead_code)]
pub const MAX_IDEMPOTENT_CALL_ATTEMPTS: u32 = 3;


/// Creates a Hyper HTTP client with optimized settings for highload scenarios.
///
/// Uses `BoxBody` for requests (supports Empty/Full) and `Incoming` for responses.
/// Configured for high-throughput scenarios with:
/// - Connection reuse and pooling
/// - HTTP/2 multiplexing with adaptive flow control
/// - Optimized buffer sizes for both HTTP/1 and HTTP/2
/// - Keep-alive for long-lived connections
///
/// Note: `pool_max_idle_per_host` limits idle connections only. Active connections
/// are separate and not counted toward this limit. The actual limit on total
/// connections is determined by OS file descriptor limits and connection reuse.
pub fn create_client() -> Client<HttpsConnector<HttpConnector<GaiResolver>>, ProxyBody> {
    let resolver = GaiResolver::new();
    
    let mut http_connector = HttpConnector::new_with_resolver(resolver);
    http_connector.set_nodelay(true);
    http_connector.set_keepalive(Some(Duration::from_secs(30)));
    http_connector.set_connect_timeout(Some(Duration::from_secs(3)));
    
    // Use HTTP/1.1 only to ensure Host header is sent as HTTP/1.1 header, not :authority
    let tls = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .expect("Failed to load native root certificates")
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);
    
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(MAX_IDLE_CONN_DURATION)
        .pool_max_idle_per_host(CONNS_PER_HOST)
        .http1_title_case_headers(false)
        .http1_allow_obsolete_multiline_headers_in_responses(true)
        .retry_canceled_requests(true)
        
        .build(tls)
}

pub type HyperClient = Client<HttpsConnector<HttpConnector<GaiResolver>>, ProxyBody>;

/// Creates a client tuned for the active monitor's health probes: short
/// dial/handshake timeouts, keep-alives disabled, unbounded idle
/// connections per host (probes are infrequent and short-lived, so pooling
/// them doesn't matter).
pub fn create_probe_client() -> HyperClient {
    let resolver = GaiResolver::new();

    let mut http_connector = HttpConnector::new_with_resolver(resolver);
    http_connector.set_nodelay(true);
    http_connector.set_keepalive(None);
    http_connector.set_connect_timeout(Some(Duration::from_secs(10)));

    let tls = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .expect("Failed to load native root certificates")
        .https_or_http()
        .enable_http1()
        .wrap_connector(http_connector);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(0))
        .pool_max_idle_per_host(0)
        .http1_title_case_headers(false)
        .retry_canceled_requests(false)
        .build(tls)
}
