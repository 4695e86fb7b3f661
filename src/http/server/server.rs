//! Transport: a single axum fallback handler serves every host on every
//! configured listener, plain or TLS. There are no named routes — the host
//! header alone decides where a request goes.

use crate::accesslog::{ErrorRecord, LogRecord, LogSink};
use crate::config::{Config, ConfigTrait, Listen};
use crate::http::client::hyper_client::{self, HyperClient};
use crate::middleware::{Middleware, PanicRecoverMiddleware};
use crate::router::{Router as ProxyRouter, RouterError};
use crate::store::StoreFacade;
use crate::tls::StoreCertResolver;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use hyper::body::Body as _;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;
use tracing::{error, info, warn};
use uuid::Uuid;

const PING_HOST: &str = "__ping__";

/// Everything the fallback handler needs, shared across listeners.
pub struct Transport {
    config: Config,
    store: Arc<dyn StoreFacade>,
    router: Arc<ProxyRouter>,
    access_log: Arc<LogSink>,
    client: HyperClient,
    controllers: Vec<Box<dyn crate::controller::Controller>>,
}

impl Transport {
    pub fn new(
        config: Config,
        store: Arc<dyn StoreFacade>,
        router: Arc<ProxyRouter>,
        access_log: Arc<LogSink>,
        controllers: Vec<Box<dyn crate::controller::Controller>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            router,
            access_log,
            client: hyper_client::create_client(),
            controllers,
        })
    }

    /// Binds every configured listener and serves until `shutdown` fires.
    /// Plain listeners use `axum::serve`; TLS listeners run a manual accept
    /// loop so each connection can be resolved against store-backed
    /// certificate material by SNI.
    pub async fn serve(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut router: axum::Router<Arc<Self>> = axum::Router::new();
        for controller in &self.controllers {
            router = controller.register(router);
        }
        let router = router.fallback(fallback).with_state(self.clone());
        let app: axum::Router = PanicRecoverMiddleware::new().apply(router);

        let mut handles = Vec::new();
        for listen in self.config.listen() {
            let app = app.clone();
            let shutdown = shutdown.clone();
            let listen = listen.clone();
            let transport = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = serve_listener(transport, listen.clone(), app, shutdown).await {
                    error!(
                        component = "transport",
                        event = "listener_failed",
                        addr = %listen.addr,
                        error = %e,
                        "listener exited with error"
                    );
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn serve_listener(
    transport: Arc<Transport>,
    listen: Listen,
    app: axum::Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&listen.addr).await?;
    info!(
        component = "transport",
        event = "listening",
        addr = %listen.addr,
        tls = listen.tls,
        "listener bound"
    );

    if !listen.tls {
        return axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(Into::into);
    }

    let resolver = Arc::new(StoreCertResolver::new(
        transport.store.clone(),
        tokio::runtime::Handle::current(),
    ));
    let mut server_config = tokio_rustls::rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (tcp, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(component = "transport", event = "accept_failed", error = %e, "tls accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(tcp).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(component = "transport", event = "tls_handshake_failed", error = %e, "tls handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let svc = app.map_request(move |mut req: axum::http::Request<Body>| {
                        req.extensions_mut().insert(ConnectInfo(remote_addr));
                        req
                    });
                    let hyper_svc = hyper_util::service::TowerToHyperService::new(svc);
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, hyper_svc)
                        .await
                    {
                        warn!(component = "transport", event = "connection_error", error = %e, "tls connection ended with error");
                    }
                });
            }
        }
    }

    Ok(())
}

/// The single catch-all handler for every host on every listener.
async fn fallback(
    State(transport): State<Arc<Transport>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    let start = Instant::now();
    let host = extract_host(&req);
    let path = req.uri().path().to_string();

    if host.as_deref() == Some(PING_HOST) && path == "/" {
        return ping_response(&transport).await;
    }

    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let request_id_header = transport
        .config
        .request_id_header()
        .unwrap_or("X-Request-Id")
        .to_string();
    let request_id = ensure_request_id(&mut req, &request_id_header);
    let client_ip = client_ip_of(&req, remote_addr);

    if crate::http::server::ws::is_websocket_upgrade(&req) {
        return handle_websocket(transport, req, &host, &client_ip, &request_id, start).await;
    }

    handle_http(transport, req, &host, &path, &client_ip, &request_id, start).await
}

async fn handle_websocket(
    transport: Arc<Transport>,
    req: Request,
    host: &str,
    client_ip: &str,
    request_id: &str,
    start: Instant,
) -> Response {
    let decision = match transport.router.choose(host).await {
        Ok(decision) => decision,
        Err(err) => return router_error_response(&transport, err, host, request_id).await,
    };
    let Some(url) = decision.chosen_url.clone() else {
        return router_error_response(
            &transport,
            RouterError::AllBackendsDead(Box::new(decision)),
            host,
            request_id,
        )
        .await;
    };

    crate::metrics::add_ws_upgrades(1);
    let response = crate::http::server::ws::proxy_websocket(req, &url, host, client_ip).await;
    let is_dead = response.status() == StatusCode::BAD_GATEWAY;
    let status = response.status().as_u16();

    let access_log = transport.access_log.clone();
    let log_request_id = request_id.to_string();
    let log_backend = decision.backend_key.clone();
    let log_host = host.to_string();
    let log_ip = client_ip.to_string();
    let _ = transport
        .router
        .record_outcome(
            &decision,
            is_dead,
            access_log.is_enabled().then(|| {
                move || LogRecord {
                    remote_addr: log_ip,
                    method: "GET".to_string(),
                    path: "(websocket)".to_string(),
                    proto: "HTTP/1.1".to_string(),
                    status,
                    content_length: 0,
                    referer: "-".to_string(),
                    user_agent: "-".to_string(),
                    request_id_header: "X-Request-Id".to_string(),
                    request_id: log_request_id,
                    backend_key: log_backend,
                    forwarded_for: log_host,
                    total_duration: start.elapsed(),
                    backend_duration: start.elapsed(),
                }
            }),
        )
        .await;

    response
}

async fn handle_http(
    transport: Arc<Transport>,
    req: Request,
    host: &str,
    path: &str,
    client_ip: &str,
    request_id: &str,
    start: Instant,
) -> Response {
    let decision = match transport.router.choose(host).await {
        Ok(decision) => decision,
        Err(err) => return router_error_response(&transport, err, host, request_id).await,
    };
    let Some(upstream_url) = decision.chosen_url.clone() else {
        return router_error_response(
            &transport,
            RouterError::AllBackendsDead(Box::new(decision)),
            host,
            request_id,
        )
        .await;
    };

    let method = req.method().clone();
    let method_str = method.to_string();
    let uri_path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut headers = req.headers().clone();

    let upstream_authority = authority_of(&upstream_url);
    crate::http::server::sanitize::sanitize_hop_by_hop_request_headers(&mut headers);
    crate::http::server::sanitize::proxy_forwarded_host(&mut headers, host, &upstream_authority);
    crate::http::server::sanitize::synthesize_forwarded_for(&mut headers, client_ip);

    let target = format!("{}{}", upstream_url.trim_end_matches('/'), uri_path_and_query);
    let body = req
        .into_body()
        .map_err(|e| -> hyper_client::BoxError { Box::new(e) })
        .boxed();

    let mut builder = hyper::Request::builder().method(method).uri(&target);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    let upstream_req = match builder.body(body) {
        Ok(r) => r,
        Err(e) => {
            return backend_error_response(&transport, host, &upstream_url, request_id, &decision, &e.to_string())
                .await;
        }
    };

    let backend_start = Instant::now();
    let result = transport.client.request(upstream_req).await;
    let backend_duration = backend_start.elapsed();

    match result {
        Ok(resp) => {
            let status = resp.status();
            let (parts, incoming) = resp.into_parts();
            let mut response_headers = parts.headers;
            crate::http::server::sanitize::sanitize_hop_by_hop_response_headers(&mut response_headers);

            let content_length = incoming.size_hint().exact().unwrap_or(0);
            let body = Body::new(incoming.map_err(axum::Error::new));

            crate::metrics::add_requests(1);
            crate::metrics::record_status(status.as_u16());

            let access_log = transport.access_log.clone();
            let log_request_id = request_id.to_string();
            let log_backend = decision.backend_key.clone();
            let log_ip = client_ip.to_string();
            let log_path = path.to_string();
            let log_host = host.to_string();
            let status_u16 = status.as_u16();
            let _ = transport
                .router
                .record_outcome(
                    &decision,
                    false,
                    access_log.is_enabled().then(|| {
                        move || LogRecord {
                            remote_addr: log_ip,
                            method: method_str,
                            path: log_path,
                            proto: "HTTP/1.1".to_string(),
                            status: status_u16,
                            content_length,
                            referer: "-".to_string(),
                            user_agent: "-".to_string(),
                            request_id_header: "X-Request-Id".to_string(),
                            request_id: log_request_id,
                            backend_key: log_backend,
                            forwarded_for: log_host,
                            total_duration: start.elapsed(),
                            backend_duration,
                        }
                    }),
                )
                .await;

            let mut out = Response::builder().status(status);
            if let Some(h) = out.headers_mut() {
                *h = response_headers;
            }
            out.body(body).unwrap_or_else(|_| bad_gateway())
        }
        Err(e) => {
            backend_error_response(&transport, host, &upstream_url, request_id, &decision, &e.to_string()).await
        }
    }
}

async fn backend_error_response(
    transport: &Arc<Transport>,
    host: &str,
    backend: &str,
    request_id: &str,
    decision: &crate::router::RequestDecision,
    message: &str,
) -> Response {
    crate::metrics::add_errors(1);
    if transport.access_log.is_enabled() {
        transport.access_log.submit_error(ErrorRecord {
            host: host.to_string(),
            backend: Some(backend.to_string()),
            path: "".to_string(),
            request_id: request_id.to_string(),
            message: message.to_string(),
        });
    }
    let _ = transport
        .router
        .record_outcome::<fn() -> LogRecord>(decision, true, None)
        .await;
    bad_gateway()
}

async fn router_error_response(
    transport: &Arc<Transport>,
    err: RouterError,
    host: &str,
    request_id: &str,
) -> Response {
    match err {
        RouterError::NoRegisteredBackends => {
            crate::metrics::add_errors(1);
            if transport.access_log.is_enabled() {
                transport.access_log.submit_error(ErrorRecord {
                    host: host.to_string(),
                    backend: None,
                    path: "".to_string(),
                    request_id: request_id.to_string(),
                    message: "no registered backends".to_string(),
                });
            }
            (StatusCode::NOT_FOUND, "no such route").into_response()
        }
        RouterError::AllBackendsDead(decision) => {
            crate::metrics::add_all_dead(1);
            if transport.access_log.is_enabled() {
                transport.access_log.submit_error(ErrorRecord {
                    host: host.to_string(),
                    backend: None,
                    path: "".to_string(),
                    request_id: request_id.to_string(),
                    message: "all backends are dead".to_string(),
                });
            }
            let _ = transport
                .router
                .record_outcome::<fn() -> LogRecord>(&decision, false, None)
                .await;
            (StatusCode::BAD_GATEWAY, "all backends are dead").into_response()
        }
        RouterError::StoreTransport(e) => {
            crate::metrics::add_errors(1);
            crate::dedlog::err(Some(&e), Some(&format!("host={}", host)), "store transport error while routing");
            (StatusCode::BAD_GATEWAY, "upstream store unavailable").into_response()
        }
    }
}

async fn ping_response(transport: &Arc<Transport>) -> Response {
    match transport.store.healthcheck().await {
        Ok(()) => (StatusCode::OK, "ok\n").into_response(),
        Err(e) => {
            warn!(component = "transport", event = "ping_failed", error = %e, "store healthcheck failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response()
        }
    }
}

fn bad_gateway() -> Response {
    (StatusCode::BAD_GATEWAY, "all backends are dead").into_response()
}

fn extract_host(req: &Request) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

fn client_ip_of(req: &Request, remote_addr: SocketAddr) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| remote_addr.ip().to_string())
}

fn ensure_request_id(req: &mut Request, header_name: &str) -> String {
    if let Ok(name) = HeaderName::try_from(header_name) {
        if let Some(existing) = req.headers().get(&name).and_then(|v| v.to_str().ok()) {
            if !existing.is_empty() {
                return existing.to_string();
            }
        }
        let id = Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&id) {
            req.headers_mut().insert(name, value);
        }
        return id;
    }
    Uuid::new_v4().to_string()
}

fn authority_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(p) => format!("{}:{}", h, p),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| url.to_string())
}
