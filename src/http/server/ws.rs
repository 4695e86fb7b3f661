//! Raw WebSocket passthrough: the handshake is proxied verbatim to the
//! chosen backend over a raw TCP/TLS connection, and once the backend
//! answers `101 Switching Protocols`, both sides are spliced with
//! `tokio::io::copy_bidirectional`.

use super::sanitize;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::warn;

/// True when the request carries the headers of a WebSocket upgrade.
pub fn is_websocket_upgrade(req: &Request) -> bool {
    let headers = req.headers();
    let has_upgrade_token = headers
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let is_websocket = headers
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_token && is_websocket
}

/// Proxies a WebSocket upgrade to `upstream_url`, appending `client_ip` to
/// `X-Forwarded-For` in addition to the ordinary header synthesis.
pub async fn proxy_websocket(
    req: Request,
    upstream_url: &str,
    original_host: &str,
    client_ip: &str,
) -> Response {
    let parsed = match url::Url::parse(upstream_url) {
        Ok(u) => u,
        Err(_) => return bad_gateway(),
    };
    let tls = parsed.scheme() == "https";
    let host = parsed.host_str().unwrap_or_default().to_string();
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if tls { 443 } else { 80 });
    let authority = format!("{}:{}", host, port);

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let method = req.method().clone();
    let mut headers = req.headers().clone();
    sanitize::proxy_forwarded_host(&mut headers, original_host, &authority);
    sanitize::append_forwarded_for(&mut headers, client_ip);

    let tcp = match TcpStream::connect(&authority).await {
        Ok(s) => s,
        Err(e) => {
            warn!(component = "transport", scope = "ws", event = "connect_failed", error = %e, "websocket backend connect failed");
            return bad_gateway();
        }
    };

    macro_rules! handshake {
        ($stream:expr) => {{
            let mut stream = $stream;
            let mut request_text = format!("{} {} HTTP/1.1\r\n", method, path);
            for (name, value) in headers.iter() {
                if let Ok(v) = value.to_str() {
                    request_text.push_str(&format!("{}: {}\r\n", name.as_str(), v));
                }
            }
            request_text.push_str("\r\n");

            if stream.write_all(request_text.as_bytes()).await.is_err() {
                return bad_gateway();
            }

            let mut reader = BufReader::new(&mut stream);
            let mut status_line = String::new();
            if reader.read_line(&mut status_line).await.is_err() {
                return bad_gateway();
            }
            if !status_line.contains("101") {
                return bad_gateway();
            }
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) if line == "\r\n" => break,
                    Ok(_) => continue,
                    Err(_) => return bad_gateway(),
                }
            }

            let on_upgrade = hyper::upgrade::on(req);
            tokio::spawn(async move {
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let mut client_io = TokioIo::new(upgraded);
                        let _ = tokio::io::copy_bidirectional(&mut client_io, &mut stream).await;
                    }
                    Err(e) => {
                        warn!(component = "transport", scope = "ws", event = "upgrade_failed", error = %e, "client upgrade failed");
                    }
                }
            });

            return Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header(hyper::header::CONNECTION, HeaderValue::from_static("upgrade"))
                .header(hyper::header::UPGRADE, HeaderValue::from_static("websocket"))
                .body(Body::empty())
                .unwrap_or_else(|_| bad_gateway());
        }};
    }

    if tls {
        let connector = make_tls_connector();
        let server_name = match tokio_rustls::rustls::ServerName::try_from(host.as_str()) {
            Ok(name) => name,
            Err(_) => return bad_gateway(),
        };
        match connector.connect(server_name, tcp).await {
            Ok(tls_stream) => handshake!(tls_stream),
            Err(e) => {
                warn!(component = "transport", scope = "ws", event = "tls_failed", error = %e, "websocket backend TLS handshake failed");
                bad_gateway()
            }
        }
    } else {
        handshake!(tcp)
    }
}

fn make_tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    if let Ok(native) = rustls_native_certs::load_native_certs() {
        for cert in native {
            let _ = roots.add(&tokio_rustls::rustls::Certificate(cert.0));
        }
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn bad_gateway() -> Response {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("all backends are dead"))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with(connection: Option<&str>, upgrade: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().method("GET").uri("/");
        if let Some(c) = connection {
            builder = builder.header(hyper::header::CONNECTION, c);
        }
        if let Some(u) = upgrade {
            builder = builder.header(hyper::header::UPGRADE, u);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn detects_a_websocket_upgrade() {
        assert!(is_websocket_upgrade(&req_with(Some("Upgrade"), Some("websocket"))));
        assert!(is_websocket_upgrade(&req_with(
            Some("keep-alive, Upgrade"),
            Some("WebSocket")
        )));
    }

    #[test]
    fn plain_requests_are_not_upgrades() {
        assert!(!is_websocket_upgrade(&req_with(None, None)));
        assert!(!is_websocket_upgrade(&req_with(Some("keep-alive"), None)));
        assert!(!is_websocket_upgrade(&req_with(Some("Upgrade"), Some("h2c"))));
    }
}
