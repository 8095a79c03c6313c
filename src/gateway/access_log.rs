//! Per-request access logging.
//!
//! One structured line per request, emitted after the response is ready so
//! the status code and the resolved proxy target are both available.  The
//! target comes from the [`ProxiedTarget`] response extension the forwarder
//! attaches; the URL rewrite runs exactly once per request.

use axum::extract::{ConnectInfo, Request};
use axum::http::header::{REFERER, USER_AGENT};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::proxy::ProxiedTarget;
use crate::tls::TlsConnectInfo;

/// Middleware recording one access-log line per request.
pub async fn record(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let request_uri = req.uri().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let host = request_host(&req);
    let user_agent = header_str(req.headers().get(USER_AGENT));
    let referer = header_str(req.headers().get(REFERER));
    let remote = req
        .extensions()
        .get::<ConnectInfo<TlsConnectInfo>>()
        .map(|ConnectInfo(info)| info.peer_addr.to_string())
        .unwrap_or_default();

    let response = next.run(req).await;

    let target = response
        .extensions()
        .get::<ProxiedTarget>()
        .map(|ProxiedTarget(url)| format!("proxy:{url}"))
        .unwrap_or_default();

    info!(
        remote_ip = %remote,
        host = %host,
        request = %request_uri,
        query = %query,
        method = %method,
        status = response.status().as_u16(),
        user_agent = %user_agent,
        referer = %referer,
        target = %target,
        "access log"
    );

    response
}

/// The host the client addressed, verbatim.  HTTP/1.1 carries it in the
/// `Host` header; HTTP/2 carries it as the `:authority` pseudo-header, which
/// surfaces on the request URI.
fn request_host(req: &Request) -> String {
    req.headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(ToString::to_string))
        .unwrap_or_default()
}

fn header_str(value: Option<&axum::http::HeaderValue>) -> String {
    value
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
