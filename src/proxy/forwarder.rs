//! Upstream forwarding.
//!
//! Streams the rewritten request to the upstream and the upstream's response
//! back to the caller, both without buffering.  Hop-by-hop headers are
//! stripped on both legs.  An unreachable upstream surfaces as 502.
//!
//! The outbound URL computed by the director is attached to the response as
//! a [`ProxiedTarget`] extension so the access logger can record it without
//! re-running the rewrite.

use axum::body::Body;
use axum::http::header::{
    CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, Request, Response, StatusCode};
use tracing::error;
use url::Url;

use super::director::{self, UpstreamTarget};
use crate::tls::TlsConnectInfo;

/// Response extension carrying the fully rewritten outbound URL.
#[derive(Debug, Clone)]
pub struct ProxiedTarget(pub Url);

/// Headers that are connection-scoped and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| h == name)
}

/// Rewrite `req` for `target` and proxy it, streaming the response back.
///
/// This step has no error return toward the caller beyond the 502 mapping;
/// authorization has already happened by the time a request reaches it.
pub async fn forward(
    client: &reqwest::Client,
    target: &UpstreamTarget,
    peer: &TlsConnectInfo,
    req: Request<Body>,
) -> Response<Body> {
    let (mut parts, body) = req.into_parts();

    let outbound_url = director::rewrite(&mut parts.headers, &parts.uri, target, peer);
    strip_hop_by_hop(&mut parts.headers);

    let result = client
        .request(parts.method.clone(), outbound_url.clone())
        .headers(parts.headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let mut response = match result {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = upstream.headers().clone();

            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            for (name, value) in &headers {
                if !is_hop_by_hop(name) {
                    response.headers_mut().append(name.clone(), value.clone());
                }
            }
            response
        }
        Err(e) => {
            error!(url = %outbound_url, error = %e, "Upstream request failed");
            let mut response = Response::new(Body::from("Bad Gateway"));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            response
        }
    };

    response.extensions_mut().insert(ProxiedTarget(outbound_url));
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
