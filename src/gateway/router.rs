//! Virtual-host routing.
//!
//! Two vhosts share the TLS listener:
//!
//! - the **auth** host proxies straight through (OAuth flows carry their own
//!   protection),
//! - the **api** host runs the access-token enforcer first and proxies only
//!   on [`AccessDecision::Allow`].
//!
//! Everything else is 404.  Host matching is exact after lowercasing and
//! stripping any `:port` suffix.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{StatusCode, header::HOST};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::config::Config;
use crate::gateway::access_log;
use crate::gateway::enforce::{self, AccessDecision};
use crate::introspection::IntrospectionClient;
use crate::proxy::{self, UpstreamTarget};
use crate::{Error, Result};

/// Shared state for the routing layer.
///
/// Built once at startup; holds the parsed upstream targets, the
/// introspection client, and a pooled HTTP client for upstream traffic.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Normalized vhost matched to the auth pipeline.
    pub auth_host: String,
    /// Normalized vhost matched to the api pipeline.
    pub api_host: String,
    /// Auth upstream.
    pub auth_target: UpstreamTarget,
    /// Api upstream.
    pub api_target: UpstreamTarget,
    /// Token introspection client.
    pub introspection: IntrospectionClient,
    /// Pooled client for proxied upstream requests.
    pub upstream_client: reqwest::Client,
}

impl AppState {
    /// Build state from configuration.
    ///
    /// # Errors
    ///
    /// Unparsable upstream or introspection URLs are startup-fatal.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            auth_host: normalize_host(&config.routes.auth_host),
            api_host: normalize_host(&config.routes.api_host),
            auth_target: UpstreamTarget::parse(&config.upstreams.auth_url)?,
            api_target: UpstreamTarget::parse(&config.upstreams.api_url)?,
            introspection: IntrospectionClient::new(&config.introspection)?,
            // Connect timeout only: streamed upstream responses must never
            // be cut by a total-request deadline.
            upstream_client: reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .map_err(Error::Http)?,
        })
    }
}

/// Build the router serving both vhosts.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(middleware::from_fn(access_log::record))
        .with_state(state)
}

/// Route one request by its Host header.
async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let Some(ConnectInfo(peer)) = req
        .extensions()
        .get::<ConnectInfo<crate::tls::TlsConnectInfo>>()
        .cloned()
    else {
        error!("Request reached the router without TLS connection info");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let host = request_host(&req);

    if host == state.auth_host {
        return proxy::forward(&state.upstream_client, &state.auth_target, &peer, req).await;
    }

    if host == state.api_host {
        let (mut parts, body) = req.into_parts();
        match enforce::authorize(&state.introspection, &peer, &mut parts.headers).await {
            AccessDecision::Allow => {
                let req = Request::from_parts(parts, body);
                return proxy::forward(&state.upstream_client, &state.api_target, &peer, req)
                    .await;
            }
            AccessDecision::Deny(reason) => {
                warn!(host = %host, reason = %reason, "Request denied, returning 401");
                return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
            }
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

/// The request's vhost: Host header first, URI authority as fallback,
/// lowercased and with any `:port` suffix removed.
fn request_host(req: &Request<Body>) -> String {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(ToString::to_string))
        .unwrap_or_default();
    normalize_host(&raw)
}

fn normalize_host(raw: &str) -> String {
    let without_port = match raw.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => raw,
    };
    without_port.to_ascii_lowercase()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
