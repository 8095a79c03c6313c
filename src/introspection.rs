//! OAuth2 token introspection client.
//!
//! Performs the out-of-band calls the access-token enforcer depends on:
//!
//! - `POST <introspection.url>` with form body `token=<token>`, HTTP
//!   Basic-authenticated with the configured client id/secret.
//! - `GET <introspection.user_info_url>` with `Authorization: Bearer <token>`
//!   for the optional user-info enrichment.
//!
//! Responses are decoded tolerantly: `active` is required, everything else —
//! including the RFC 8705 confirmation claim — survives in typed optionals
//! plus a catch-all map, so the raw body can be forwarded without loss.
//! Results are never cached; certificate binding is connection-specific.

use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::IntrospectionConfig;
use crate::{Error, Result};

/// Decoded introspection response.
///
/// A missing or non-boolean `active` field fails deserialization, which the
/// enforcer treats as a denial.
#[derive(Debug, Clone, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is currently active.
    pub active: bool,

    /// Token subject, when the issuer provides one.
    #[serde(default)]
    pub sub: Option<String>,

    /// RFC 8705 confirmation claim.
    #[serde(default)]
    pub cnf: Option<Confirmation>,

    /// All other claims, preserved as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The `cnf` confirmation claim.
#[derive(Debug, Clone, Deserialize)]
pub struct Confirmation {
    /// Base64url-encoded SHA-256 thumbprint of the bound certificate's DER.
    #[serde(rename = "x5t#S256", default)]
    pub x5t_s256: Option<String>,

    /// Other confirmation methods, preserved but unused.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl IntrospectionResponse {
    /// The certificate thumbprint this token is bound to, if any.
    ///
    /// `None` means the token is not certificate-bound and the binding check
    /// is skipped.
    #[must_use]
    pub fn bound_thumbprint(&self) -> Option<&str> {
        self.cnf.as_ref().and_then(|c| c.x5t_s256.as_deref())
    }
}

/// Raw body plus decoded view of one introspection call.
#[derive(Debug, Clone)]
pub struct IntrospectionOutcome {
    /// The response body exactly as received, for header forwarding.
    pub raw: Bytes,
    /// The decoded response.
    pub response: IntrospectionResponse,
}

/// Client for the introspection and user-info endpoints.
///
/// Holds a dedicated `reqwest::Client` carrying the configured per-call
/// deadline so a hung issuer cannot pin request tasks indefinitely.
#[derive(Debug, Clone)]
pub struct IntrospectionClient {
    http: reqwest::Client,
    url: Url,
    user_info_url: Url,
    client_id: String,
    client_secret: String,
}

impl IntrospectionClient {
    /// Build the client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either endpoint URL is unparsable or the HTTP
    /// client cannot be constructed.  Both are startup-fatal.
    pub fn new(config: &IntrospectionConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid introspection URL '{}': {e}", config.url)))?;
        let user_info_url = Url::parse(&config.user_info_url).map_err(|e| {
            Error::Config(format!(
                "Invalid user-info URL '{}': {e}",
                config.user_info_url
            ))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            url,
            user_info_url,
            client_id: config.client_id.clone(),
            client_secret: config.resolve_client_secret(),
        })
    }

    /// Construct directly from parts; used by tests against mock endpoints.
    #[must_use]
    pub fn from_parts(
        url: Url,
        user_info_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url,
            user_info_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Introspect a token.
    ///
    /// # Errors
    ///
    /// Any transport error, non-200 status, or unparsable body is an error;
    /// the caller maps all of them to a denial.
    pub async fn introspect(&self, token: &str) -> Result<IntrospectionOutcome> {
        let resp = self
            .http
            .post(self.url.clone())
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("token", token)])
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::Introspection(format!(
                "introspection returned status {status}"
            )));
        }

        let raw = resp.bytes().await?;
        let response: IntrospectionResponse = serde_json::from_slice(&raw)?;

        debug!(active = response.active, bound = response.bound_thumbprint().is_some(), "Token introspected");

        Ok(IntrospectionOutcome { raw, response })
    }

    /// Fetch user info for the token's subject.
    ///
    /// # Errors
    ///
    /// Transport errors and non-200 statuses are errors; the enforcer logs
    /// them and forwards the request anyway (enrichment, not a precondition).
    pub async fn user_info(&self, token: &str) -> Result<Bytes> {
        let resp = self
            .http
            .get(self.user_info_url.clone())
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(Error::Introspection(format!(
                "user-info returned status {status}"
            )));
        }

        Ok(resp.bytes().await?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
