//! Access-token enforcement for the protected upstream.
//!
//! Every request routed to the API vhost passes through [`authorize`]:
//!
//! 1. Extract the bearer token from the `Authorization` header.
//! 2. Introspect it against the configured issuer.
//! 3. Require `active == true`.
//! 4. If the token carries an RFC 8705 `cnf.x5t#S256` confirmation, require
//!    a client certificate whose SHA-256 thumbprint matches it.
//! 5. Annotate the request with the introspection result (and, when the
//!    token has a subject, the user-info document) for the upstream.
//!
//! A token without a confirmation claim passes without the binding check;
//! issuing bound tokens is the issuer's policy, not the gateway's.

use axum::http::{HeaderMap, HeaderName, HeaderValue, header::AUTHORIZATION};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::introspection::IntrospectionClient;
use crate::tls::TlsConnectInfo;

/// Base64 (standard) of the raw introspection response body.
pub const X_INTROSPECTION_RESPONSE: HeaderName =
    HeaderName::from_static("x-introspection-response");
/// Raw introspection response body, kept for lambda compatibility.
pub const ACCESS_TOKEN: HeaderName = HeaderName::from_static("access_token");
/// Base64 (standard) of the raw user-info response body.
pub const X_USER_INFO_RESPONSE: HeaderName = HeaderName::from_static("x-user-info-response");

/// Outcome of the enforcement pipeline.
#[derive(Debug)]
pub enum AccessDecision {
    /// Forward the request; annotation headers have been set.
    Allow,
    /// Reject with 401.
    Deny(DenyReason),
}

/// Why a request was denied.  Logged, never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum DenyReason {
    /// No `Authorization: Bearer <token>` header.
    #[error("missing bearer token")]
    MissingToken,
    /// The introspection call failed or returned an unusable response.
    #[error("introspection failed: {0}")]
    Introspection(#[from] crate::Error),
    /// The issuer reported the token as inactive.
    #[error("token is not active")]
    Inactive,
    /// The token is certificate-bound but the connection has no client cert.
    #[error("token is certificate-bound but no client certificate was presented")]
    MissingClientCert,
    /// The presented certificate does not match the token's confirmation.
    #[error("client certificate thumbprint does not match token binding")]
    ThumbprintMismatch,
}

/// Extract the bearer token from the request headers.
///
/// The scheme prefix is matched exactly (`Bearer `, capital B); anything
/// else is treated as no token.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

/// Base64url (unpadded) SHA-256 thumbprint of a DER-encoded certificate,
/// as compared against the `cnf.x5t#S256` claim.
#[must_use]
pub fn certificate_thumbprint(der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(der))
}

/// Run the full enforcement pipeline, mutating `headers` on success.
pub async fn authorize(
    introspection: &IntrospectionClient,
    peer: &TlsConnectInfo,
    headers: &mut HeaderMap,
) -> AccessDecision {
    let Some(token) = bearer_token(headers) else {
        return AccessDecision::Deny(DenyReason::MissingToken);
    };

    let outcome = match introspection.introspect(&token).await {
        Ok(outcome) => outcome,
        Err(e) => return AccessDecision::Deny(DenyReason::Introspection(e)),
    };

    if !outcome.response.active {
        return AccessDecision::Deny(DenyReason::Inactive);
    }

    if let Some(expected) = outcome.response.bound_thumbprint() {
        let Some(leaf) = peer.leaf_certificate() else {
            return AccessDecision::Deny(DenyReason::MissingClientCert);
        };
        if certificate_thumbprint(leaf.as_ref()) != expected {
            return AccessDecision::Deny(DenyReason::ThumbprintMismatch);
        }
    } else {
        debug!("Token carries no certificate binding, skipping thumbprint check");
    }

    let encoded = STANDARD.encode(&outcome.raw);
    match HeaderValue::from_str(&encoded) {
        Ok(value) => {
            headers.insert(X_INTROSPECTION_RESPONSE, value);
        }
        Err(e) => warn!(error = %e, "Could not encode introspection response header"),
    }
    match HeaderValue::from_bytes(&outcome.raw) {
        Ok(value) => {
            headers.insert(ACCESS_TOKEN, value);
        }
        Err(e) => warn!(error = %e, "Introspection body is not a valid header value"),
    }

    if outcome.response.sub.is_some() {
        annotate_user_info(introspection, &token, headers).await;
    }

    AccessDecision::Allow
}

/// Best-effort user-info enrichment.  Failures are logged, never fatal.
async fn annotate_user_info(
    introspection: &IntrospectionClient,
    token: &str,
    headers: &mut HeaderMap,
) {
    match introspection.user_info(token).await {
        Ok(body) => {
            let encoded = STANDARD.encode(&body);
            match HeaderValue::from_str(&encoded) {
                Ok(value) => {
                    headers.insert(X_USER_INFO_RESPONSE, value);
                }
                Err(e) => warn!(error = %e, "Could not encode user-info response header"),
            }
        }
        Err(e) => warn!(error = %e, "User-info fetch failed"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::Router;
    use axum::routing::{get, post};
    use pretty_assertions::assert_eq;
    use rustls::pki_types::CertificateDer;
    use serde_json::{Value, json};
    use url::Url;

    use super::*;

    // ── Token extraction ──────────────────────────────────────────────────────

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn rejects_missing_authorization_header() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn rejects_non_bearer_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn scheme_prefix_is_case_sensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc123"));
        assert_eq!(bearer_token(&headers), None);
    }

    // ── Thumbprint ────────────────────────────────────────────────────────────

    #[test]
    fn thumbprint_is_stable_and_unpadded() {
        let a = certificate_thumbprint(b"certificate bytes");
        let b = certificate_thumbprint(b"certificate bytes");
        assert_eq!(a, b);
        // SHA-256 is 32 bytes: 43 base64url chars, no padding
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
    }

    #[test]
    fn thumbprint_differs_for_different_certs() {
        assert_ne!(
            certificate_thumbprint(b"cert one"),
            certificate_thumbprint(b"cert two")
        );
    }

    // ── Full pipeline against a mock issuer ───────────────────────────────────

    struct MockIssuer {
        addr: SocketAddr,
        introspect_calls: Arc<AtomicUsize>,
    }

    async fn spawn_issuer(introspection_body: Value, user_info_body: Value) -> MockIssuer {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let router = Router::new()
            .route(
                "/token/introspection",
                post(move || {
                    let calls = Arc::clone(&calls_clone);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        axum::Json(introspection_body)
                    }
                }),
            )
            .route("/me", get(move || async move { axum::Json(user_info_body) }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        MockIssuer {
            addr,
            introspect_calls: calls,
        }
    }

    fn client_for(issuer: &MockIssuer) -> IntrospectionClient {
        IntrospectionClient::from_parts(
            Url::parse(&format!("http://{}/token/introspection", issuer.addr)).unwrap(),
            Url::parse(&format!("http://{}/me", issuer.addr)).unwrap(),
            "client",
            "12345678",
            Duration::from_secs(5),
        )
    }

    fn peer_without_cert() -> TlsConnectInfo {
        TlsConnectInfo::without_certs("10.0.0.9:50000".parse().unwrap())
    }

    fn peer_with_cert(der: Vec<u8>) -> TlsConnectInfo {
        TlsConnectInfo {
            peer_addr: "10.0.0.9:50000".parse().unwrap(),
            peer_certs: Some(Arc::new(vec![CertificateDer::from(der)])),
        }
    }

    fn bearer_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        headers
    }

    #[tokio::test]
    async fn missing_token_denies_without_calling_issuer() {
        let issuer = spawn_issuer(json!({"active": true}), json!({})).await;
        let client = client_for(&issuer);
        let mut headers = HeaderMap::new();

        let decision = authorize(&client, &peer_without_cert(), &mut headers).await;
        assert!(matches!(
            decision,
            AccessDecision::Deny(DenyReason::MissingToken)
        ));
        assert_eq!(issuer.introspect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn inactive_token_is_denied() {
        let issuer = spawn_issuer(json!({"active": false}), json!({})).await;
        let client = client_for(&issuer);
        let mut headers = bearer_headers();

        let decision = authorize(&client, &peer_without_cert(), &mut headers).await;
        assert!(matches!(
            decision,
            AccessDecision::Deny(DenyReason::Inactive)
        ));
        assert!(!headers.contains_key(&X_INTROSPECTION_RESPONSE));
    }

    #[tokio::test]
    async fn unbound_active_token_is_allowed_and_annotated() {
        let issuer = spawn_issuer(json!({"active": true}), json!({})).await;
        let client = client_for(&issuer);
        let mut headers = bearer_headers();

        let decision = authorize(&client, &peer_without_cert(), &mut headers).await;
        assert!(matches!(decision, AccessDecision::Allow));

        let encoded = headers
            .get(&X_INTROSPECTION_RESPONSE)
            .unwrap()
            .to_str()
            .unwrap();
        let raw = STANDARD.decode(encoded).unwrap();
        let body: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(body["active"], true);
        // Raw body rides along unencoded too
        assert!(headers.contains_key(&ACCESS_TOKEN));
        // No sub, so no user-info call
        assert!(!headers.contains_key(&X_USER_INFO_RESPONSE));
    }

    #[tokio::test]
    async fn bound_token_without_client_cert_is_denied() {
        let issuer = spawn_issuer(
            json!({"active": true, "cnf": {"x5t#S256": certificate_thumbprint(b"some cert")}}),
            json!({}),
        )
        .await;
        let client = client_for(&issuer);
        let mut headers = bearer_headers();

        let decision = authorize(&client, &peer_without_cert(), &mut headers).await;
        assert!(matches!(
            decision,
            AccessDecision::Deny(DenyReason::MissingClientCert)
        ));
    }

    #[tokio::test]
    async fn bound_token_with_wrong_cert_is_denied() {
        let issuer = spawn_issuer(
            json!({"active": true, "cnf": {"x5t#S256": certificate_thumbprint(b"expected cert")}}),
            json!({}),
        )
        .await;
        let client = client_for(&issuer);
        let mut headers = bearer_headers();

        let decision = authorize(
            &client,
            &peer_with_cert(b"a different cert".to_vec()),
            &mut headers,
        )
        .await;
        assert!(matches!(
            decision,
            AccessDecision::Deny(DenyReason::ThumbprintMismatch)
        ));
    }

    #[tokio::test]
    async fn bound_token_with_matching_cert_is_allowed() {
        let der = b"the client certificate".to_vec();
        let issuer = spawn_issuer(
            json!({"active": true, "cnf": {"x5t#S256": certificate_thumbprint(&der)}}),
            json!({}),
        )
        .await;
        let client = client_for(&issuer);
        let mut headers = bearer_headers();

        let decision = authorize(&client, &peer_with_cert(der), &mut headers).await;
        assert!(matches!(decision, AccessDecision::Allow));
        assert!(headers.contains_key(&X_INTROSPECTION_RESPONSE));
    }

    #[tokio::test]
    async fn subject_triggers_user_info_annotation() {
        let issuer = spawn_issuer(
            json!({"active": true, "sub": "alice"}),
            json!({"name": "Alice"}),
        )
        .await;
        let client = client_for(&issuer);
        let mut headers = bearer_headers();

        let decision = authorize(&client, &peer_without_cert(), &mut headers).await;
        assert!(matches!(decision, AccessDecision::Allow));

        let encoded = headers
            .get(&X_USER_INFO_RESPONSE)
            .unwrap()
            .to_str()
            .unwrap();
        let raw = STANDARD.decode(encoded).unwrap();
        let body: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(body["name"], "Alice");
    }

    #[tokio::test]
    async fn issuer_failure_is_denied() {
        // Nothing listening
        let client = IntrospectionClient::from_parts(
            Url::parse("http://127.0.0.1:1/token/introspection").unwrap(),
            Url::parse("http://127.0.0.1:1/me").unwrap(),
            "client",
            "12345678",
            Duration::from_secs(1),
        );
        let mut headers = bearer_headers();

        let decision = authorize(&client, &peer_without_cert(), &mut headers).await;
        assert!(matches!(
            decision,
            AccessDecision::Deny(DenyReason::Introspection(_))
        ));
    }
}
