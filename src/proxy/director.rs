//! Header rewriter / director.
//!
//! Mutates an outbound request so the upstream sees the trust context the
//! gateway established: forwarded IP chain, terminating protocol, original
//! host, and — when the connection carried a verified client certificate —
//! the leaf certificate as single-line PEM plus its subject DN.
//!
//! `X-Client-Cert` and `X-Client-DN` are populated **only** from the live
//! TLS state of the current connection.  Any inbound copies are stripped
//! first, so a caller can never spoof them.
//!
//! This step has no error return: it is a best-effort mutation.  Malformed
//! upstream URLs are rejected at startup when the target is parsed.

use axum::http::header::{HOST, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};
use tracing::warn;
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::tls::TlsConnectInfo;
use crate::{Error, Result};

/// `X-Forwarded-Proto` header.
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
/// `X-Forwarded-For` header.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
/// `X-Real-IP` header.
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
/// `X-Client-Cert` header (leaf certificate PEM, newlines replaced by spaces).
pub const X_CLIENT_CERT: HeaderName = HeaderName::from_static("x-client-cert");
/// `X-Client-DN` header (leaf certificate subject distinguished name).
pub const X_CLIENT_DN: HeaderName = HeaderName::from_static("x-client-dn");

// ─────────────────────────────────────────────────────────────────────────────
// Upstream target
// ─────────────────────────────────────────────────────────────────────────────

/// One proxy destination: scheme, authority, and base path/query.
///
/// Resolved once from configuration at startup; read-only thereafter.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    base: Url,
}

impl UpstreamTarget {
    /// Parse a configured base URL.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparsable URLs or URLs without a
    /// host.  This is startup-fatal; per-request rewriting cannot fail.
    pub fn parse(raw: &str) -> Result<Self> {
        let base = Url::parse(raw)
            .map_err(|e| Error::Config(format!("Invalid upstream URL '{raw}': {e}")))?;
        if !base.has_host() {
            return Err(Error::Config(format!(
                "Upstream URL '{raw}' has no host"
            )));
        }
        Ok(Self { base })
    }

    /// The parsed base URL.
    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rewrite
// ─────────────────────────────────────────────────────────────────────────────

/// Rewrite the outbound request in place and return the outbound URL.
///
/// Header mutations follow §4.3 of the gateway contract: forwarded proto,
/// preserved host, real IP, appended forwarded-for chain, TLS-derived client
/// certificate headers, and an explicit empty `User-Agent` when the inbound
/// request carried none.
pub fn rewrite(
    headers: &mut HeaderMap,
    uri: &Uri,
    target: &UpstreamTarget,
    peer: &TlsConnectInfo,
) -> Url {
    // The gateway is always the TLS boundary.
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));

    // Preserve the caller's declared host for virtual-hosted upstreams.
    let inbound_host = headers
        .get(HOST)
        .cloned()
        .or_else(|| {
            uri.authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
    if let Some(host) = inbound_host {
        headers.insert(HOST, host);
    }

    let peer_ip = peer.peer_addr.ip().to_string();
    headers.insert(X_REAL_IP, header_value(&peer_ip));

    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {peer_ip}"),
        _ => peer_ip,
    };
    headers.insert(X_FORWARDED_FOR, header_value(&forwarded_for));

    // Trust headers come only from the verified TLS state; inbound copies
    // are dropped unconditionally.
    headers.remove(X_CLIENT_CERT);
    headers.remove(X_CLIENT_DN);
    if let Some(leaf) = peer.leaf_certificate() {
        let pem_single_line = der_to_pem(leaf.as_ref()).replace('\n', " ");
        headers.insert(X_CLIENT_CERT, header_value(&pem_single_line));

        match X509Certificate::from_der(leaf.as_ref()) {
            Ok((_, cert)) => {
                headers.insert(X_CLIENT_DN, header_value(&cert.subject().to_string()));
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse verified client certificate for DN header");
            }
        }
    }

    // Explicitly disable User-Agent so upstreams do not see a proxy-library
    // default.
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(""));
    }

    outbound_url(uri, target)
}

/// Compute the outbound URL: target scheme/authority, single-slash-joined
/// path, `&`-merged query.
fn outbound_url(uri: &Uri, target: &UpstreamTarget) -> Url {
    let mut out = target.base.clone();
    out.set_path(&single_joining_slash(target.base.path(), uri.path()));

    let target_query = target.base.query().unwrap_or("");
    let request_query = uri.query().unwrap_or("");
    let merged = if target_query.is_empty() || request_query.is_empty() {
        format!("{target_query}{request_query}")
    } else {
        format!("{target_query}&{request_query}")
    };
    out.set_query(if merged.is_empty() {
        None
    } else {
        Some(&merged)
    });

    out
}

/// Join two path segments with exactly one `/` at the boundary.
fn single_joining_slash(a: &str, b: &str) -> String {
    if a.is_empty() || b.is_empty() {
        return format!("{a}{b}");
    }
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

/// Re-encode DER certificate bytes as a PEM block.
fn der_to_pem(der: &[u8]) -> String {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;

    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(encoded.len() + encoded.len() / 64 + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Best-effort header value; the rewrite step has no error path.
fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use rustls::pki_types::CertificateDer;

    use super::*;

    fn target(raw: &str) -> UpstreamTarget {
        UpstreamTarget::parse(raw).unwrap()
    }

    fn peer_without_cert() -> TlsConnectInfo {
        TlsConnectInfo::without_certs("10.0.0.5:51000".parse().unwrap())
    }

    fn peer_with_cert(cn: &str) -> TlsConnectInfo {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let der = params.self_signed(&key_pair).unwrap().der().to_vec();
        TlsConnectInfo {
            peer_addr: "10.0.0.5:51000".parse().unwrap(),
            peer_certs: Some(Arc::new(vec![CertificateDer::from(der)])),
        }
    }

    // ── Path joining ──────────────────────────────────────────────────────────

    #[test]
    fn join_trailing_and_leading_slash_collapses() {
        assert_eq!(single_joining_slash("/api/", "/v1/score"), "/api/v1/score");
    }

    #[test]
    fn join_no_slashes_inserts_one() {
        assert_eq!(single_joining_slash("/api", "v1/score"), "/api/v1/score");
    }

    #[test]
    fn join_with_base_path_target() {
        let t = target("http://upstream:8080/api");
        let uri: Uri = "/v1/score".parse().unwrap();
        assert_eq!(outbound_url(&uri, &t).path(), "/api/v1/score");
    }

    #[test]
    fn join_with_trailing_slash_target() {
        let t = target("http://upstream:8080/api/");
        let uri: Uri = "/v1/score".parse().unwrap();
        assert_eq!(outbound_url(&uri, &t).path(), "/api/v1/score");
    }

    #[test]
    fn join_empty_side_passes_through() {
        assert_eq!(single_joining_slash("", "/v1"), "/v1");
        assert_eq!(single_joining_slash("/api", ""), "/api");
    }

    // ── Query merging ─────────────────────────────────────────────────────────

    #[test]
    fn query_both_sides_joined_with_ampersand() {
        let t = target("http://upstream/base?tenant=a");
        let uri: Uri = "/x?limit=10".parse().unwrap();
        assert_eq!(outbound_url(&uri, &t).query(), Some("tenant=a&limit=10"));
    }

    #[test]
    fn query_single_side_wins() {
        let t = target("http://upstream/base");
        let uri: Uri = "/x?limit=10".parse().unwrap();
        assert_eq!(outbound_url(&uri, &t).query(), Some("limit=10"));

        let t = target("http://upstream/base?tenant=a");
        let uri: Uri = "/x".parse().unwrap();
        assert_eq!(outbound_url(&uri, &t).query(), Some("tenant=a"));
    }

    #[test]
    fn query_absent_on_both_sides_stays_absent() {
        let t = target("http://upstream/base");
        let uri: Uri = "/x".parse().unwrap();
        assert_eq!(outbound_url(&uri, &t).query(), None);
    }

    // ── Scheme / host rewrite ─────────────────────────────────────────────────

    #[test]
    fn outbound_url_takes_target_scheme_and_host() {
        let t = target("http://internal-api:8080");
        let uri: Uri = "/v1/score".parse().unwrap();
        let out = outbound_url(&uri, &t);
        assert_eq!(out.scheme(), "http");
        assert_eq!(out.host_str(), Some("internal-api"));
        assert_eq!(out.port(), Some(8080));
    }

    #[test]
    fn parse_rejects_url_without_host() {
        assert!(UpstreamTarget::parse("not a url").is_err());
        assert!(UpstreamTarget::parse("unix:/tmp/sock").is_err());
    }

    // ── Forwarded headers ─────────────────────────────────────────────────────

    #[test]
    fn forwarded_for_starts_chain_when_absent() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://up"), &peer_without_cert());
        assert_eq!(headers[&X_FORWARDED_FOR], "10.0.0.5");
    }

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://up"), &peer_without_cert());
        assert_eq!(headers[&X_FORWARDED_FOR], "1.2.3.4, 10.0.0.5");
    }

    #[test]
    fn real_ip_and_proto_are_set() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://up"), &peer_without_cert());
        assert_eq!(headers[&X_REAL_IP], "10.0.0.5");
        assert_eq!(headers[&X_FORWARDED_PROTO], "https");
    }

    #[test]
    fn inbound_host_is_preserved() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("api.localhost"));
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://internal:9"), &peer_without_cert());
        assert_eq!(headers[&HOST], "api.localhost");
    }

    #[test]
    fn missing_user_agent_is_explicitly_emptied() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://up"), &peer_without_cert());
        assert_eq!(headers[&USER_AGENT], "");
    }

    #[test]
    fn existing_user_agent_is_untouched() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.5"));
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://up"), &peer_without_cert());
        assert_eq!(headers[&USER_AGENT], "curl/8.5");
    }

    // ── Client certificate headers ────────────────────────────────────────────

    #[test]
    fn client_cert_headers_set_from_tls_state() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        rewrite(&mut headers, &uri, &target("http://up"), &peer_with_cert("mtls-client"));

        let cert = headers[&X_CLIENT_CERT].to_str().unwrap();
        assert!(cert.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(!cert.contains('\n'), "PEM must be transported single-line");

        let dn = headers[&X_CLIENT_DN].to_str().unwrap();
        assert!(dn.contains("mtls-client"), "DN was: {dn}");
    }

    #[test]
    fn spoofed_client_cert_headers_are_stripped() {
        // GIVEN: a caller injecting trust headers with no TLS client cert
        let mut headers = HeaderMap::new();
        headers.insert(X_CLIENT_CERT, HeaderValue::from_static("forged"));
        headers.insert(X_CLIENT_DN, HeaderValue::from_static("CN=attacker"));
        let uri: Uri = "/".parse().unwrap();

        rewrite(&mut headers, &uri, &target("http://up"), &peer_without_cert());

        // THEN: both headers are gone
        assert!(headers.get(X_CLIENT_CERT).is_none());
        assert!(headers.get(X_CLIENT_DN).is_none());
    }

    #[test]
    fn spoofed_headers_are_replaced_when_cert_present() {
        let mut headers = HeaderMap::new();
        headers.insert(X_CLIENT_DN, HeaderValue::from_static("CN=attacker"));
        let uri: Uri = "/".parse().unwrap();

        rewrite(&mut headers, &uri, &target("http://up"), &peer_with_cert("real-client"));

        let dn = headers[&X_CLIENT_DN].to_str().unwrap();
        assert!(dn.contains("real-client"));
        assert!(!dn.contains("attacker"));
    }

    // ── PEM re-encoding ───────────────────────────────────────────────────────

    #[test]
    fn der_to_pem_wraps_at_64_columns() {
        let pem = der_to_pem(&[0xABu8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----\n"));
        for line in pem.lines() {
            assert!(line.len() <= 64 || line.starts_with("-----"));
        }
    }
}
