//! TLS termination — certificate loading, rustls config, and the listener.
//!
//! The gateway is always the TLS boundary.  Client certificates are
//! *requested but not required*: a client presenting no certificate completes
//! the handshake, a client presenting one must chain to the configured CA
//! bundle or the handshake fails.  The verified peer chain (leaf first) is
//! captured per connection and exposed to handlers as [`TlsConnectInfo`].
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**.  The CA
//! bundle may contain several concatenated certificates; any non-certificate
//! PEM block in it is a fatal configuration error.

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use rustls::crypto::{CryptoProvider, aws_lc_rs};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ServerConfig, SupportedCipherSuite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::config::TlsConfig;
use crate::{Error, Result};

/// Cipher-suite allow-list.  ECDHE AES-GCM suites for TLS 1.2 plus the
/// TLS 1.3 suites; no negotiation outside this list.
static CIPHER_SUITES: &[SupportedCipherSuite] = &[
    // TLS 1.3
    aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
    aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256,
    aws_lc_rs::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    // TLS 1.2
    aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    aws_lc_rs::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    aws_lc_rs::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
];

// ─────────────────────────────────────────────────────────────────────────────
// Public: build TLS server config
// ─────────────────────────────────────────────────────────────────────────────

/// Build the `rustls::ServerConfig` for the terminating listener.
///
/// Protocol versions are pinned to TLS 1.2–1.3 with the fixed
/// [`CIPHER_SUITES`] allow-list.  Client certificates are requested but a
/// connection without one is accepted (`allow_unauthenticated`).
///
/// # Errors
///
/// Returns an error if any certificate or key file cannot be read or parsed,
/// if the CA bundle contains a non-certificate PEM block, or if the rustls
/// config cannot be built (e.g. mismatched cert/key pair).  All of these are
/// startup-fatal; there is no degraded mode.
pub fn build_tls_config(config: &TlsConfig) -> Result<ServerConfig> {
    let server_certs = load_certs(&config.server_cert)?;
    let server_key = load_private_key(&config.server_key)?;
    let ca_certs = load_ca_bundle(&config.ca_cert)?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in &ca_certs {
        root_store
            .add(cert.clone())
            .map_err(|e| Error::Tls(format!("Failed to add CA cert to trust store: {e}")))?;
    }

    let provider = Arc::new(CryptoProvider {
        cipher_suites: CIPHER_SUITES.to_vec(),
        ..aws_lc_rs::default_provider()
    });

    let verifier = WebPkiClientVerifier::builder_with_provider(
        Arc::new(root_store),
        Arc::clone(&provider),
    )
    .allow_unauthenticated()
    .build()
    .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?;

    let mut tls_cfg = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| Error::Tls(format!("TLS version config error: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(
        server_cert = %config.server_cert,
        ca_cert = %config.ca_cert,
        "TLS config built"
    );

    Ok(tls_cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse certs from '{path}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the CA trust bundle from a PEM file.
///
/// Unlike [`load_certs`], a PEM block of any type other than `CERTIFICATE`
/// is rejected rather than skipped: a key accidentally concatenated into the
/// trust bundle must abort startup, not silently shrink the trust store.
///
/// # Errors
///
/// Returns an error on read failure, unparsable PEM, a non-certificate
/// block, or an empty bundle.
pub fn load_ca_bundle(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let mut certs = Vec::new();

    for item in rustls_pemfile::read_all(&mut pem_data.as_slice()) {
        let item =
            item.map_err(|e| Error::Tls(format!("Failed to parse PEM from '{path}': {e}")))?;
        match item {
            rustls_pemfile::Item::X509Certificate(der) => certs.push(der),
            _ => {
                return Err(Error::Tls(format!(
                    "Unexpected PEM block in CA bundle '{path}': certificates only"
                )));
            }
        }
    }

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in '{path}'")));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    let key = rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::Tls(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::Tls(format!("No private key found in '{path}'")))?;

    Ok(key)
}

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{path}': {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection info
// ─────────────────────────────────────────────────────────────────────────────

/// Per-connection TLS state handed to request handlers.
///
/// `peer_certs` holds the verified client chain when one was presented,
/// ordered with the leaf certificate at index 0.  This is the **only**
/// source components may trust client-certificate data from; inbound
/// headers are never consulted.
#[derive(Clone)]
pub struct TlsConnectInfo {
    /// Directly-connected peer socket address.
    pub peer_addr: SocketAddr,
    /// Verified peer certificate chain, leaf first, if presented.
    pub peer_certs: Option<Arc<Vec<CertificateDer<'static>>>>,
}

impl TlsConnectInfo {
    /// Construct connection info without a client certificate.
    #[must_use]
    pub fn without_certs(peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            peer_certs: None,
        }
    }

    /// The verified leaf client certificate, if the handshake produced one.
    #[must_use]
    pub fn leaf_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.peer_certs.as_deref().and_then(|chain| chain.first())
    }
}

impl fmt::Debug for TlsConnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnectInfo")
            .field("peer_addr", &self.peer_addr)
            .field(
                "peer_certs",
                &self.peer_certs.as_deref().map(Vec::len),
            )
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener
// ─────────────────────────────────────────────────────────────────────────────

/// Deadline for a single TLS handshake.  A client that connects and never
/// completes the handshake is cut off after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How many handshaken connections may queue before accepted TCP streams
/// back-pressure.
const HANDSHAKE_QUEUE: usize = 64;

/// TCP listener that wraps accepted connections in TLS and captures the
/// verified peer certificate chain for downstream extraction.
///
/// Each handshake runs in its own task under [`HANDSHAKE_TIMEOUT`], so a
/// stalled or malicious client can never hold up the accept loop for
/// everyone else.  Completed streams are handed back through a channel.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    ready_tx: mpsc::Sender<(TlsStream, SocketAddr)>,
    ready_rx: mpsc::Receiver<(TlsStream, SocketAddr)>,
}

impl TlsListener {
    /// Wrap a bound TCP listener with the given TLS config.
    #[must_use]
    pub fn new(inner: TcpListener, config: Arc<ServerConfig>) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(HANDSHAKE_QUEUE);
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
            ready_tx,
            ready_rx,
        }
    }
}

/// A TLS stream with its associated connection info.
pub struct TlsStream {
    inner: tokio_rustls::server::TlsStream<TcpStream>,
    connect_info: TlsConnectInfo,
}

impl TlsStream {
    /// The connection info captured at handshake time.
    #[must_use]
    pub fn connect_info(&self) -> &TlsConnectInfo {
        &self.connect_info
    }
}

impl tokio::io::AsyncRead for TlsStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for TlsStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok((stream, addr)) => {
                        // Handshake in its own task: the accept loop never
                        // waits on an individual client.
                        let acceptor = self.acceptor.clone();
                        let ready_tx = self.ready_tx.clone();
                        tokio::spawn(async move {
                            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                                .await
                            {
                                Ok(Ok(tls_stream)) => {
                                    let peer_certs = extract_peer_certs(&tls_stream);
                                    if peer_certs.is_none() {
                                        debug!(peer_addr = %addr, "TLS connection without client certificate");
                                    }
                                    let connect_info = TlsConnectInfo {
                                        peer_addr: addr,
                                        peer_certs,
                                    };
                                    let _ = ready_tx
                                        .send((
                                            TlsStream {
                                                inner: tls_stream,
                                                connect_info,
                                            },
                                            addr,
                                        ))
                                        .await;
                                }
                                Ok(Err(e)) => {
                                    warn!(peer_addr = %addr, error = %e, "TLS handshake failed");
                                }
                                Err(_) => {
                                    warn!(peer_addr = %addr, timeout = ?HANDSHAKE_TIMEOUT, "TLS handshake timed out");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept error");
                    }
                },
                ready = self.ready_rx.recv() => {
                    // A sender half lives in `self`, so recv never yields None.
                    if let Some(ready) = ready {
                        return ready;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Pull the verified peer chain out of the completed handshake.
///
/// rustls guarantees the chain ordering, with the leaf at index 0.
fn extract_peer_certs(
    tls_stream: &tokio_rustls::server::TlsStream<TcpStream>,
) -> Option<Arc<Vec<CertificateDer<'static>>>> {
    let (_, server_conn) = tls_stream.get_ref();
    let certs = server_conn.peer_certificates()?;
    if certs.is_empty() {
        return None;
    }
    Some(Arc::new(certs.to_vec()))
}

impl Connected<IncomingStream<'_, TlsListener>> for TlsConnectInfo {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        stream.io().connect_info().clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
