//! mTLS Gateway Library
//!
//! A TLS-terminating reverse proxy that routes requests by virtual host and
//! enforces certificate-bound OAuth2 access tokens (RFC 8705) in front of
//! protected upstreams.
//!
//! # Pipeline
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (rustls, client certificate requested but optional)
//!   → host router    (auth host → plain proxy, api host → token-enforced proxy)
//!   → access-token enforcer  (introspection + x5t#S256 binding, api host only)
//!   → header rewriter / director
//!   → upstream forward, response streamed back
//!   → access log record
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod introspection;
pub mod proxy;
pub mod tls;

pub use error::{Error, Result};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
