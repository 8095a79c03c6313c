//! Error types for the mTLS gateway

use std::io;

use thiserror::Error;

/// Result type alias for the mTLS gateway
pub type Result<T> = std::result::Result<T, Error>;

/// mTLS gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad paths, unparsable URLs, missing values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS setup error (certificate/key loading, rustls config building)
    #[error("TLS error: {0}")]
    Tls(String),

    /// Token introspection failure (non-200, unusable response)
    #[error("Introspection error: {0}")]
    Introspection(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}
