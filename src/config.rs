//! Configuration management
//!
//! All values have defaults matching the gateway's original deployment so the
//! process starts with nothing but certificate files on disk.  A YAML file
//! (via `--config`) and `MTLS_GATEWAY_`-prefixed environment variables
//! (`__`-separated, e.g. `MTLS_GATEWAY_SERVER__PORT=8443`) are merged on top.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// TLS certificate material
    pub tls: TlsConfig,
    /// Virtual-host routing table
    pub routes: RoutesConfig,
    /// Upstream base URLs
    pub upstreams: UpstreamsConfig,
    /// OAuth2 token introspection endpoint
    pub introspection: IntrospectionConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the TLS-terminating listener
    pub port: u16,
    /// Port for the plaintext health-check listener
    pub health_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 443,
            health_port: 8181,
        }
    }
}

/// TLS certificate material, all PEM files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the PEM-encoded server certificate chain
    pub server_cert: String,
    /// Path to the PEM-encoded server private key
    pub server_key: String,
    /// Path to the PEM bundle of CA certificates trusted for client certs.
    /// May contain several concatenated certificates.
    pub ca_cert: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            server_cert: "certs/mtls.crt".to_string(),
            server_key: "certs/mtls.key".to_string(),
            ca_cert: "certs/ca.crt".to_string(),
        }
    }
}

/// Virtual hosts selecting between the two proxy pipelines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// Host served by the unauthenticated auth pipeline
    pub auth_host: String,
    /// Host served by the token-enforced api pipeline
    pub api_host: String,
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            auth_host: "auth.localhost".to_string(),
            api_host: "api.localhost".to_string(),
        }
    }
}

/// Upstream targets, one per pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    /// Base URL of the auth upstream
    pub auth_url: String,
    /// Base URL of the api upstream
    pub api_url: String,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://auth.localhost:3000".to_string(),
            api_url: "http://localhost:8080".to_string(),
        }
    }
}

/// OAuth2 introspection and user-info endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrospectionConfig {
    /// Introspection endpoint URL (form-encoded POST)
    pub url: String,
    /// Client identifier for HTTP Basic auth
    pub client_id: String,
    /// Client secret for HTTP Basic auth (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// User-info endpoint URL (bearer-authenticated GET)
    pub user_info_url: String,
    /// Per-call deadline for introspection and user-info requests, seconds
    pub timeout_secs: u64,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/token/introspection".to_string(),
            client_id: "client".to_string(),
            client_secret: "12345678".to_string(),
            user_info_url: "http://auth/me".to_string(),
            timeout_secs: 5,
        }
    }
}

impl IntrospectionConfig {
    /// Resolve the client secret (expand `env:VAR_NAME` references)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        if let Some(var_name) = self.client_secret.strip_prefix("env:") {
            env::var(var_name).unwrap_or_else(|_| self.client_secret.clone())
        } else {
            self.client_secret.clone()
        }
    }

    /// Per-call deadline as a [`Duration`]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MTLS_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("MTLS_GATEWAY_").split("__"));

        figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}
