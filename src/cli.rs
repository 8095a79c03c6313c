//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// mTLS Gateway - TLS-terminating reverse proxy with token enforcement
#[derive(Parser, Debug)]
#[command(name = "mtls-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MTLS_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port for the TLS-terminating listener
    #[arg(short, long, env = "MTLS_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Port for the plaintext health-check listener
    #[arg(long, env = "MTLS_GATEWAY_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MTLS_GATEWAY_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MTLS_GATEWAY_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_no_arguments() {
        let cli = Cli::parse_from(["mtls-gateway"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_port_and_config_overrides() {
        let cli = Cli::parse_from(["mtls-gateway", "-p", "8443", "-c", "/etc/gw.yaml"]);
        assert_eq!(cli.port, Some(8443));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/etc/gw.yaml")));
    }

    #[test]
    fn parses_log_format() {
        let cli = Cli::parse_from(["mtls-gateway", "--log-format", "json"]);
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
