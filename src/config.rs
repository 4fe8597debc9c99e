//! Relay configuration

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Listening ports, upstream endpoints, and store location.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Local port the IMAP listener binds to.
    pub imap_port: u16,
    /// Local port the SMTP listener binds to.
    pub smtp_port: u16,
    /// Real IMAP server, `host:port`.
    pub imap_upstream: String,
    /// Real SMTP server, `host:port`.
    pub smtp_upstream: String,
    /// Wrap upstream connections in TLS (for deployments where the
    /// remote endpoints are SSL-only).
    pub upstream_tls: bool,
    /// Location of the shared store file.
    pub store_path: PathBuf,
}

impl RelayConfig {
    /// Load relay configuration from environment variables
    ///
    /// Reads from `.env` file if present. All variables are optional:
    /// - `RELAY_IMAP_PORT` (default: `8082`)
    /// - `RELAY_SMTP_PORT` (default: `8081`)
    /// - `RELAY_IMAP_UPSTREAM` (default: `imap.nauta.cu:143`)
    /// - `RELAY_SMTP_UPSTREAM` (default: `smtp.nauta.cu:25`)
    /// - `RELAY_UPSTREAM_TLS` (default: `0`)
    /// - `RELAY_STORE_PATH` (default: `~/.mail-relay.json`)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when a port variable does not parse.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            imap_port: parse_port("RELAY_IMAP_PORT", 8082)?,
            smtp_port: parse_port("RELAY_SMTP_PORT", 8081)?,
            imap_upstream: env::var("RELAY_IMAP_UPSTREAM")
                .unwrap_or_else(|_| "imap.nauta.cu:143".to_string()),
            smtp_upstream: env::var("RELAY_SMTP_UPSTREAM")
                .unwrap_or_else(|_| "smtp.nauta.cu:25".to_string()),
            upstream_tls: env::var("RELAY_UPSTREAM_TLS").is_ok_and(|v| v == "1"),
            store_path: env::var("RELAY_STORE_PATH").map_or_else(
                |_| default_store_path(),
                PathBuf::from,
            ),
        })
    }
}

fn parse_port(var: &str, default: u16) -> Result<u16> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {var}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn default_store_path() -> PathBuf {
    env::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mail-relay.json")
}
