use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointOptions;

/// Listen URL used when the environment names none.
pub const DEFAULT_SMTP_URL: &str = "smtp://127.0.0.1:1025";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SMTP listen URLs (`smtp://` or `smtps://`), comma separated in the
    /// environment.
    pub smtp_urls: Vec<String>,

    /// Sets SO_REUSEPORT on every listener.
    pub reuse_port: bool,

    /// PEM certificate chain for `smtps://` listeners.
    pub tls_cert: Option<PathBuf>,

    /// PEM private key matching `tls_cert`.
    pub tls_key: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let smtp_urls: Vec<String> = env::var("MAILCATCH_SMTP_URL")
            .map(|value| {
                tracing::info!("config: using smtp urls from env: {}", value);
                value
            })
            .unwrap_or_else(|_| {
                tracing::info!("config: using default smtp url: {}", DEFAULT_SMTP_URL);
                DEFAULT_SMTP_URL.to_string()
            })
            .split(',')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
            .collect();
        if smtp_urls.is_empty() {
            return Err(anyhow!("MAILCATCH_SMTP_URL must contain at least one URL"));
        }

        let reuse_port = match env::var("MAILCATCH_REUSE_PORT") {
            Ok(value) => match value.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(anyhow!(
                        "MAILCATCH_REUSE_PORT ('{other}') must be a boolean"
                    ))
                }
            },
            Err(_) => false,
        };

        let tls_cert = env::var("MAILCATCH_TLS_CERT").ok().map(PathBuf::from);
        let tls_key = env::var("MAILCATCH_TLS_KEY").ok().map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(anyhow!(
                "MAILCATCH_TLS_CERT and MAILCATCH_TLS_KEY must be set together"
            ));
        }

        Ok(Config {
            smtp_urls,
            reuse_port,
            tls_cert,
            tls_key,
        })
    }

    /// Endpoint options shared by every configured listener.
    pub fn endpoint_options(&self) -> EndpointOptions {
        EndpointOptions {
            reuse_port: self.reuse_port,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            ..EndpointOptions::default()
        }
    }
}

#[cfg(test)]
mod tests;
