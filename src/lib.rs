pub mod config;
pub mod endpoint;
pub mod smtp;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::endpoint::UrlEndpoint;
use crate::smtp::{Envelope, MessageHandler, SmtpServer};

pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load configuration: {}", err);
            return Err(err);
        }
    };

    // The identity key deduplicates addresses configured more than once.
    let options = config.endpoint_options();
    let mut endpoints = HashSet::new();
    for url in &config.smtp_urls {
        let endpoint = UrlEndpoint::parse(url, options.clone())
            .with_context(|| format!("invalid listen URL {url:?}"))?;
        endpoints.insert(endpoint);
    }

    // Capture-and-log stands in for a storage collaborator; anything that
    // persists or forwards messages plugs in here.
    let handler: MessageHandler = Arc::new(|envelope: Envelope| {
        info!(
            sender = %envelope.sender(),
            recipients = ?envelope.recipients(),
            bytes = envelope.content().len(),
            "message received"
        );
    });

    let cancel = CancellationToken::new();
    let mut servers = Vec::new();
    for endpoint in endpoints {
        let server = SmtpServer::new(endpoint, Arc::clone(&handler));
        let cancel = cancel.clone();
        servers.push(tokio::spawn(async move {
            if let Err(err) = server.run(cancel).await {
                error!("SMTP server failed: {}", err);
            }
        }));
    }

    // Wait for shutdown signal (SIGTERM/SIGINT)
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, closing listeners...");

    cancel.cancel();
    for server in servers {
        server.await.ok();
    }
    info!("Shutdown complete");

    Ok(())
}
