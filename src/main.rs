//! Vault Transform relay for BigQuery remote functions
//!
//! Exposes `/encrypt`, `/decrypt` and `/health`. Every value in a batch is
//! forwarded to the Vault Transform secret engine; nothing is stored.
//!
//! Usage:
//!   VAULT_ADDR=https://vault:8200 VAULT_TOKEN=... vault-transform-relay --port 8080

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vault_transform_relay::{AppState, Args, VaultTransformClient, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    info!("Vault Transform relay starting...");
    let vault = args.vault_config().context("Invalid Vault configuration")?;
    let server = args.server_config().context("Invalid server configuration")?;
    if vault.is_insecure_remote() {
        warn!("Vault address {} is plain HTTP; the token is sent unencrypted", vault.base_url);
    }

    let client = VaultTransformClient::new(&vault).context("Failed to create Vault client")?;
    let state = AppState::new(Arc::new(client), server.concurrency)
        .with_max_body_bytes(server.max_body_bytes);
    let app = build_router(state);

    let listener = TcpListener::bind(server.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", server.bind_addr()))?;
    info!(
        "Listening on {} (vault: {}, role: {}, namespace: {}, concurrency: {})",
        listener.local_addr()?,
        vault.base_url,
        vault.transform_role,
        vault.namespace.as_deref().unwrap_or("-"),
        server.concurrency
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
