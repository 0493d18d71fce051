//! Model alias watcher
//!
//! Watches the registry alias that marks the production model and keeps the
//! serving process on the version it points at.
//!
//! ## Architecture
//!
//! - **Reconciler**: polls the alias, restarts the serving process on change
//! - **Cleanup**: deletes runs and versions no alias references
//! - **Garbage collector**: reclaims artifact storage for deleted versions

use std::sync::Arc;

use anyhow::{Context, Result};
use modelwatch_watcher::{Config, MlflowRegistry, ProcessExecutor, Reconciler};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to WATCHER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting model watcher");
    info!(
        model = %config.model_name,
        alias = %config.alias,
        tracking_uri = %config.tracking_uri,
        serving_container = ?config.serving_container,
        gc_container = ?config.gc_container,
        backend_store_uri = %config.redacted_backend_store_uri(),
        artifacts_destination = %config.artifacts_destination,
        gc_fallback = ?config.gc_fallback,
        "Configuration loaded"
    );

    let registry = MlflowRegistry::new(&config.tracking_uri, config.registry_timeout)
        .context("Failed to build registry client")?;
    let executor = ProcessExecutor::new();

    let reconciler = Arc::new(Reconciler::new(
        &config,
        Arc::new(registry),
        Arc::new(executor),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(reconciler.run(shutdown_rx));

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut handle => Some(result),
    };

    let result = match finished {
        Some(result) => result,
        None => {
            info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            // In-flight registry calls and commands are not interrupted.
            handle.await
        }
    };

    match result {
        Ok(state) => info!(
            last_known_version = ?state.last_known_version.as_ref().map(|v| v.as_str()),
            "Reconciler exited"
        ),
        Err(e) => error!(error = %e, "Reconciler task panicked"),
    }

    info!("Model watcher shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
