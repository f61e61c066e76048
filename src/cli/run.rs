//! `dlquota run`: a standalone engine instance.
//!
//! Uses the in-memory store and the log notifier, so it is mainly useful to
//! exercise a configuration. Embedders call `QuotaEngine::start` with their
//! own repository and notifier instead.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use dlquota::logging::init_logging;
use dlquota::{Config, InMemoryQuotaRepository, LogNotifier, QuotaEngine, StaticTenants};

use super::load_config;

pub(crate) async fn cmd_run(path: Option<&Path>, watch: bool, poll_secs: u64) -> Result<()> {
    let config = load_config(path)?;
    init_logging(&config.logging)?;

    let tenants = Arc::new(StaticTenants::new(config.tenants.clone()));
    let mut engine = QuotaEngine::start(
        config,
        Arc::new(InMemoryQuotaRepository::new()),
        Arc::new(LogNotifier),
        tenants,
    )
    .await
    .context("failed to start quota engine")?;

    if watch {
        let watched = path.map(Path::to_path_buf).unwrap_or_else(Config::path);
        info!(path = %watched.display(), poll_secs, "Watching config file");
        engine.watch_config(watched, Duration::from_secs(poll_secs.max(1)));
    }

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");
    let health = engine
        .health()
        .render_health_json(Some(engine.metrics().as_ref()));
    println!("{}", serde_json::to_string_pretty(&health)?);
    let report = engine.shutdown().await;
    info!(
        reconciled = report.reconciled,
        retained = report.retained,
        "Goodbye"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
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
}
