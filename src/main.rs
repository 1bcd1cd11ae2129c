//! Cumulus worker - standalone job processing entry point.
//!
//! Runs the job system with the builtin worker catalogue, either on the
//! in-process backend or against a shared Redis instance alongside other
//! server processes.

use cumulus_core::config::Config;
use cumulus_core::jobs::builtin;
use cumulus_core::system::JobSystem;
use cumulus_core::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config: {}. Using defaults.", e);
        Config::default()
    });

    // Initialize logging and metrics
    telemetry::init(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.jobs.backend,
        "Starting Cumulus worker"
    );

    let workers = builtin::workers_list(config.jobs.base_worker_config());
    let system = JobSystem::start(&config, workers).await?;

    shutdown_signal().await;

    system.shutdown().await;
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
