use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atelier_worker::config::{LogFormat, WorkerConfig, DEFAULT_LOG_FILTER};
use atelier_worker::intake;
use atelier_worker::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    // --- Tracing (stderr; stdout carries command replies) ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    match config.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    tracing::info!(
        interval_secs = config.reconcile.interval.as_secs(),
        max_upload_attempts = config.reconcile.upload_policy.max_attempts(),
        "Loaded worker configuration"
    );

    // --- Pipeline ---
    let worker = Worker::connect(&config)
        .await
        .context("Failed to start worker")?;
    tracing::info!("Worker started");

    // --- Command intake ---
    let service = worker.service();
    let intake = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        match intake::serve(&service, stdin, tokio::io::stdout()).await {
            Ok(handled) => tracing::info!(handled, "Command intake closed"),
            Err(e) => tracing::error!(error = %e, "Command intake failed"),
        }
    });

    worker.run(shutdown_signal()).await;
    intake.abort();

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
