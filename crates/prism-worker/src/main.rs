use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod analyzer;
mod error;
mod prompt;
mod runner;
mod watchdog;

use prism_core::PrismConfig;
use prism_storage::{AnalysisStore, JobQueue, RequestStore};

#[derive(Parser)]
#[command(name = "prism-worker", about = "Conversation analysis worker")]
struct Args {
    /// Path to prism.toml (defaults to PRISM_CONFIG or ./prism.toml)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism_worker=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = PrismConfig::load(args.config.as_deref())?;
    if !config.ai_worker_enabled {
        info!("AI_WORKER_ENABLED is false; exiting");
        return Ok(());
    }

    let pool = prism_storage::connect(config.require_database_url()?).await?;
    let jobs = JobQueue::new(pool.clone());
    let store = RequestStore::new(pool.clone());
    let analyses = AnalysisStore::new(pool);
    let analyzer = analyzer::Analyzer::new(
        &config.analysis_base_url,
        config.analysis_api_key.clone(),
        &config.analysis_model,
    );

    let shutdown = CancellationToken::new();
    let watchdog_task = tokio::spawn(watchdog::run(
        jobs.clone(),
        config.ai_worker_job_timeout_minutes,
        shutdown.clone(),
    ));

    let worker = Arc::new(runner::Worker::new(config, jobs, store, analyses, analyzer));
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    shutdown_signal().await;
    info!("signal received; stopping claim loop");
    shutdown.cancel();

    let _ = worker_task.await;
    let _ = watchdog_task.await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
