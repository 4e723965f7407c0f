use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

mod app;
mod auth;
mod classify;
mod forward;
mod http;
mod metrics;
mod notify;
mod record;
mod relay;
mod response;

use prism_core::config::{PrismConfig, SHUTDOWN_DRAIN_SECS};
use prism_storage::{RequestStore, RequestWriter};

#[derive(Parser)]
#[command(name = "prism-proxy", about = "Recording reverse proxy for the Messages API")]
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
                .unwrap_or_else(|_| "prism_proxy=info,tower_http=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = PrismConfig::load(args.config.as_deref())?;

    // Storage is optional; without it the proxy still relays, it just keeps
    // no records and every request starts a fresh conversation.
    let (store, writer, writer_join) = if config.storage_enabled {
        let pool = prism_storage::connect(config.require_database_url()?).await?;
        let store = RequestStore::new(pool);
        let (writer, join) =
            RequestWriter::spawn(store.clone(), prism_storage::writer::DEFAULT_QUEUE_CAPACITY);
        (Some(store), Some(writer), Some(join))
    } else {
        warn!("storage disabled; requests will not be persisted");
        (None, None, None)
    };

    let bind = config.bind.clone();
    let port = config.port;
    let state = Arc::new(app::AppState::new(config, store, writer));
    let router = app::build_router(state.clone());

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("prism proxy listening on {addr}");

    // Graceful stop: quit accepting on the signal, drain in-flight requests
    // up to the deadline, then force-close whatever is left.
    let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });
    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = signal_rx.await;
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_DRAIN_SECS)).await;
        } => {
            warn!("drain deadline passed; closing remaining connections");
        }
    }

    // Drain the writer queue before exiting so late records survive.
    if let (Some(writer), Some(join)) = (&state.writer, writer_join) {
        info!(queued = writer.queued(), "flushing writer queue");
        writer.shutdown();
        if tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_SECS), join)
            .await
            .is_err()
        {
            warn!("writer queue did not drain before the shutdown deadline");
        }
    }

    Ok(())
}

/// Resolves on SIGINT or SIGTERM; axum then stops accepting and drains.
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
    tracing::info!("shutdown signal received; draining in-flight requests");
}
