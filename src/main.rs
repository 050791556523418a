use crate::service::WatcherService;
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cluster;
mod config;
mod dispatcher;
mod image_reference;
mod index;
mod listener;
mod push_event;
mod secret_string;
mod service;
mod webhook;
mod workload;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    info!("Starting image-reloader {}", env!("CARGO_PKG_VERSION"));

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = config::load_config(&config_path)?;

    let client = cluster::create_client().await?;
    let shutdown = CancellationToken::new();

    info!(
        "Watching Deployments and StatefulSets in {}",
        config.watcher.namespace.as_deref().unwrap_or("all namespaces")
    );
    let service = Arc::new(WatcherService::start(
        client,
        &config.watcher,
        shutdown.clone(),
    ));

    if config.webhook.auth_token.is_none() {
        warn!("No webhook auth token configured, accepting unauthenticated push events");
    }
    let app = webhook::create_app(service, config.webhook.auth_token);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("image-reloader stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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

    info!("Shutdown signal received, stopping watchers and dispatcher");
    shutdown.cancel();
}
