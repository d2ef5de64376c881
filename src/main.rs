//! recap binary: load configuration, open the cache store, serve until
//! signalled.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use recap::cache::DiskStore;
use recap::config::ProxyConfig;
use recap::proxy::ProxyService;
use recap::server::Server;
use recap::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    match dotenvy::dotenv() {
        Ok(path) => info!(path = %path.display(), "loaded environment from .env"),
        Err(_) => info!("no .env file found, using process environment"),
    }

    let config = match ProxyConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        upstream = %config.upstream,
        listen_port = config.listen_port,
        cache_dir = %config.cache_dir.display(),
        "starting recap"
    );

    let store = match DiskStore::open(&config.cache_dir, config.cache_max_size_bytes) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, dir = %config.cache_dir.display(), "cannot open cache directory");
            return ExitCode::FAILURE;
        }
    };

    let client = UpstreamClient::new(config.upstream.clone(), config.upstream_timeout);
    let service = Arc::new(ProxyService::new(
        store,
        client,
        config.cache_default_ttl_secs,
        config.stale_if_error_secs,
    ));

    let server = match Server::bind(config.listen_addr()).await {
        Ok(server) => server.with_max_connections(config.max_concurrent_requests),
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let result = server
        .run_until(
            move |request, peer| {
                let service = Arc::clone(&service);
                async move { service.handle(request, peer).await }
            },
            shutdown_signal(),
        )
        .await;

    match result {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
