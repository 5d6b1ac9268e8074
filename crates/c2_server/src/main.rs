use anyhow::Context;
use c2_server::{grpc, http, metrics::Metrics, registry::Registry, sweeper};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

/// `c2-serverd` — agent registry, command dispatch, and operator surface.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Config {
    /// gRPC listen address for the agent-facing `C2Service`.
    #[arg(long, env = "C2_ADDR", default_value = "0.0.0.0:50051")]
    addr: String,

    /// HTTP listen address for the operator surface (REST + websocket shell).
    #[arg(long, env = "C2_WEB_ADDR", default_value = "0.0.0.0:8080")]
    web: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let config = Config::parse();
    tracing::info!(config = ?config, "loaded configuration");

    let grpc_addr: std::net::SocketAddr = config
        .addr
        .parse()
        .context("failed to parse --addr")?;
    let web_addr: std::net::SocketAddr = config
        .web
        .parse()
        .context("failed to parse --web")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let registry = Registry::new();
    let metrics = Arc::new(Metrics::new());

    let grpc_handle = {
        let registry = registry.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move { grpc::serve_grpc(registry, metrics, grpc_addr).await })
    };

    let http_handle = {
        let state = http::AppState {
            registry: registry.clone(),
            metrics: metrics.clone(),
        };
        let app = http::router(state).merge(metrics_only_router(&metrics));
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(web_addr).await?;
            tracing::info!(address = %web_addr, "starting operator HTTP server");
            axum::serve(listener, app.into_make_service()).await?;
            Ok::<(), anyhow::Error>(())
        })
    };

    let sweeper_handle = {
        let registry = registry.clone();
        let metrics = metrics.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(sweeper::run(registry, metrics, shutdown_rx))
    };

    tracing::info!("all services started; awaiting shutdown signal");

    shutdown_signal().await;

    tracing::info!("shutdown signal received; terminating services");
    drop(shutdown_tx);

    let (grpc_res, http_res, sweeper_res) = tokio::join!(grpc_handle, http_handle, sweeper_handle);

    let mut listener_failure = None;

    match grpc_res {
        Err(e) => tracing::error!(error = %e, "gRPC server task panicked"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "gRPC server failed");
            listener_failure.get_or_insert(e);
        }
        Ok(Ok(())) => {}
    }
    match http_res {
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "HTTP server failed");
            listener_failure.get_or_insert(e);
        }
        Ok(Ok(())) => {}
    }
    if let Err(e) = sweeper_res {
        tracing::error!(error = %e, "liveness sweeper task failed");
    }

    if let Some(e) = listener_failure {
        return Err(e.context("a listener failed; exiting non-zero"));
    }

    tracing::info!("c2-serverd shut down gracefully");
    Ok(())
}

fn metrics_only_router(metrics: &Arc<Metrics>) -> axum::Router {
    metrics.router()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
