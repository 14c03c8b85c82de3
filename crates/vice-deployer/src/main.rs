use std::{sync::Arc, time::Duration};

use clap::Parser;
use snafu::{ResultExt, Whatever};
use tokio::{net::TcpListener, signal::unix::{SignalKind, signal}};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vice_deployer::{
    DeployerConfig, DeploymentEngine,
    server::{AppState, router},
};

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let config = DeployerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VICE_DEPLOYER_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let client = kube::Client::try_default()
        .await
        .whatever_context("failed to create Kubernetes client")?;

    let engine = DeploymentEngine::new(
        client,
        config.file_transfer_port,
        config.transfer_base_path.clone(),
    );

    let state = AppState {
        engine: Arc::new(engine),
        default_namespace: config.namespace.clone(),
        transfer_timeout: Duration::from_secs(config.transfer_timeout_secs),
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .whatever_context(format!("failed to bind to {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, namespace = %config.namespace, "vice-deployer listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .whatever_context("server error")?;

    info!("vice-deployer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(_) => return,
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(_) => return,
    };

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
