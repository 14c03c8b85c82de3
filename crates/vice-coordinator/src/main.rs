use std::{sync::Arc, time::Duration};

use clap::Parser;
use snafu::{ResultExt, Whatever, whatever};
use sqlx::postgres::PgPoolOptions;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use vice_crypto::Encryptor;
use vice_spec::{SpecBuilder, UserInfo};

use vice_coordinator::{
    ClusterRegistry, Coordinator, CoordinatorConfig,
    api::{AppState, router},
    apps::AppsClient,
    client::DeployerClient,
    selector::ClusterSelector,
    store::{ClusterStore, PgClusterStore},
};

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let config = CoordinatorConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VICE_COORDINATOR_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let encryptor = match &config.encryption_key {
        Some(key) => {
            Encryptor::from_base64(key).whatever_context("invalid APP_EXPOSER_ENCRYPTION_KEY")?
        }
        None if config.allow_plaintext_secrets => Encryptor::passthrough(),
        None => whatever!(
            "APP_EXPOSER_ENCRYPTION_KEY is not set; refusing to store cluster secrets in \
             plaintext (pass --allow-plaintext-secrets to override in development)"
        ),
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .whatever_context("failed to connect to the database")?;

    let store = PgClusterStore::new(pool);
    store
        .migrate()
        .await
        .whatever_context("failed to run database migrations")?;
    let store: Arc<dyn ClusterStore> = Arc::new(store);

    let registry = Arc::new(ClusterRegistry::new(
        store.clone(),
        Arc::new(encryptor),
        Duration::from_secs(config.reload_interval_secs),
    ));
    registry
        .start()
        .await
        .whatever_context("initial cluster registry load failed")?;

    let client = DeployerClient::new(registry.clone());
    let selector = ClusterSelector::new(
        registry.clone(),
        client.clone(),
        config.selection_strategy,
    );

    let apps: Arc<dyn UserInfo> = Arc::new(AppsClient::new(
        config.apps_base_url.clone(),
        reqwest::Client::new(),
    ));
    let builder = SpecBuilder::new(config.builder_config(), apps);

    let coordinator = Arc::new(Coordinator::new(
        registry.clone(),
        client,
        selector,
        builder,
        store,
    ));

    let state = AppState {
        coordinator,
        registry: registry.clone(),
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .whatever_context(format!("failed to bind to {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, strategy = %config.selection_strategy, "vice-coordinator listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .whatever_context("server error")?;

    registry.stop().await;
    info!("vice-coordinator stopped");
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
