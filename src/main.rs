use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use package_operator::cache::DynamicCache;
use package_operator::config::OperatorConfig;
use package_operator::controller::{run_controller, ControllerState};
use package_operator::rest_api;
use package_operator::store::{KubeStore, ObjectStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());
    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    config.validate()?;
    info!(
        "Starting package operator v{} (namespace: {})",
        env!("CARGO_PKG_VERSION"),
        config.namespace.as_deref().unwrap_or("<all>")
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let cache = DynamicCache::with_sync_timeout(store.clone(), config.cache_sync_timeout());

    let state = Arc::new(ControllerState::new(
        client,
        store,
        cache.clone(),
        config.deployment_settings(),
        config.namespace.clone(),
        config.reconcile_timeout(),
    ));

    let api_bind = config.api_bind;
    tokio::spawn(async move {
        if let Err(e) = rest_api::run_server(api_bind, cache).await {
            error!("REST API server failed: {:?}", e);
        }
    });

    run_controller(state).await?;
    Ok(())
}
