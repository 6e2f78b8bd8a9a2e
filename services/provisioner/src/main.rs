//! provisionerd
//!
//! Long-running provisioner daemon. Wires the reconciliation task to an
//! in-memory machine store and the dummy cloud backend; real providers
//! register additional factories on the same registry.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use convoy_provisioner::config::Config;
use convoy_provisioner::dummy::DummyCloud;
use convoy_provisioner::tools::{SimpleCatalogue, Tools};
use convoy_provisioner::{
    environ_channel, EnvironConfig, MemoryStore, ProviderRegistry, ProvisionerTask, StoreFacade,
    TaskParams,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to CONVOY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting convoy provisioner");
    info!(
        environment = %config.environment,
        provider = %config.provider_type,
        authority = %config.authority,
        safe_mode = config.safe_mode,
        "Configuration loaded"
    );

    let cloud = DummyCloud::new();
    let mut registry = ProviderRegistry::new();
    registry.register("dummy", cloud.factory());

    let store = Arc::new(MemoryStore::new());
    let catalogue = Arc::new(SimpleCatalogue::with_tools(vec![
        Tools {
            version: "2.1.0".to_string(),
            series: "noble".to_string(),
            arch: "amd64".to_string(),
            url: "file:///usr/share/convoy/tools/2.1.0-noble-amd64.tgz".to_string(),
        },
        Tools {
            version: "2.1.0".to_string(),
            series: "noble".to_string(),
            arch: "arm64".to_string(),
            url: "file:///usr/share/convoy/tools/2.1.0-noble-arm64.tgz".to_string(),
        },
    ]));

    let environ = EnvironConfig::new(config.environment.clone(), config.provider_type.clone())
        .with_safe_mode(config.safe_mode);
    // Kept for the life of the daemon; config updates go through it.
    let (_environ_tx, environ_rx) = environ_channel(environ);

    let handle = ProvisionerTask::spawn(TaskParams {
        authority: config.authority.clone(),
        store: StoreFacade::from_store(store),
        catalogue,
        registry,
        environ: environ_rx,
        retry_limit: config.retry_limit,
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.stop().await?;
    info!("Provisioner stopped");
    Ok(())
}
