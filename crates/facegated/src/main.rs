use anyhow::{Context, Result};
use facegate_core::DescriptorStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{FaceGateService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        kind = ?config.descriptor_kind,
        store = %config.store_path.display(),
        threshold = config.auth.confidence_threshold,
        "configuration loaded"
    );

    let store = DescriptorStore::open(&config.store_path, config.store_variant())
        .with_context(|| format!("opening store {}", config.store_path.display()))?;
    let store = Arc::new(store);
    tracing::info!(users = store.len()?, "descriptor store opened");

    let extractor = engine::build_extractor(&config).context("loading models")?;
    let engine =
        engine::spawn_engine(&config, store.clone(), extractor).context("starting engine")?;

    let system_bus = config.system_bus;
    let service = FaceGateService::new(engine, store, Arc::new(config));

    let builder = if system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    let bus = if system_bus { "system" } else { "session" };
    tracing::info!(bus, name = BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
