use anyhow::{Context, Result};
use facegate_core::OnnxFaceEmbedder;
use facegate_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db_path = %config.db_path.display(),
        workers = config.engine_workers,
        system_bus = config.system_bus,
        "configuration"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("open database {}", config.db_path.display()))?,
    );

    let model_dir = config.model_dir.clone();
    let engine = engine::spawn_engine(Arc::clone(&store), config.engine_workers, || {
        OnnxFaceEmbedder::load(&model_dir)
    })
    .context("start engine")?;

    let service = AttendanceService::new(
        engine,
        store,
        Duration::from_secs(config.request_timeout_secs),
        config.model_dir.clone(),
    );

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("register on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
