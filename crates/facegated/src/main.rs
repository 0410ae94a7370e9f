use anyhow::{Context, Result};
use facegate_core::{AccessControl, CascadeLocator, HaarCascade, LbphTrainer};
use facegate_store::SqliteGallery;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        cascade = %config.cascade_path.display(),
        threshold = config.match_threshold,
        workers = config.workers,
        "facegated starting"
    );

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let gallery = Arc::new(SqliteGallery::open(&config.db_path)?);

    let cascade = HaarCascade::load(&config.cascade_path)?;
    let locator = Arc::new(CascadeLocator::new(cascade, config.locator_params())?);

    let service = AccessControl::new(gallery, locator, LbphTrainer::default(), config.verify_policy())?;
    let engine = engine::spawn_engine(Arc::new(service), config.workers, config.queue_depth)?;

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(
            dbus_interface::OBJECT_PATH,
            dbus_interface::AccessService::new(engine),
        )?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        name = dbus_interface::BUS_NAME,
        "facegated ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
