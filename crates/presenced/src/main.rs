use anyhow::{Context, Result};
use presence_core::{AttendanceService, SystemClock};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod sqlite;

use config::{BusKind, Config};
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};

/// Pending extract requests buffered ahead of the engine task.
const EXTRACT_QUEUE_DEPTH: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        media_root = %config.media_root.display(),
        tolerance = config.tolerance,
        on_time = %config.cutoffs.on_time,
        late = %config.cutoffs.late,
        extract_timeout_secs = config.extract_timeout_secs,
        bus = ?config.bus,
        "configuration loaded"
    );
    if config.admin_pin.is_none() {
        tracing::warn!("PRESENCE_ADMIN_PIN not set; admin login is disabled");
    }

    let store = sqlite::SqliteStore::open(&config.db_path)
        .await
        .context("failed to open database")?;

    let command = engine::ExtractorCommand::from_argv(&config.extractor_command)?;
    let engine = engine::spawn_engine(command, config.extract_timeout(), EXTRACT_QUEUE_DEPTH);

    let service = AttendanceService::new(store, engine, SystemClock, config.service_settings());
    let iface = PresenceService::new(Arc::new(service), &config);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .with_context(|| format!("failed to claim {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
