use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vigil_core::CommandExtractor;

mod capture;
mod config;
mod dbus_interface;
mod evidence;
mod monitor;

use dbus_interface::{ServiceState, VigilService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        registry = %config.registry_path.display(),
        dimension = config.embedding_dim,
        threshold = config.match_threshold,
        camera = %config.camera_device,
        "configuration loaded"
    );

    let extractor = Arc::new(CommandExtractor::new(
        config.extractor_program.clone(),
        config.extractor_args.clone(),
    ));
    let state = Arc::new(ServiceState::new(
        config,
        extractor,
        Arc::new(evidence::SystemClock),
    ));

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(
            OBJECT_PATH,
            VigilService {
                state: Arc::clone(&state),
            },
        )?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");
    state.shutdown().await;

    Ok(())
}
