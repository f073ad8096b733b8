//! gitopsctl entry point.
//!
//! Loads the application and cluster registries, starts the reconciliation
//! controller, and shuts it down gracefully on ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use gitopsctl::controller::{Controller, ControllerDeps, ControllerSettings};
use gitopsctl::registry::{Applications, Clusters};
use gitopsctl::Error;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How long to wait for workers to finish on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting gitopsctl v{}", env!("CARGO_PKG_VERSION"));

    let settings = ControllerSettings::default();
    let apps = Arc::new(Applications::load(&settings.app_config_path).await?);
    let clusters = Arc::new(Clusters::load(&settings.cluster_config_path).await?);

    if apps.is_empty().await {
        warn!("No applications registered; the controller will idle until one is added.");
    }
    if clusters.is_empty().await {
        warn!("No clusters registered; applications cannot be reconciled without one.");
    }

    let controller = Controller::new(apps, clusters, ControllerDeps::production(), settings);
    controller.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, controller.stop())
        .await
        .is_err()
    {
        warn!(
            "Graceful shutdown timed out after {}s; exiting anyway",
            SHUTDOWN_TIMEOUT.as_secs()
        );
    }

    Ok(())
}
