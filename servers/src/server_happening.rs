//! # Happening Hub Server
//!
//! Runs the events and clients services until Ctrl+C / SIGTERM, then stops
//! them gracefully. Queued events get a last archive flush on the way out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_graceful::{Shutdown, ShutdownGuard};
use tracing::{error, info};

use lib_happening::{load_config, open_backend, setup_logging, Hub};

const APP_NAME: &str = "server_happening";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().context("loading configuration")?;

    // Keeps the file appender flushing until main returns.
    let _log_guard = match setup_logging(&config.log_level, config.log_dir.as_deref(), APP_NAME) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    info!("{:?}", config);

    let storage = open_backend(config.storage_path.as_deref()).context("opening storage")?;
    let hub = match Hub::start(&config, storage).await {
        Ok(hub) => Arc::new(hub),
        Err(e) => {
            error!("Failed to start hub: {}", e);
            return Err(e.into());
        }
    };

    let shutdown: Shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| run_hub(guard, hub));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");
    Ok(())
}

async fn run_hub(shutdown_guard: ShutdownGuard, hub: Arc<Hub>) {
    shutdown_guard.cancelled().await;
    info!("Signal received: initiate graceful shutdown");
    hub.stop().await;
    info!(
        "{} event(s) archived, {} lost to storage errors",
        hub.archiver().archived(),
        hub.archiver().failed()
    );
}
