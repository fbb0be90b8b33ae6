//! CloudBus node entry point.

use anyhow::{Context, Result};
use cloud_bus_node::{telemetry, NodeConfig, NodeRuntime};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env().context("loading node configuration")?;
    telemetry::init_logging(&config)?;

    let runtime = NodeRuntime::new(config)?;
    let listener = runtime
        .bind()
        .await
        .with_context(|| format!("binding {}", runtime.config().listen))?;

    info!("Node is running. Press Ctrl+C to stop.");
    runtime
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    Ok(())
}
