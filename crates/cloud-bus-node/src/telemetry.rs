//! Logging setup.

use crate::config::NodeConfig;
use crate::NodeError;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level when it parses.
pub fn init_logging(config: &NodeConfig) -> Result<(), NodeError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| NodeError::Logging(e.to_string()))?;

    let installed = if config.json_logs {
        // JSON output for containers/production
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };
    installed.map_err(|e| NodeError::Logging(e.to_string()))?;

    tracing::info!(
        level = %config.log_level,
        json = config.json_logs,
        "logging initialized"
    );
    Ok(())
}
