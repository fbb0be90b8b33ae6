//! # CloudBus Node
//!
//! Hosts one management node of a CloudBus cluster.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (from env)
//! 2. Initialise logging
//! 3. Build the bus and register the built-in `cloudbus.ping` service
//! 4. Bind the HTTP listener and start the bus
//! 5. Serve `POST <ctx>/cloudbus`, `GET /health`, `GET /admin/*` until Ctrl-C
//! 6. Stop the bus

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod ping;
pub mod runtime;
pub mod telemetry;

pub use config::NodeConfig;
pub use runtime::NodeRuntime;

/// Node startup and serving failures.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] cloud_bus::ConfigError),

    #[error("bus error: {0}")]
    Bus(#[from] cloud_bus::BusError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}
