//! Node runtime: bus, HTTP server and admin endpoints.

use crate::config::NodeConfig;
use crate::ping::PingService;
use crate::NodeError;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use cloud_bus::{CloudBus, EnvelopeStatsSnapshot};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// One management node.
pub struct NodeRuntime {
    config: NodeConfig,
    bus: CloudBus,
}

#[derive(Debug, Serialize)]
struct ServicesView {
    node_id: String,
    running: bool,
    services: Vec<String>,
}

impl NodeRuntime {
    /// Builds the bus and registers the built-in services. Must run inside a
    /// tokio runtime.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        info!(node_id = %config.bus.node_id, listen = %config.listen, "creating cloud bus node");

        let bus = CloudBus::builder(config.bus.clone()).build()?;
        bus.register_service(Arc::new(PingService))?;
        Ok(Self { config, bus })
    }

    pub fn bus(&self) -> &CloudBus {
        &self.bus
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, NodeError> {
        Ok(TcpListener::bind(self.config.listen).await?)
    }

    /// Bus endpoint plus `/admin/*`.
    pub fn router(&self) -> Router {
        let admin = Router::new()
            .route("/admin/envelopes", get(envelopes))
            .route("/admin/services", get(services))
            .with_state(self.bus.clone());
        cloud_bus::transport::router(self.bus.clone()).merge(admin)
    }

    /// Starts the bus and serves until `shutdown` resolves, then stops the bus.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), NodeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: Option<SocketAddr> = listener.local_addr().ok();
        self.bus.start()?;
        info!(
            node_id = %self.bus.node_id(),
            addr = ?addr,
            path = %self.bus.config().route_path(),
            "node is serving"
        );

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        info!("initiating graceful shutdown...");
        self.bus.stop();
        served?;
        info!("node stopped");
        Ok(())
    }
}

async fn envelopes(State(bus): State<CloudBus>) -> Json<EnvelopeStatsSnapshot> {
    Json(bus.envelope_stats())
}

async fn services(State(bus): State<CloudBus>) -> Json<ServicesView> {
    Json(ServicesView {
        node_id: bus.node_id().to_string(),
        running: bus.is_running(),
        services: bus.service_ids(),
    })
}
