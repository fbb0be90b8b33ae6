//! Test fixtures: clusters of real bus nodes talking HTTP on localhost.

use async_trait::async_trait;
use cloud_bus::transport::{serve, TransportError};
use cloud_bus::{BusConfig, CloudBus, ErrorCode, HandlerError, ManagementNode, Message, Service, TraceContext};
use parking_lot::Mutex;
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn node_name(index: usize) -> String {
    format!("mn-{}", index)
}

/// A started bus with its HTTP endpoint.
pub struct TestNode {
    pub bus: CloudBus,
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<(), TransportError>>>,
}

impl TestNode {
    pub fn node_id(&self) -> &str {
        self.bus.node_id()
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, self.bus.config().route_path())
    }

    /// Stops serving HTTP and stops the bus.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = tokio::time::timeout(WAIT, server).await;
        }
        self.bus.stop();
    }
}

/// Starts `size` nodes that all know each other.
///
/// Retries are short so failure paths finish quickly. `tweak` runs on every
/// node's config before its bus is built.
pub async fn cluster<F>(size: usize, tweak: F) -> Vec<TestNode>
where
    F: Fn(usize, &mut BusConfig),
{
    let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut listeners = Vec::with_capacity(size);
    for _ in 0..size {
        listeners.push(TcpListener::bind((localhost, 0)).await.unwrap());
    }

    let peers: Vec<ManagementNode> = listeners
        .iter()
        .enumerate()
        .map(|(i, l)| ManagementNode::new(node_name(i), localhost).with_port(l.local_addr().unwrap().port()))
        .collect();

    let mut nodes = Vec::with_capacity(size);
    for (i, listener) in listeners.into_iter().enumerate() {
        let addr = listener.local_addr().unwrap();
        let mut config = BusConfig {
            node_id: node_name(i),
            node_ip: localhost,
            peers: peers.clone(),
            ..BusConfig::default()
        };
        config.http.port = addr.port();
        config.http.retry_times = 2;
        config.http.retry_interval = Duration::from_millis(20);
        config.http.connect_timeout = Duration::from_secs(1);
        config.http.request_timeout = Duration::from_secs(5);
        tweak(i, &mut config);

        let bus = CloudBus::builder(config).build().unwrap();
        bus.start().unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(bus.clone(), listener, async {
            let _ = rx.await;
        }));

        nodes.push(TestNode {
            bus,
            addr,
            shutdown: Some(tx),
            server: Some(server),
        });
    }
    nodes
}

pub async fn shutdown_all(nodes: &mut [TestNode]) {
    for node in nodes {
        node.shutdown().await;
    }
}

/// Replies with the handling node id and the request's `seq`.
pub struct EchoService;

#[async_trait]
impl Service for EchoService {
    fn id(&self) -> &str {
        "echo"
    }

    async fn handle_message(&self, msg: &Message, bus: &CloudBus) -> Result<(), HandlerError> {
        let seq: u64 = msg.body.decode("seq").map_err(anyhow::Error::from)?;
        let reply = Message::reply("EchoReply")
            .with_value("node_id", json!(bus.node_id()))
            .with_value("seq", json!(seq));
        bus.reply(msg, reply).await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

pub fn echo_to(node_id: &str, seq: u64) -> Message {
    Message::need_reply("EchoMsg")
        .with_service_id(format!("{}:::echo", node_id))
        .with_value("seq", json!(seq))
}

/// Fails every message with an operation error.
pub struct FailingService;

#[async_trait]
impl Service for FailingService {
    fn id(&self) -> &str {
        "failing"
    }

    async fn handle_message(&self, msg: &Message, _bus: &CloudBus) -> Result<(), HandlerError> {
        Err(ErrorCode::operation(format!("cannot handle {}", msg.type_name)).into())
    }
}

/// Never replies.
pub struct SilentService;

#[async_trait]
impl Service for SilentService {
    fn id(&self) -> &str {
        "silent"
    }

    async fn handle_message(&self, _msg: &Message, _bus: &CloudBus) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Records the trace context each delivery runs under, then replies.
#[derive(Default)]
pub struct ContextProbe {
    pub seen: Mutex<Vec<TraceContext>>,
}

#[async_trait]
impl Service for ContextProbe {
    fn id(&self) -> &str {
        "probe"
    }

    async fn handle_message(&self, msg: &Message, bus: &CloudBus) -> Result<(), HandlerError> {
        self.seen.lock().push(TraceContext::current());
        bus.reply(msg, Message::reply("ProbeReply"))
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

pub fn register<S: Service + 'static>(node: &TestNode, service: S) -> Arc<S> {
    let service = Arc::new(service);
    node.bus.register_service(service.clone()).unwrap();
    service
}
