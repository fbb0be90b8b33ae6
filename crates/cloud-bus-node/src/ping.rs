//! Built-in liveness service.

use async_trait::async_trait;
use cloud_bus::{CloudBus, ErrorCode, HandlerError, Message, Service};
use serde_json::json;

/// Name of the ping service on every node.
pub const PING_SERVICE_NAME: &str = "cloudbus.ping";
pub const PING_MSG: &str = "PingMsg";
pub const PING_REPLY: &str = "PingReply";

/// Answers `PingMsg` with the id of the node that handled it.
///
/// An optional `echo` field is sent back unchanged.
#[derive(Debug, Default)]
pub struct PingService;

#[async_trait]
impl Service for PingService {
    fn id(&self) -> &str {
        PING_SERVICE_NAME
    }

    async fn handle_message(&self, msg: &Message, bus: &CloudBus) -> Result<(), HandlerError> {
        if msg.type_name != PING_MSG {
            return Err(ErrorCode::invalid_argument(format!("{} cannot handle {}", PING_SERVICE_NAME, msg.describe())).into());
        }

        let mut reply = Message::reply(PING_REPLY).with_value("node_id", json!(bus.node_id()));
        if let Some(echo) = msg.body.get("echo") {
            reply = reply.with_field("echo", echo.clone());
        }
        bus.reply(msg, reply).await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// Ping request for `node_id`.
pub fn ping(bus: &CloudBus, node_id: &str) -> Message {
    Message::need_reply(PING_MSG).with_service_id(bus.make_service_id_by_node(PING_SERVICE_NAME, node_id))
}
