//! Per-message delivery strategy.
//!
//! A [`MessageSender`] resolves the target node from the service id, then
//! either hands the message to a local consumer or posts it to the peer.
//! Events are delivered locally and also posted to every other node.

use crate::bus::CloudBus;
use crate::context::TraceContext;
use crate::error::{BusError, BusResult, ErrorCode};
use crate::message::{make_service_id, split_service_id, Message, CORRELATION_ID, IS_REPLY};
use crate::transport::TransportError;
use futures::future::join_all;
use tracing::{debug, warn};

pub(crate) struct MessageSender {
    bus: CloudBus,
    msg: Message,
    ctx: TraceContext,
    node_id: String,
    service_id: String,
    local: bool,
}

impl MessageSender {
    pub(crate) fn new(bus: &CloudBus, msg: Message, ctx: TraceContext) -> BusResult<Self> {
        let raw = if msg.is_event() {
            bus.event_service_id().to_string()
        } else {
            msg.service_id
                .clone()
                .ok_or_else(|| BusError::MissingServiceId(msg.describe()))?
        };

        let (node, name) = split_service_id(&raw);
        if name.is_empty() || node == Some("") {
            return Err(BusError::MalformedServiceId(raw));
        }
        let node_id = node.unwrap_or(bus.node_id()).to_string();
        let service_id = make_service_id(&node_id, name);
        let local = !bus.config().http.always && node_id == bus.node_id();

        Ok(Self {
            bus: bus.clone(),
            msg,
            ctx,
            node_id,
            service_id,
            local,
        })
    }

    pub(crate) async fn send(self) -> BusResult<()> {
        if self.msg.is_event() {
            self.event_send().await;
            return Ok(());
        }

        if self.local {
            self.local_send();
            Ok(())
        } else {
            self.http_send().await
        }
    }

    /// Hands the message to the consumer of its service id, or to the
    /// unknown-message policy.
    pub(crate) fn local_send(self) {
        match self.bus.consumer(&self.service_id) {
            Some(consumer) => consumer(self.msg, self.ctx),
            None => self.bus.deal_with_unknown_message(self.msg),
        }
    }

    async fn http_send(self) -> BusResult<()> {
        let Some(node) = self.bus.destinations().node_info(&self.node_id) else {
            let error = TransportError::UnknownNode(self.node_id.clone()).to_error_code();
            return self.reply_error_if_needed(error);
        };

        let posted = self.bus.http_client().post(&node, &self.msg, &self.ctx).await;
        match posted {
            Ok(()) => Ok(()),
            Err(e) => self.reply_error_if_needed(e.to_error_code()),
        }
    }

    async fn event_send(self) {
        let bus = self.bus.clone();
        let local_node = bus.node_id().to_string();
        let event = self.msg.clone();
        let ctx = self.ctx.clone();
        self.local_send();

        let peers: Vec<_> = bus
            .destinations()
            .all_nodes()
            .into_iter()
            .filter(|node| node.uuid != local_node)
            .collect();
        if peers.is_empty() {
            return;
        }

        let client = bus.http_client();
        let posts = peers.iter().map(|node| client.post(node, &event, &ctx));
        for (node, result) in peers.iter().zip(join_all(posts).await) {
            if let Err(e) = result {
                warn!(node = %node.uuid, event = %event.describe(), error = %e, "failed to forward event");
            }
        }
    }

    /// Turns a delivery failure into what the sender expects.
    ///
    /// A tracked request gets an error reply through the local reply path.
    /// An untracked API message fails the call. Any other request gets an
    /// error reply that the reply path drops if nobody waits for it.
    fn reply_error_if_needed(self, error: ErrorCode) -> BusResult<()> {
        warn!(
            message = %self.msg.describe(),
            node = %self.node_id,
            error = %error,
            "failed to deliver message"
        );

        let tracked = self.bus.envelopes().is_pending(&self.msg.id);
        if self.msg.is_api() && !tracked {
            return Err(BusError::Operation(error));
        }

        if self.msg.is_need_reply() {
            let mut reply = if self.msg.is_api_sync_call() {
                Message::error_api_reply(error)
            } else {
                Message::error_reply(error)
            };
            reply.put_header(IS_REPLY, true);
            reply.put_header(CORRELATION_ID, self.msg.id.to_string());
            reply.service_id = Some(self.bus.service_id().to_string());
            debug!(request = %self.msg.describe(), "feeding error reply into local reply path");
            self.bus.accept_local_reply(reply, self.ctx);
        }
        Ok(())
    }
}
