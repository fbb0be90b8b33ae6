//! The bus facade.
//!
//! [`CloudBus`] ties the pieces together:
//!
//! - services register under `<node>:::<name>` and receive messages through
//!   their endpoint consumer
//! - requests are stamped with `correlationId` / `replyTo` / `noReply`,
//!   tracked by the envelope tracker when the sender waits for a reply, and
//!   routed locally or over HTTP
//! - replies come back to this node's bus service and resolve the envelope
//! - events go to the event service of every node
//!
//! The bus is a cheap handle; clones share the same state.

use crate::config::BusConfig;
use crate::context::TraceContext;
use crate::destination::{DestinationResolver, StaticDestinationMaker};
use crate::endpoint::{Consumer, ConsumerTable, Service, ServiceRegistry};
use crate::envelope::{EnvelopeStatsSnapshot, EnvelopeTracker};
use crate::error::{BusError, BusResult, ErrorCode};
use crate::events::{EventListener, EventRegistry, EventSubscription};
use crate::interceptor::{
    BeforeDeliveryInterceptor, BeforePublishInterceptor, BeforeSendInterceptor, InterceptorRegistry, ReplyMarshaller,
};
use crate::message::{
    make_service_id, split_service_id, Message, Tag, API_EVENT_TYPE, CORRELATION_ID, IS_REPLY, NO_REPLY, REPLY_TO,
    SERVICE_ID_SPLITTER,
};
use crate::payload::PayloadRegistry;
use crate::router::MessageSender;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::schema;
use crate::timeout::TimeoutManager;
use crate::transport::{HttpClient, WireEnvelope};
use futures::stream::{self, StreamExt, TryStreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// Name of the service that receives replies on every node.
pub const BUS_SERVICE_NAME: &str = "cloudbus.messages";
/// Name of the service that receives events on every node.
pub const EVENT_SERVICE_NAME: &str = "cloudbus.events";

pub(crate) struct BusInner {
    config: BusConfig,
    service_id: String,
    event_service_id: String,
    scheduler: Arc<dyn Scheduler>,
    destinations: Arc<dyn DestinationResolver>,
    interceptors: InterceptorRegistry,
    envelopes: EnvelopeTracker,
    consumers: ConsumerTable,
    services: ServiceRegistry,
    events: EventRegistry,
    timeouts: TimeoutManager,
    payloads: PayloadRegistry,
    client: HttpClient,
    running: AtomicBool,
}

/// Handle to the message bus of one management node.
#[derive(Clone)]
pub struct CloudBus {
    pub(crate) inner: Arc<BusInner>,
}

impl std::fmt::Debug for CloudBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudBus")
            .field("node_id", &self.node_id())
            .field("running", &self.is_running())
            .field("services", &self.inner.services.ids())
            .finish()
    }
}

/// Builder for [`CloudBus`].
pub struct CloudBusBuilder {
    config: BusConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    destinations: Option<Arc<dyn DestinationResolver>>,
}

impl CloudBusBuilder {
    /// Uses `scheduler` instead of one on the current tokio runtime.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Uses `destinations` instead of a static table built from the peers.
    pub fn destinations(mut self, destinations: Arc<dyn DestinationResolver>) -> Self {
        self.destinations = Some(destinations);
        self
    }

    pub fn build(self) -> BusResult<CloudBus> {
        let config = self.config;
        config.validate().map_err(|e| BusError::Config(e.to_string()))?;

        let scheduler: Arc<dyn Scheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let destinations: Arc<dyn DestinationResolver> = match self.destinations {
            Some(destinations) => destinations,
            None => Arc::new(StaticDestinationMaker::new(
                std::iter::once(config.local_node()).chain(config.peers.iter().cloned()),
            )),
        };

        let client = HttpClient::new(&config)?;
        let inner = BusInner {
            service_id: make_service_id(&config.node_id, BUS_SERVICE_NAME),
            event_service_id: make_service_id(&config.node_id, EVENT_SERVICE_NAME),
            envelopes: EnvelopeTracker::new(scheduler.clone()),
            timeouts: TimeoutManager::from_config(&config.timeouts),
            scheduler,
            destinations,
            interceptors: InterceptorRegistry::new(),
            consumers: ConsumerTable::default(),
            services: ServiceRegistry::default(),
            events: EventRegistry::new(),
            payloads: PayloadRegistry::new(),
            client,
            running: AtomicBool::new(false),
            config,
        };

        Ok(CloudBus { inner: Arc::new(inner) })
    }
}

impl CloudBus {
    pub fn builder(config: BusConfig) -> CloudBusBuilder {
        CloudBusBuilder {
            config,
            scheduler: None,
            destinations: None,
        }
    }

    pub(crate) fn upgrade(weak: &Weak<BusInner>) -> Option<CloudBus> {
        weak.upgrade().map(|inner| CloudBus { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<BusInner> {
        Arc::downgrade(&self.inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Installs the reply and event consumers and activates every
    /// registered service.
    pub fn start(&self) -> BusResult<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let started = self
            .inner
            .consumers
            .on(&self.inner.service_id, self.reply_consumer())
            .and_then(|_| {
                self.inner
                    .consumers
                    .on(&self.inner.event_service_id, self.event_consumer())
            })
            .and_then(|_| self.inner.services.activate_all(&self.inner.consumers));

        if let Err(e) = started {
            self.inner.consumers.off(&self.inner.service_id);
            self.inner.consumers.off(&self.inner.event_service_id);
            self.inner.running.store(false, Ordering::Release);
            return Err(e);
        }

        info!(
            node_id = %self.node_id(),
            services = self.inner.services.ids().len(),
            "cloud bus started"
        );
        Ok(())
    }

    /// Stops accepting messages. Pending requests are dropped, so awaiting
    /// [`CloudBus::call`]s fail with [`BusError::NotRunning`].
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let cancelled = self.inner.envelopes.cancel_all();
        self.inner.consumers.off(&self.inner.service_id);
        self.inner.consumers.off(&self.inner.event_service_id);
        self.inner.services.deactivate_all(&self.inner.consumers);
        info!(node_id = %self.node_id(), cancelled, "cloud bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> BusResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BusError::NotRunning)
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn node_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Id of the service that receives replies on this node.
    pub fn service_id(&self) -> &str {
        &self.inner.service_id
    }

    pub fn event_service_id(&self) -> &str {
        &self.inner.event_service_id
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub fn interceptors(&self) -> &InterceptorRegistry {
        &self.inner.interceptors
    }

    /// Types the HTTP path can reconstruct in polymorphic fields.
    pub fn payloads(&self) -> &PayloadRegistry {
        &self.inner.payloads
    }

    pub fn timeouts(&self) -> &TimeoutManager {
        &self.inner.timeouts
    }

    pub fn envelope_stats(&self) -> EnvelopeStatsSnapshot {
        self.inner.envelopes.stats()
    }

    /// Ids of the registered services, sorted.
    pub fn service_ids(&self) -> Vec<String> {
        self.inner.services.ids()
    }

    pub fn should_log(&self, msg: &Message) -> bool {
        self.inner.config.message_log.should_log(msg)
    }

    pub(crate) fn destinations(&self) -> &Arc<dyn DestinationResolver> {
        &self.inner.destinations
    }

    pub(crate) fn http_client(&self) -> &HttpClient {
        &self.inner.client
    }

    pub(crate) fn envelopes(&self) -> &EnvelopeTracker {
        &self.inner.envelopes
    }

    pub(crate) fn consumer(&self, service_id: &str) -> Option<Consumer> {
        self.inner.consumers.get(service_id)
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Registers and activates `service`. Returns its resolved id.
    pub fn register_service(&self, service: Arc<dyn Service>) -> BusResult<String> {
        let service_id = self.resolve_service_id(service.id())?;
        if service_id == self.inner.service_id || service_id == self.inner.event_service_id {
            return Err(BusError::DuplicateService(service_id));
        }
        self.inner
            .services
            .register(service, service_id.clone(), self.downgrade(), &self.inner.consumers)?;
        Ok(service_id)
    }

    pub fn unregister_service(&self, id: &str) -> BusResult<bool> {
        let service_id = self.resolve_service_id(id)?;
        Ok(self.inner.services.unregister(&service_id, &self.inner.consumers))
    }

    pub fn activate_service(&self, id: &str) -> BusResult<()> {
        let service_id = self.resolve_service_id(id)?;
        self.inner.services.activate(&service_id, &self.inner.consumers)
    }

    pub fn deactivate_service(&self, id: &str) -> BusResult<()> {
        let service_id = self.resolve_service_id(id)?;
        self.inner.services.deactivate(&service_id, &self.inner.consumers)
    }

    pub fn is_service_active(&self, id: &str) -> bool {
        self.resolve_service_id(id)
            .map(|service_id| self.inner.services.is_active(&service_id))
            .unwrap_or(false)
    }

    fn resolve_service_id(&self, id: &str) -> BusResult<String> {
        match split_service_id(id) {
            (_, "") | (Some(""), _) => Err(BusError::MalformedServiceId(id.to_string())),
            (None, name) => Ok(self.make_local_service_id(name)),
            (Some(_), _) => Ok(id.to_string()),
        }
    }

    pub fn make_local_service_id(&self, name: &str) -> String {
        make_service_id(self.node_id(), name)
    }

    pub fn make_service_id_by_node(&self, name: &str, node_id: &str) -> String {
        make_service_id(node_id, name)
    }

    /// Service id of `name` on the node that owns `resource_uuid`.
    pub fn make_target_service_id_by_resource(&self, name: &str, resource_uuid: &str) -> BusResult<String> {
        if name.is_empty() || name.contains(SERVICE_ID_SPLITTER) {
            return Err(BusError::MalformedServiceId(name.to_string()));
        }
        let node_id = self.inner.destinations.node_for_resource(resource_uuid).ok_or_else(|| {
            BusError::Operation(ErrorCode::operation(format!(
                "no management node available for resource[uuid:{}]",
                resource_uuid
            )))
        })?;
        Ok(make_service_id(&node_id, name))
    }

    // ------------------------------------------------------------------
    // Interceptors
    // ------------------------------------------------------------------

    pub fn install_before_send_interceptor(&self, interceptor: Arc<dyn BeforeSendInterceptor>, tags: &[Tag]) {
        self.inner.interceptors.install_before_send(interceptor, tags);
    }

    pub fn install_before_delivery_interceptor(&self, interceptor: Arc<dyn BeforeDeliveryInterceptor>, tags: &[Tag]) {
        self.inner.interceptors.install_before_delivery(interceptor, tags);
    }

    pub fn install_before_publish_interceptor(&self, interceptor: Arc<dyn BeforePublishInterceptor>, tags: &[Tag]) {
        self.inner.interceptors.install_before_publish(interceptor, tags);
    }

    pub fn register_reply_marshaller(&self, marshaller: Arc<dyn ReplyMarshaller>, tags: &[Tag]) -> BusResult<()> {
        self.inner.interceptors.install_reply_marshaller(marshaller, tags)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Fire-and-forget. A request sent this way is marked `noReply`, so its
    /// handler's reply is dropped.
    pub async fn send(&self, mut msg: Message) -> BusResult<()> {
        self.ensure_running()?;
        self.inner.timeouts.evaluate(&mut msg);
        self.send_message(msg, true).await
    }

    /// Sends a request and runs `callback` exactly once with its reply, or
    /// with a timeout error reply.
    pub async fn send_with_callback<F>(&self, mut msg: Message, callback: F) -> BusResult<()>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        self.ensure_running()?;
        if !msg.is_need_reply() {
            return Err(BusError::InvalidArgument(format!(
                "{} does not expect a reply",
                msg.describe()
            )));
        }
        if msg.service_id.is_none() {
            return Err(BusError::MissingServiceId(msg.describe()));
        }

        let timeout = self
            .inner
            .timeouts
            .evaluate(&mut msg)
            .unwrap_or_else(|| self.inner.timeouts.default_timeout());
        let request_id = msg.id;
        self.inner.envelopes.track(&msg, timeout, Box::new(callback));

        if let Err(e) = self.send_message(msg, false).await {
            self.inner.envelopes.cancel(&request_id);
            return Err(e);
        }
        Ok(())
    }

    /// Sends a request and waits for its reply.
    ///
    /// Failures of the handler, unknown targets and timeouts arrive as an
    /// `Ok` reply carrying the error.
    pub async fn call(&self, msg: Message) -> BusResult<Message> {
        let (tx, rx) = oneshot::channel();
        self.send_with_callback(msg, move |reply| {
            let _ = tx.send(reply);
        })
        .await?;
        rx.await.map_err(|_| BusError::NotRunning)
    }

    /// Calls every message, at most `parallel_level` at a time. Replies come
    /// back in request order.
    pub async fn send_all(&self, msgs: Vec<Message>, parallel_level: usize) -> BusResult<Vec<Message>> {
        if msgs.is_empty() {
            return Err(BusError::InvalidArgument("cannot send an empty message list".into()));
        }
        stream::iter(msgs.into_iter().map(|msg| self.call(msg)))
            .buffered(parallel_level.max(1))
            .try_collect()
            .await
    }

    /// Calls every message in parallel.
    pub async fn call_all(&self, msgs: Vec<Message>) -> BusResult<Vec<Message>> {
        let level = msgs.len();
        self.send_all(msgs, level).await
    }

    /// Like [`CloudBus::send_all`], but hands each `(request, reply)` pair to
    /// `step` as soon as it completes.
    pub async fn send_stepping<F>(&self, msgs: Vec<Message>, parallel_level: usize, mut step: F) -> BusResult<()>
    where
        F: FnMut(&Message, Message),
    {
        if msgs.is_empty() {
            return Err(BusError::InvalidArgument("cannot send an empty message list".into()));
        }
        let mut replies = stream::iter(msgs.into_iter().map(|msg| {
            let request = msg.clone();
            async move { self.call(msg).await.map(|reply| (request, reply)) }
        }))
        .buffer_unordered(parallel_level.max(1));

        while let Some(result) = replies.next().await {
            let (request, reply) = result?;
            step(&request, reply);
        }
        Ok(())
    }

    /// Forwards `msg` unchanged, keeping the headers of its original sender.
    pub async fn route(&self, mut msg: Message) -> BusResult<()> {
        self.ensure_running()?;
        if msg.service_id.is_none() {
            return Err(BusError::MissingServiceId(msg.describe()));
        }
        self.inner.timeouts.evaluate(&mut msg);
        self.inner.interceptors.run_before_send(&mut msg);
        self.do_send(msg).await
    }

    pub async fn route_all(&self, msgs: Vec<Message>) -> BusResult<()> {
        for msg in msgs {
            self.route(msg).await?;
        }
        Ok(())
    }

    /// Sends an API message; `on_event` runs with the API event that answers
    /// it. The returned subscription can be used to stop waiting.
    pub async fn send_api<F>(&self, msg: Message, on_event: F) -> BusResult<EventSubscription>
    where
        F: FnOnce(Message) + Send + 'static,
    {
        if !msg.is_api() || msg.is_api_sync_call() {
            return Err(BusError::InvalidArgument(format!(
                "{} is not an asynchronous API message",
                msg.describe()
            )));
        }

        let api_id = msg.id;
        let pending = Mutex::new(Some(on_event));
        let listener = move |evt: &Message| {
            if evt.api_id() != Some(api_id) {
                return false;
            }
            if let Some(on_event) = pending.lock().take() {
                on_event(evt.clone());
            }
            true
        };
        let subscription = self.subscribe_event(Arc::new(listener), &[API_EVENT_TYPE]);

        if let Err(e) = self.send(msg).await {
            subscription.unsubscribe_all();
            return Err(e);
        }
        Ok(subscription)
    }

    /// Sends an API message and waits for its API event. Gives up with a
    /// timeout error event after the message's timeout.
    pub async fn call_api(&self, mut msg: Message) -> BusResult<Message> {
        let timeout = self
            .inner
            .timeouts
            .evaluate(&mut msg)
            .unwrap_or_else(|| self.inner.timeouts.default_timeout());
        let api_id = msg.id;
        let described = msg.describe();

        let (tx, rx) = oneshot::channel();
        let subscription = self
            .send_api(msg, move |evt| {
                let _ = tx.send(evt);
            })
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(evt)) => Ok(evt),
            Ok(Err(_)) => Err(BusError::NotRunning),
            Err(_) => {
                subscription.unsubscribe_all();
                Ok(Message::error_api_event(
                    api_id,
                    ErrorCode::timeout(format!("{} timed out after {}ms", described, timeout.as_millis())),
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Replies and events
    // ------------------------------------------------------------------

    /// Answers `request`. Dropped when the sender asked for no reply.
    pub async fn reply(&self, request: &Message, mut reply: Message) -> BusResult<()> {
        if request.no_reply() {
            trace!(request = %request.describe(), "sender asked for no reply, dropping it");
            return Ok(());
        }
        let reply_to = request.reply_to().ok_or_else(|| {
            BusError::InvalidArgument(format!("{} has no {} header", request.describe(), REPLY_TO))
        })?;

        reply.put_header(IS_REPLY, true);
        reply.put_header(CORRELATION_ID, request.id.to_string());
        reply.service_id = Some(reply_to.to_string());
        self.inner.interceptors.run_reply_marshallers(&mut reply, Some(request));
        self.do_send(reply).await
    }

    /// Publishes an event to the listeners of every node.
    pub async fn publish(&self, mut event: Message) -> BusResult<()> {
        self.ensure_running()?;
        if !event.is_event() {
            return Err(BusError::InvalidArgument(format!("{} is not an event", event.describe())));
        }

        self.inner.interceptors.run_reply_marshallers(&mut event, None);
        if let Err(stop) = self.inner.interceptors.run_before_publish(&mut event) {
            trace!(event = %event.describe(), reason = %stop.reason, "publish stopped by interceptor");
            return Ok(());
        }
        self.do_send(event).await
    }

    pub async fn publish_all(&self, events: Vec<Message>) -> BusResult<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }

    /// Subscribes to events by type name, or [`API_EVENT_TYPE`] for API
    /// events. The listener returns `true` to unsubscribe.
    pub fn subscribe_event(&self, listener: Arc<dyn EventListener>, keys: &[&str]) -> EventSubscription {
        self.inner.events.subscribe(listener, keys)
    }

    /// Reports a handler failure to the sender in the form it expects.
    pub async fn reply_error_by_message_type(&self, msg: &Message, error: ErrorCode) -> BusResult<()> {
        if msg.is_api_sync_call() {
            self.reply(msg, Message::error_api_reply(error)).await
        } else if msg.is_api() {
            self.publish(Message::error_api_event(msg.id, error)).await
        } else if msg.is_need_reply() {
            self.reply(msg, Message::error_reply(error)).await
        } else {
            warn!(
                message = %msg.describe(),
                error = %error,
                "error happened when handling a message nobody waits for, dump: {}",
                msg.dump()
            );
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn stamp(&self, msg: &mut Message, no_reply: bool) {
        let id = msg.id.to_string();
        msg.put_header(CORRELATION_ID, id);
        msg.put_header(REPLY_TO, self.inner.service_id.clone());
        if msg.is_api() {
            msg.put_header(NO_REPLY, false);
        } else if msg.is_need_reply() {
            msg.put_header(NO_REPLY, no_reply);
        }
    }

    async fn send_message(&self, mut msg: Message, no_reply: bool) -> BusResult<()> {
        if !msg.is_event() {
            self.stamp(&mut msg, no_reply);
        }
        self.inner.interceptors.run_before_send(&mut msg);
        self.do_send(msg).await
    }

    async fn do_send(&self, msg: Message) -> BusResult<()> {
        let ctx = TraceContext::current();
        if self.should_log(&msg) {
            trace!(service_id = ?msg.service_id, "[msg send]: {}", msg.dump());
        }
        MessageSender::new(self, msg, ctx)?.send().await
    }

    fn reply_consumer(&self) -> Consumer {
        let bus = self.downgrade();
        Arc::new(move |msg: Message, ctx: TraceContext| {
            if let Some(bus) = CloudBus::upgrade(&bus) {
                bus.accept_local_reply(msg, ctx);
            }
        })
    }

    fn event_consumer(&self) -> Consumer {
        let bus = self.downgrade();
        Arc::new(move |event: Message, ctx: TraceContext| {
            let Some(bus) = CloudBus::upgrade(&bus) else {
                return;
            };
            let scheduler = bus.scheduler().clone();
            let task = ctx.scope(async move {
                if bus.should_log(&event) {
                    trace!("[event received]: {}", event.dump());
                }
                let listeners = bus.inner.events.dispatch(&event);
                debug!(event = %event.describe(), listeners, "event dispatched");
            });
            scheduler.submit(task.boxed());
        })
    }

    /// Entry of replies into this node: resolves the pending envelope.
    pub(crate) fn accept_local_reply(&self, mut msg: Message, ctx: TraceContext) {
        if !msg.is_reply() && !msg.is_marked_reply() {
            self.deal_with_unknown_message(msg);
            return;
        }
        if self.should_log(&msg) {
            trace!("[msg received]: {}", msg.dump());
        }

        let bus = self.clone();
        let task = ctx.scope(async move {
            bus.inner.interceptors.run_before_delivery(&mut msg);
            bus.inner.envelopes.resolve(msg);
        });
        self.scheduler().submit(task.boxed());
    }

    /// No consumer for the message. Requests get an unknown-message error
    /// reply or API event; anything else is only logged.
    pub(crate) fn deal_with_unknown_message(&self, msg: Message) {
        warn!(
            message = %msg.describe(),
            service_id = ?msg.service_id,
            "no service deals with the message, dump: {}\n{}",
            msg.dump(),
            Backtrace::force_capture()
        );
        if !msg.is_need_reply() {
            return;
        }

        let error = ErrorCode::unknown_message(format!(
            "no service deals with message: {}",
            msg.dump()
        ));
        let bus = self.clone();
        let task = async move {
            if let Err(e) = bus.reply_error_by_message_type(&msg, error).await {
                warn!(message = %msg.describe(), error = %e, "failed to report unknown message");
            }
        };
        self.scheduler().submit(task.boxed());
    }

    /// Entry of messages posted by peers.
    pub fn accept_wire(&self, body: &[u8]) -> BusResult<()> {
        self.ensure_running()?;
        let WireEnvelope { mut message, trace } = serde_json::from_slice(body)?;
        schema::restore(&mut message, &self.inner.payloads)?;
        schema::strip(&mut message);
        MessageSender::new(self, message, trace)?.local_send();
        Ok(())
    }
}
