//! Services, endpoints and the consumer table.
//!
//! The consumer table maps a fully qualified service id to the function that
//! accepts messages for it. A registered [`Service`] gets an [`EndPoint`]
//! whose consumer runs each delivery as a scheduler task, mutually exclusive
//! per service id when the service declares a sync level.

use crate::bus::{BusInner, CloudBus};
use crate::context::TraceContext;
use crate::error::{BusError, BusResult, ErrorCode, HandlerError};
use crate::message::Message;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn, Instrument};

/// A message handler registered on the bus.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service id, either a bare name (`host`) or `<node>:::<name>`.
    fn id(&self) -> &str;

    /// 0: deliveries run concurrently. N > 0: at most N run at once.
    fn sync_level(&self) -> usize {
        0
    }

    /// Handles one message. Reply with [`CloudBus::reply`] for requests.
    ///
    /// An `Err` is turned into an error reply or API event for the sender.
    async fn handle_message(&self, msg: &Message, bus: &CloudBus) -> Result<(), HandlerError>;
}

/// Accepts a message and the context its sender ran under.
pub(crate) type Consumer = Arc<dyn Fn(Message, TraceContext) + Send + Sync>;

/// Service id -> consumer.
#[derive(Default)]
pub(crate) struct ConsumerTable {
    consumers: DashMap<String, Consumer>,
}

impl ConsumerTable {
    pub(crate) fn on(&self, service_id: &str, consumer: Consumer) -> BusResult<()> {
        match self.consumers.entry(service_id.to_string()) {
            Entry::Occupied(existing) if !Arc::ptr_eq(existing.get(), &consumer) => {
                Err(BusError::DuplicateConsumer(service_id.to_string()))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(consumer);
                Ok(())
            }
        }
    }

    pub(crate) fn off(&self, service_id: &str) -> bool {
        self.consumers.remove(service_id).is_some()
    }

    pub(crate) fn get(&self, service_id: &str) -> Option<Consumer> {
        self.consumers.get(service_id).map(|c| Arc::clone(c.value()))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, service_id: &str) -> bool {
        self.consumers.contains_key(service_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.consumers.len()
    }
}

/// Delivery lifecycle of one service.
pub(crate) struct EndPoint {
    service_id: String,
    consumer: Consumer,
    active: Mutex<bool>,
}

impl EndPoint {
    /// Installs the consumer. Calling it again while active does nothing.
    pub(crate) fn active(&self, table: &ConsumerTable) -> BusResult<()> {
        let mut active = self.active.lock();
        if !*active {
            table.on(&self.service_id, self.consumer.clone())?;
            *active = true;
        }
        Ok(())
    }

    pub(crate) fn inactive(&self, table: &ConsumerTable) {
        let mut active = self.active.lock();
        if *active {
            table.off(&self.service_id);
            *active = false;
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        *self.active.lock()
    }
}

/// Registered services by resolved id.
#[derive(Default)]
pub(crate) struct ServiceRegistry {
    endpoints: DashMap<String, Arc<EndPoint>>,
}

impl ServiceRegistry {
    /// Adds and activates an endpoint. Rejects a taken id before anything
    /// becomes routable.
    pub(crate) fn register(
        &self,
        service: Arc<dyn Service>,
        service_id: String,
        bus: Weak<BusInner>,
        table: &ConsumerTable,
    ) -> BusResult<()> {
        let endpoint = match self.endpoints.entry(service_id.clone()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateService(service_id)),
            Entry::Vacant(slot) => {
                let endpoint = Arc::new(EndPoint {
                    consumer: endpoint_consumer(service, service_id.clone(), bus),
                    service_id: service_id.clone(),
                    active: Mutex::new(false),
                });
                slot.insert(endpoint.clone());
                endpoint
            }
        };

        if let Err(e) = endpoint.active(table) {
            self.endpoints.remove(&service_id);
            return Err(e);
        }
        debug!(service_id = %service_id, "registered service");
        Ok(())
    }

    pub(crate) fn unregister(&self, service_id: &str, table: &ConsumerTable) -> bool {
        match self.endpoints.remove(service_id) {
            Some((_, endpoint)) => {
                endpoint.inactive(table);
                debug!(service_id = %service_id, "unregistered service");
                true
            }
            None => false,
        }
    }

    pub(crate) fn activate(&self, service_id: &str, table: &ConsumerTable) -> BusResult<()> {
        let endpoint = self
            .endpoints
            .get(service_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BusError::ServiceNotFound(service_id.to_string()))?;
        endpoint.active(table)
    }

    pub(crate) fn deactivate(&self, service_id: &str, table: &ConsumerTable) -> BusResult<()> {
        let endpoint = self
            .endpoints
            .get(service_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BusError::ServiceNotFound(service_id.to_string()))?;
        endpoint.inactive(table);
        Ok(())
    }

    pub(crate) fn is_active(&self, service_id: &str) -> bool {
        self.endpoints.get(service_id).is_some_and(|e| e.is_active())
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn snapshot(&self) -> Vec<Arc<EndPoint>> {
        self.endpoints.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub(crate) fn activate_all(&self, table: &ConsumerTable) -> BusResult<()> {
        for endpoint in self.snapshot() {
            endpoint.active(table)?;
        }
        Ok(())
    }

    pub(crate) fn deactivate_all(&self, table: &ConsumerTable) {
        for endpoint in self.snapshot() {
            endpoint.inactive(table);
        }
    }
}

fn endpoint_consumer(service: Arc<dyn Service>, service_id: String, bus: Weak<BusInner>) -> Consumer {
    Arc::new(move |mut msg: Message, carried: TraceContext| {
        let Some(bus) = CloudBus::upgrade(&bus) else {
            warn!(service_id = %service_id, message = %msg.describe(), "bus is gone, dropping message");
            return;
        };

        // Inline on the delivery path, outside the sync-level section.
        bus.interceptors().run_before_delivery(&mut msg);

        if bus.should_log(&msg) {
            trace!(service_id = %service_id, "[msg received]: {}", msg.dump());
        }

        let ctx = TraceContext::for_delivery(&msg, carried);
        let span = ctx.span(&msg, &service_id);
        let level = service.sync_level();
        let task = ctx
            .scope(dispatch(bus.clone(), service.clone(), msg))
            .instrument(span)
            .boxed();

        if level == 0 {
            bus.scheduler().submit(task);
        } else {
            bus.scheduler().sync_submit(&service_id, level, task);
        }
    })
}

/// Runs one delivery. Never fails: handler errors and panics become error
/// replies or API events.
async fn dispatch(bus: CloudBus, service: Arc<dyn Service>, msg: Message) {
    let outcome = AssertUnwindSafe(service.handle_message(&msg, &bus))
        .catch_unwind()
        .await;

    let error = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(HandlerError::Operation(code))) => code,
        Ok(Err(HandlerError::Unexpected(e))) => {
            warn!(
                error = %format!("{:#}", e),
                "unhandled error happened when dealing with message {}, dump: {}",
                msg.describe(),
                msg.dump()
            );
            ErrorCode::internal(format!("{:#}", e))
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            warn!(
                panic = %reason,
                "handler panicked when dealing with message {}, dump: {}",
                msg.describe(),
                msg.dump()
            );
            ErrorCode::internal(reason)
        }
    };

    if let Err(e) = bus.reply_error_by_message_type(&msg, error).await {
        warn!(message = %msg.describe(), error = %e, "failed to report handler error");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
