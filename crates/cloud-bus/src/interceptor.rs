//! Interceptor chains.
//!
//! Interceptors are registered against [`Tag`]s (a concrete type name or a
//! message kind) or as wildcards. For a given message, the chains of all the
//! tags it carries are merged and run in priority order, then the wildcard
//! chain runs.
//!
//! Chains are copy-on-write: installing takes the per-tag slot lock and swaps
//! in a new list, dispatch clones an `Arc` and iterates without locking.

use crate::error::{BusError, BusResult};
use crate::message::{Message, Tag};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Raised by a before-publish interceptor to drop an event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("stop routing: {reason}")]
pub struct StopRouting {
    pub reason: String,
}

impl StopRouting {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Runs before a message leaves `send`/`route`.
pub trait BeforeSendInterceptor: Send + Sync {
    /// Lower values run first.
    fn order(&self) -> i32 {
        0
    }

    fn before_send(&self, msg: &mut Message);
}

/// Runs before a message reaches its handler or a reply reaches its callback.
pub trait BeforeDeliveryInterceptor: Send + Sync {
    fn order(&self) -> i32 {
        0
    }

    fn before_delivery(&self, msg: &mut Message);
}

/// Runs before an event is published. May veto the publish.
pub trait BeforePublishInterceptor: Send + Sync {
    fn order(&self) -> i32 {
        0
    }

    fn before_publish(&self, event: &mut Message) -> Result<(), StopRouting>;
}

/// Adjusts replies and API events right before they are sent.
///
/// `request` is the message being answered; it is `None` on the publish path.
pub trait ReplyMarshaller: Send + Sync {
    fn order(&self) -> i32 {
        0
    }

    fn marshal(&self, reply: &mut Message, request: Option<&Message>);
}

struct Entry<I: ?Sized> {
    interceptor: Arc<I>,
    order: i32,
    /// Install sequence, shared by every tag of one install call.
    seq: u64,
}

impl<I: ?Sized> Clone for Entry<I> {
    fn clone(&self) -> Self {
        Self {
            interceptor: self.interceptor.clone(),
            order: self.order,
            seq: self.seq,
        }
    }
}

type Chain<I> = Arc<Vec<Entry<I>>>;

/// Ascending `order`. A new entry goes in front of existing entries with the
/// same order.
fn insert_ordered<I: ?Sized>(chain: &Chain<I>, entry: Entry<I>) -> Chain<I> {
    let mut next = Vec::with_capacity(chain.len() + 1);
    next.extend(chain.iter().cloned());
    let pos = next.partition_point(|e| e.order < entry.order);
    next.insert(pos, entry);
    Arc::new(next)
}

/// Ordered interceptor lists keyed by tag, plus a wildcard list.
///
/// Every list is kept sorted by ascending `order`, lowest first, whatever the
/// install sequence was. Among equal orders the latest install runs first.
pub struct InterceptorChain<I: ?Sized> {
    by_tag: DashMap<Tag, Chain<I>>,
    wildcard: RwLock<Chain<I>>,
    seq: AtomicU64,
}

impl<I: ?Sized> Default for InterceptorChain<I> {
    fn default() -> Self {
        Self {
            by_tag: DashMap::new(),
            wildcard: RwLock::new(Arc::new(Vec::new())),
            seq: AtomicU64::new(0),
        }
    }
}

impl<I: ?Sized> InterceptorChain<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs for every tag in `tags`, or as a wildcard when empty.
    pub fn install(&self, interceptor: Arc<I>, order: i32, tags: &[Tag]) {
        let entry = Entry {
            interceptor,
            order,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        if tags.is_empty() {
            let mut wildcard = self.wildcard.write();
            *wildcard = insert_ordered(&wildcard, entry);
            return;
        }

        let mut seen: Vec<&Tag> = Vec::with_capacity(tags.len());
        for tag in tags {
            if seen.contains(&tag) {
                continue;
            }
            seen.push(tag);
            let mut slot = self.by_tag.entry(tag.clone()).or_default();
            *slot = insert_ordered(&slot, entry.clone());
        }
    }

    /// Interceptors that apply to a message carrying `tags`, in run order.
    pub fn resolve(&self, tags: &[Tag]) -> Vec<Arc<I>> {
        let mut merged: Vec<Entry<I>> = Vec::new();
        for tag in tags {
            let Some(chain) = self.by_tag.get(tag).map(|c| Arc::clone(c.value())) else {
                continue;
            };
            for entry in chain.iter() {
                if !merged.iter().any(|m| m.seq == entry.seq) {
                    merged.push(entry.clone());
                }
            }
        }
        merged.sort_by(|a, b| a.order.cmp(&b.order).then(b.seq.cmp(&a.seq)));

        let wildcard = self.wildcard.read().clone();
        merged
            .into_iter()
            .chain(wildcard.iter().cloned())
            .map(|e| e.interceptor)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty() && self.wildcard.read().is_empty()
    }
}

/// The four interceptor chains of a bus.
#[derive(Default)]
pub struct InterceptorRegistry {
    before_send: InterceptorChain<dyn BeforeSendInterceptor>,
    before_delivery: InterceptorChain<dyn BeforeDeliveryInterceptor>,
    before_publish: InterceptorChain<dyn BeforePublishInterceptor>,
    reply_marshallers: InterceptorChain<dyn ReplyMarshaller>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_before_send(&self, interceptor: Arc<dyn BeforeSendInterceptor>, tags: &[Tag]) {
        let order = interceptor.order();
        self.before_send.install(interceptor, order, tags);
    }

    pub fn install_before_delivery(&self, interceptor: Arc<dyn BeforeDeliveryInterceptor>, tags: &[Tag]) {
        let order = interceptor.order();
        self.before_delivery.install(interceptor, order, tags);
    }

    pub fn install_before_publish(&self, interceptor: Arc<dyn BeforePublishInterceptor>, tags: &[Tag]) {
        let order = interceptor.order();
        self.before_publish.install(interceptor, order, tags);
    }

    /// Marshallers only apply to replies and API events. A marshaller with no
    /// tags is ignored.
    pub fn install_reply_marshaller(&self, marshaller: Arc<dyn ReplyMarshaller>, tags: &[Tag]) -> BusResult<()> {
        if tags.is_empty() {
            warn!("reply marshaller installed without any tag, ignoring it");
            return Ok(());
        }

        if let Some(bad) = tags.iter().find(|t| matches!(t, Tag::Kind(k) if !k.is_reply_like())) {
            return Err(BusError::Config(format!(
                "reply marshallers can only target replies or API events, {:?} is neither",
                bad
            )));
        }

        let order = marshaller.order();
        self.reply_marshallers.install(marshaller, order, tags);
        Ok(())
    }

    pub fn run_before_send(&self, msg: &mut Message) {
        for interceptor in self.before_send.resolve(&msg.tags()) {
            interceptor.before_send(msg);
        }
    }

    pub fn run_before_delivery(&self, msg: &mut Message) {
        for interceptor in self.before_delivery.resolve(&msg.tags()) {
            interceptor.before_delivery(msg);
        }
    }

    pub fn run_before_publish(&self, event: &mut Message) -> Result<(), StopRouting> {
        for interceptor in self.before_publish.resolve(&event.tags()) {
            if let Err(stop) = interceptor.before_publish(event) {
                trace!(event = %event.describe(), reason = %stop.reason, "before-publish interceptor stopped the event");
                return Err(stop);
            }
        }
        Ok(())
    }

    pub fn run_reply_marshallers(&self, reply: &mut Message, request: Option<&Message>) {
        for marshaller in self.reply_marshallers.resolve(&reply.tags()) {
            marshaller.marshal(reply, request);
        }
    }
}
