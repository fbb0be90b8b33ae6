//! Envelope tracking: pending requests awaiting a reply or a timeout.
//!
//! Flow:
//! 1. `send` with a callback calls [`EnvelopeTracker::track`] before the
//!    request leaves
//! 2. The tracker arms a one-shot timeout on the scheduler
//! 3. The reply consumer calls [`EnvelopeTracker::resolve`] with the reply
//! 4. Whichever of reply and timeout wins the single-fire flag runs the
//!    callback; the other becomes a no-op
//!
//! The tracking entry is removed on the first resolution in both cases.

use crate::error::ErrorCode;
use crate::message::{Message, MessageId, CORRELATION_ID};
use crate::scheduler::{Scheduler, TimeoutHandle};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Receives the one reply of a tracked request.
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send + 'static>;

/// A pending request.
struct Envelope {
    request_id: MessageId,
    request: String,
    sync_api: bool,
    timeout: Duration,
    started_at: Instant,
    fired: AtomicBool,
    callback: Mutex<Option<ReplyCallback>>,
    timeout_handle: Mutex<Option<TimeoutHandle>>,
}

impl Envelope {
    /// Claims the single-fire flag. Only the first caller gets the callback.
    fn fire(&self) -> Option<ReplyCallback> {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.callback.lock().take()
    }

    fn arm(&self, handle: TimeoutHandle) {
        let mut slot = self.timeout_handle.lock();
        if self.fired.load(Ordering::Acquire) {
            drop(slot);
            handle.cancel();
        } else {
            *slot = Some(handle);
        }
    }

    fn disarm(&self) {
        let handle = self.timeout_handle.lock().take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    fn timeout_reply(&self) -> Message {
        let error = ErrorCode::timeout(format!(
            "message {} timed out after {}ms",
            self.request,
            self.timeout.as_millis()
        ));
        let mut reply = if self.sync_api {
            Message::error_api_reply(error)
        } else {
            Message::error_reply(error)
        };
        reply.put_header(CORRELATION_ID, self.request_id.to_string());
        reply
    }
}

/// Envelope counters.
#[derive(Debug, Default)]
pub struct EnvelopeStats {
    pub tracked: AtomicU64,
    pub acked: AtomicU64,
    pub timed_out: AtomicU64,
    /// Replies that found no envelope (late, duplicate, or untracked).
    pub dropped: AtomicU64,
}

/// Point-in-time copy of [`EnvelopeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvelopeStatsSnapshot {
    pub tracked: u64,
    pub acked: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub pending: usize,
}

/// Maps correlation ids to pending requests.
pub struct EnvelopeTracker {
    envelopes: Arc<DashMap<MessageId, Arc<Envelope>>>,
    scheduler: Arc<dyn Scheduler>,
    stats: Arc<EnvelopeStats>,
}

impl EnvelopeTracker {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            envelopes: Arc::new(DashMap::new()),
            scheduler,
            stats: Arc::new(EnvelopeStats::default()),
        }
    }

    /// Tracks `request` until its reply arrives or `timeout` elapses.
    ///
    /// `callback` runs exactly once, with the reply or with a timeout error
    /// reply.
    pub fn track(&self, request: &Message, timeout: Duration, callback: ReplyCallback) {
        let envelope = Arc::new(Envelope {
            request_id: request.id,
            request: request.describe(),
            sync_api: request.is_api_sync_call(),
            timeout,
            started_at: Instant::now(),
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
            timeout_handle: Mutex::new(None),
        });

        self.envelopes.insert(request.id, envelope.clone());
        self.stats.tracked.fetch_add(1, Ordering::Relaxed);

        let envelopes = self.envelopes.clone();
        let stats = self.stats.clone();
        let expiring = envelope.clone();
        let handle = self.scheduler.schedule_timeout(
            timeout,
            Box::new(move || {
                envelopes.remove_if(&expiring.request_id, |_, e| Arc::ptr_eq(e, &expiring));
                let Some(callback) = expiring.fire() else {
                    return;
                };
                stats.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request = %expiring.request,
                    timeout_ms = expiring.timeout.as_millis() as u64,
                    "request timed out"
                );
                callback(expiring.timeout_reply());
            }),
        );
        envelope.arm(handle);

        debug!(
            request = %envelope.request,
            timeout_ms = timeout.as_millis() as u64,
            "tracking request"
        );
    }

    /// Hands `reply` to the envelope named by its correlation id.
    ///
    /// Returns `false` when there is none; the reply is logged and dropped.
    pub fn resolve(&self, reply: Message) -> bool {
        let Some(correlation_id) = reply.correlation_id() else {
            warn!(reply = %reply.describe(), "reply without correlation id dropped");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let Some((_, envelope)) = self.envelopes.remove(&correlation_id) else {
            warn!(
                correlation_id = %correlation_id,
                reply = %reply.describe(),
                "no pending request for reply, it may have timed out; dropping it"
            );
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let Some(callback) = envelope.fire() else {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        envelope.disarm();
        self.stats.acked.fetch_add(1, Ordering::Relaxed);
        debug!(
            request = %envelope.request,
            elapsed_ms = envelope.started_at.elapsed().as_millis() as u64,
            "request acked"
        );
        callback(reply);
        true
    }

    pub fn is_pending(&self, request_id: &MessageId) -> bool {
        self.envelopes.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.envelopes.len()
    }

    /// Forgets `request_id` without running its callback.
    pub fn cancel(&self, request_id: &MessageId) -> bool {
        let Some((_, envelope)) = self.envelopes.remove(request_id) else {
            return false;
        };
        let cancelled = envelope.fire().is_some();
        envelope.disarm();
        cancelled
    }

    /// Drops every pending envelope without running its callback.
    ///
    /// Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<MessageId> = self.envelopes.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, envelope)) = self.envelopes.remove(&id) {
                if envelope.fire().is_some() {
                    cancelled += 1;
                }
                envelope.disarm();
            }
        }
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending requests");
        }
        cancelled
    }

    pub fn stats(&self) -> EnvelopeStatsSnapshot {
        EnvelopeStatsSnapshot {
            tracked: self.stats.tracked.load(Ordering::Relaxed),
            acked: self.stats.acked.load(Ordering::Relaxed),
            timed_out: self.stats.timed_out.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            pending: self.envelopes.len(),
        }
    }
}
