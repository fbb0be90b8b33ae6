//! Task scheduling used by the bus.
//!
//! The bus never spawns directly; it goes through a [`Scheduler`] so that
//! embedders can plug in their own pool. [`TokioScheduler`] is the default.

use crate::error::BusError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::trace;

/// Unit of work submitted to a scheduler.
pub type Task = BoxFuture<'static, ()>;

/// One-shot callback fired by [`Scheduler::schedule_timeout`].
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Task scheduling collaborator.
pub trait Scheduler: Send + Sync {
    /// Runs `task` with no ordering constraint.
    fn submit(&self, task: Task);

    /// Runs `task` with at most `level` tasks sharing `signature` running at
    /// once. Waiting tasks start in submission order.
    fn sync_submit(&self, signature: &str, level: usize, task: Task);

    /// Fires `callback` after `delay` unless the returned handle is cancelled
    /// first.
    fn schedule_timeout(&self, delay: Duration, callback: TimeoutCallback) -> TimeoutHandle;
}

/// Cancellation handle of a scheduled timeout.
pub struct TimeoutHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimeoutHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Handle with nothing to cancel.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Best effort: a callback that already started still runs to completion.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Scheduler backed by a tokio runtime.
///
/// Sync groups are one fair [`Semaphore`] per signature. The permit count is
/// fixed by the first submission for a signature.
pub struct TokioScheduler {
    handle: Handle,
    sync_groups: DashMap<String, Arc<Semaphore>>,
}

impl TokioScheduler {
    /// Scheduler on the runtime the caller runs in.
    pub fn current() -> Result<Self, BusError> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| BusError::Config(format!("no tokio runtime available: {}", e)))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            sync_groups: DashMap::new(),
        }
    }

    /// Number of signatures that have been used with `sync_submit`.
    pub fn sync_group_count(&self) -> usize {
        self.sync_groups.len()
    }

    fn group(&self, signature: &str, level: usize) -> Arc<Semaphore> {
        if let Some(sem) = self.sync_groups.get(signature) {
            return sem.clone();
        }
        self.sync_groups
            .entry(signature.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(level.max(1))))
            .clone()
    }
}

impl Scheduler for TokioScheduler {
    fn submit(&self, task: Task) {
        self.handle.spawn(task);
    }

    fn sync_submit(&self, signature: &str, level: usize, task: Task) {
        let group = self.group(signature, level);
        let signature = signature.to_string();
        self.handle.spawn(async move {
            // Closed only if the scheduler is torn down; drop the task then.
            let Ok(_permit) = group.acquire_owned().await else {
                trace!(signature = %signature, "sync group closed, dropping task");
                return;
            };
            task.await;
        });
    }

    fn schedule_timeout(&self, delay: Duration, callback: TimeoutCallback) -> TimeoutHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        let abort = join.abort_handle();
        TimeoutHandle::new(move || abort.abort())
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("sync_groups", &self.sync_groups.len())
            .finish()
    }
}
