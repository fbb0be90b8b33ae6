//! Task context propagation.
//!
//! Each delivery runs inside a [`TraceContext`] scope. When the handler sends
//! further messages, the bus captures the current context and carries it
//! beside the message (in-process, or in the HTTP wire envelope) so the
//! receiving handler logs under the same API id and task stack.

use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// Serializable logging context of a logical task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// Id of the API call this work originates from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id: Option<String>,
    /// Name of the task, usually the API message type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entries: BTreeMap<String, String>,
    /// Nested task names, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_stack: Vec<String>,
}

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context of the running task, or an empty one outside any scope.
    pub fn current() -> Self {
        CURRENT.try_with(Clone::clone).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.api_id.is_none() && self.task_name.is_none() && self.entries.is_empty() && self.task_stack.is_empty()
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn push_task(&mut self, name: impl Into<String>) {
        self.task_stack.push(name.into());
    }

    /// Context a handler of `msg` runs under.
    ///
    /// API calls start a fresh context named after the call; everything else
    /// inherits what the sender carried. The task stack always carries over.
    pub fn for_delivery(msg: &Message, carried: TraceContext) -> Self {
        if msg.is_api() {
            TraceContext {
                api_id: Some(msg.id.to_string()),
                task_name: Some(msg.type_name.clone()),
                entries: BTreeMap::new(),
                task_stack: carried.task_stack,
            }
        } else {
            carried
        }
    }

    /// Runs `fut` with `self` as the current context.
    pub fn scope<F: Future>(self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self, fut)
    }

    /// Span wrapping one delivery.
    pub fn span(&self, msg: &Message, service_id: &str) -> tracing::Span {
        tracing::info_span!(
            "bus.deliver",
            service_id = %service_id,
            message_id = %msg.id,
            message_type = %msg.type_name,
            api_id = self.api_id.as_deref().unwrap_or(""),
            task = self.task_name.as_deref().unwrap_or(""),
        )
    }
}
