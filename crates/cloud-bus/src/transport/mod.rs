//! HTTP transport between management nodes.
//!
//! Every node serves `POST <context>/cloudbus`. The body is a [`WireEnvelope`]:
//! the message (with its `schema` header) plus the sender's trace context.

mod client;
mod server;

pub use client::HttpClient;
pub use server::{router, serve};

use crate::context::TraceContext;
use crate::error::ErrorCode;
use crate::message::Message;
use serde::{Deserialize, Serialize};

/// HTTP request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub message: Message,
    #[serde(default)]
    pub trace: TraceContext,
}

/// Transport failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or no response came back.
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The peer answered with a non-2xx status.
    #[error("HTTP ERROR, status code: {status}, body: {body}")]
    Status { status: u16, body: String },

    #[error("unknown management node[uuid:{0}]")]
    UnknownNode(String),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("http server error: {0}")]
    Server(#[from] std::io::Error),
}

impl TransportError {
    /// Failures worth another attempt: I/O level errors and 4xx answers.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Request { .. } => true,
            TransportError::Status { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Error reported to the sender once retries are exhausted.
    pub fn to_error_code(&self) -> ErrorCode {
        let cause = match self {
            TransportError::Request { .. } | TransportError::Status { .. } => ErrorCode::http(self.to_string()),
            _ => ErrorCode::internal(self.to_string()),
        };
        ErrorCode::operation(self.to_string()).with_cause(cause)
    }
}
