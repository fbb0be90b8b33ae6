//! Outbound HTTP delivery.

use super::{TransportError, WireEnvelope};
use crate::config::BusConfig;
use crate::context::TraceContext;
use crate::destination::ManagementNode;
use crate::message::Message;
use crate::retry::{self, RetryPolicy};
use crate::schema;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::debug;

/// Posts messages to peer nodes.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    config: BusConfig,
    policy: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: &BusConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.http.request_timeout)
            .connect_timeout(config.http.connect_timeout)
            .build()
            .map_err(|source| TransportError::Request {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            client,
            config: config.clone(),
            policy: RetryPolicy::new(config.http.retry_times, config.http.retry_interval),
        })
    }

    pub fn url_for(&self, node: &ManagementNode) -> String {
        self.config.url_for(node)
    }

    /// Delivers `msg` to `node`, retrying transient failures.
    ///
    /// The message goes out with a `schema` header describing its
    /// polymorphic fields.
    pub async fn post(&self, node: &ManagementNode, msg: &Message, trace: &TraceContext) -> Result<(), TransportError> {
        let url = self.url_for(node);
        let mut message = msg.clone();
        schema::attach(&mut message);
        let body = serde_json::to_vec(&WireEnvelope {
            message,
            trace: trace.clone(),
        })
        .map_err(TransportError::Encode)?;

        let url = url.as_str();
        let body = body.as_slice();
        retry::run(self.policy, TransportError::is_transient, move || async move {
            let response = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec())
                .send()
                .await
                .map_err(|source| TransportError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(())
        })
        .await?;

        debug!(node = %node.uuid, url = %url, message = %msg.describe(), "delivered over http");
        Ok(())
    }
}
