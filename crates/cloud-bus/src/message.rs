//! Message model.
//!
//! A [`Message`] is a closed, tagged variant: the [`MessageKind`] discriminator
//! says whether it is a one-way command, a request expecting a reply, an API
//! call, a reply, or an event. The concrete payload type is identified by
//! `type_name` and its fields live in the [`Body`].

use crate::error::ErrorCode;
use crate::payload::{Body, Field, PayloadType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Header holding the id of the request a reply answers.
pub const CORRELATION_ID: &str = "correlationId";
/// Header holding the service id replies must be routed to.
pub const REPLY_TO: &str = "replyTo";
/// Header marking a message as a reply.
pub const IS_REPLY: &str = "isReply";
/// Header telling the receiver that nobody tracks the reply.
pub const NO_REPLY: &str = "noReply";
/// Wire-only header mapping body paths to concrete payload type names.
pub const SCHEMA: &str = "schema";

/// Separator between the node id and the local name in a service id.
pub const SERVICE_ID_SPLITTER: &str = ":::";

/// Timeout value meaning "use the configured default".
pub const UNSET_TIMEOUT: i64 = -1;

pub const REPLY_TYPE: &str = "MessageReply";
pub const API_REPLY_TYPE: &str = "APIReply";
/// Subscription key shared by every API event.
pub const API_EVENT_TYPE: &str = "APIEvent";

/// Unique message identifier (UUID v7, time ordered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Outcome carried by replies and API events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl ReplyStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: ErrorCode) -> Self {
        Self {
            success: false,
            error: Some(error),
        }
    }
}

impl Default for ReplyStatus {
    fn default() -> Self {
        Self::ok()
    }
}

/// Kind discriminator of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum MessageKind {
    /// Fire-and-forget command.
    Oneway,
    /// Request expecting a [`MessageKind::Reply`].
    NeedReply { timeout_ms: i64 },
    /// Asynchronous API call, completed by an [`MessageKind::ApiEvent`].
    Api { timeout_ms: i64 },
    /// Synchronous API call, answered by an [`MessageKind::ApiReply`].
    ApiSyncCall { timeout_ms: i64 },
    Reply { status: ReplyStatus },
    ApiReply { status: ReplyStatus },
    /// Event keyed by the message type name.
    Event,
    /// Completion event of an asynchronous API call.
    ApiEvent { api_id: MessageId, status: ReplyStatus },
}

/// Capability tags a message kind satisfies, most specific first.
///
/// The universal root is not a tag; wildcard registration covers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KindTag {
    NeedReply,
    Api,
    ApiSyncCall,
    Reply,
    ApiReply,
    Event,
    ApiEvent,
}

impl KindTag {
    pub fn is_reply_like(&self) -> bool {
        matches!(self, KindTag::Reply | KindTag::ApiReply | KindTag::ApiEvent)
    }
}

/// Interceptor registration target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    /// A concrete payload type name, e.g. `PingMsg`.
    Type(String),
    /// Every message of a kind and its sub-kinds.
    Kind(KindTag),
}

impl Tag {
    pub fn of_type(name: impl Into<String>) -> Self {
        Tag::Type(name.into())
    }
}

impl From<KindTag> for Tag {
    fn from(kind: KindTag) -> Self {
        Tag::Kind(kind)
    }
}

impl MessageKind {
    /// Tags of this kind, most specific first.
    pub fn kind_tags(&self) -> &'static [KindTag] {
        match self {
            MessageKind::Oneway => &[],
            MessageKind::NeedReply { .. } => &[KindTag::NeedReply],
            MessageKind::Api { .. } => &[KindTag::Api, KindTag::NeedReply],
            MessageKind::ApiSyncCall { .. } => &[KindTag::ApiSyncCall, KindTag::Api, KindTag::NeedReply],
            MessageKind::Reply { .. } => &[KindTag::Reply],
            MessageKind::ApiReply { .. } => &[KindTag::ApiReply, KindTag::Reply],
            MessageKind::Event => &[KindTag::Event],
            MessageKind::ApiEvent { .. } => &[KindTag::ApiEvent, KindTag::Event],
        }
    }
}

/// A bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Concrete payload type, e.g. `PingMsg`.
    #[serde(rename = "type")]
    pub type_name: String,
    pub kind: MessageKind,
    /// Target service id, `<node>:::<name>` or a bare local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Body,
}

impl Message {
    fn with_kind(type_name: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: MessageId::new(),
            type_name: type_name.into(),
            kind,
            service_id: None,
            headers: BTreeMap::new(),
            body: Body::default(),
        }
    }

    pub fn oneway(type_name: impl Into<String>) -> Self {
        Self::with_kind(type_name, MessageKind::Oneway)
    }

    pub fn need_reply(type_name: impl Into<String>) -> Self {
        Self::with_kind(
            type_name,
            MessageKind::NeedReply {
                timeout_ms: UNSET_TIMEOUT,
            },
        )
    }

    pub fn api(type_name: impl Into<String>) -> Self {
        Self::with_kind(
            type_name,
            MessageKind::Api {
                timeout_ms: UNSET_TIMEOUT,
            },
        )
    }

    pub fn api_sync_call(type_name: impl Into<String>) -> Self {
        Self::with_kind(
            type_name,
            MessageKind::ApiSyncCall {
                timeout_ms: UNSET_TIMEOUT,
            },
        )
    }

    /// Successful reply of the given type.
    pub fn reply(type_name: impl Into<String>) -> Self {
        Self::with_kind(
            type_name,
            MessageKind::Reply {
                status: ReplyStatus::ok(),
            },
        )
    }

    pub fn api_reply(type_name: impl Into<String>) -> Self {
        Self::with_kind(
            type_name,
            MessageKind::ApiReply {
                status: ReplyStatus::ok(),
            },
        )
    }

    pub fn event(type_name: impl Into<String>) -> Self {
        Self::with_kind(type_name, MessageKind::Event)
    }

    pub fn api_event(type_name: impl Into<String>, api_id: MessageId) -> Self {
        Self::with_kind(
            type_name,
            MessageKind::ApiEvent {
                api_id,
                status: ReplyStatus::ok(),
            },
        )
    }

    /// Generic failed reply.
    pub fn error_reply(error: ErrorCode) -> Self {
        Self::with_kind(
            REPLY_TYPE,
            MessageKind::Reply {
                status: ReplyStatus::failed(error),
            },
        )
    }

    pub fn error_api_reply(error: ErrorCode) -> Self {
        Self::with_kind(
            API_REPLY_TYPE,
            MessageKind::ApiReply {
                status: ReplyStatus::failed(error),
            },
        )
    }

    pub fn error_api_event(api_id: MessageId, error: ErrorCode) -> Self {
        Self::with_kind(
            API_EVENT_TYPE,
            MessageKind::ApiEvent {
                api_id,
                status: ReplyStatus::failed(error),
            },
        )
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.set_timeout_ms(timeout_ms);
        self
    }

    /// Adds a plain JSON body field.
    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.body.insert_value(name, value);
        self
    }

    /// Adds a polymorphic body field holding a concrete payload.
    pub fn with_payload<T: PayloadType>(mut self, name: impl Into<String>, payload: T) -> Self {
        self.body.insert_payload(name, payload);
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, field: Field) -> Self {
        self.body.insert(name, field);
        self
    }

    pub fn timeout_ms(&self) -> Option<i64> {
        match &self.kind {
            MessageKind::NeedReply { timeout_ms }
            | MessageKind::Api { timeout_ms }
            | MessageKind::ApiSyncCall { timeout_ms } => Some(*timeout_ms),
            _ => None,
        }
    }

    /// Sets the timeout of a request. No-op for kinds without a timeout.
    pub fn set_timeout_ms(&mut self, value: i64) {
        match &mut self.kind {
            MessageKind::NeedReply { timeout_ms }
            | MessageKind::Api { timeout_ms }
            | MessageKind::ApiSyncCall { timeout_ms } => *timeout_ms = value,
            _ => {}
        }
    }

    /// True for every kind that expects an answer, API calls included.
    pub fn is_need_reply(&self) -> bool {
        self.timeout_ms().is_some()
    }

    /// True for both asynchronous and synchronous API calls.
    pub fn is_api(&self) -> bool {
        matches!(self.kind, MessageKind::Api { .. } | MessageKind::ApiSyncCall { .. })
    }

    pub fn is_api_sync_call(&self) -> bool {
        matches!(self.kind, MessageKind::ApiSyncCall { .. })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self.kind, MessageKind::Reply { .. } | MessageKind::ApiReply { .. })
    }

    pub fn is_event(&self) -> bool {
        matches!(self.kind, MessageKind::Event | MessageKind::ApiEvent { .. })
    }

    /// Key used to match event subscriptions.
    pub fn event_key(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Event => Some(&self.type_name),
            MessageKind::ApiEvent { .. } => Some(API_EVENT_TYPE),
            _ => None,
        }
    }

    /// Id of the API call an API event completes.
    pub fn api_id(&self) -> Option<MessageId> {
        match &self.kind {
            MessageKind::ApiEvent { api_id, .. } => Some(*api_id),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&ReplyStatus> {
        match &self.kind {
            MessageKind::Reply { status }
            | MessageKind::ApiReply { status }
            | MessageKind::ApiEvent { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Marks a reply or API event as failed. No-op for other kinds.
    pub fn set_error(&mut self, error: ErrorCode) {
        match &mut self.kind {
            MessageKind::Reply { status }
            | MessageKind::ApiReply { status }
            | MessageKind::ApiEvent { status, .. } => *status = ReplyStatus::failed(error),
            _ => {}
        }
    }

    pub fn is_success(&self) -> bool {
        self.status().map(|s| s.success).unwrap_or(true)
    }

    pub fn error(&self) -> Option<&ErrorCode> {
        self.status().and_then(|s| s.error.as_ref())
    }

    /// Interceptor tags: the concrete type first, then the kind tags.
    pub fn tags(&self) -> Vec<Tag> {
        let mut tags = Vec::with_capacity(4);
        tags.push(Tag::Type(self.type_name.clone()));
        tags.extend(self.kind.kind_tags().iter().copied().map(Tag::Kind));
        tags
    }

    pub fn put_header(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn header(&self, key: &str) -> Option<&Value> {
        self.headers.get(key)
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn correlation_id(&self) -> Option<MessageId> {
        self.header_str(CORRELATION_ID).and_then(|s| MessageId::parse(s).ok())
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.header_str(REPLY_TO)
    }

    /// Whether the sender opted out of receiving a reply.
    pub fn no_reply(&self) -> bool {
        match self.headers.get(NO_REPLY) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn is_marked_reply(&self) -> bool {
        matches!(self.headers.get(IS_REPLY), Some(Value::Bool(true)))
    }

    /// `Type[id]`, used in log lines and error details.
    pub fn describe(&self) -> String {
        format!("{}[id:{}]", self.type_name, self.id)
    }

    /// Full JSON dump for diagnostics.
    pub fn dump(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{} <unserializable: {}>", self.describe(), e))
    }
}

/// Splits `<node>:::<name>` into its parts. Bare names have no node.
pub fn split_service_id(service_id: &str) -> (Option<&str>, &str) {
    match service_id.split_once(SERVICE_ID_SPLITTER) {
        Some((node, name)) => (Some(node), name),
        None => (None, service_id),
    }
}

pub fn make_service_id(node_id: &str, name: &str) -> String {
    format!("{}{}{}", node_id, SERVICE_ID_SPLITTER, name)
}
