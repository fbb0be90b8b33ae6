//! CloudBus - message bus of a management node cluster.
//!
//! Services register on the bus under `<node>:::<name>`. Any node can send
//! them requests, get replies back with a timeout guarantee, publish events
//! to every node, and hook interceptors into each stage of a message's life.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              CloudBus                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  send / call / publish / reply                                       │
//! │         │                                                            │
//! │  ┌──────┴──────────┐   ┌──────────────────┐   ┌──────────────────┐   │
//! │  │  before-send /  │   │ Envelope Tracker │   │  Event Registry  │   │
//! │  │  marshallers /  │   │ (reply XOR       │   │  (listeners by   │   │
//! │  │  before-publish │   │  timeout, once)  │   │   event key)     │   │
//! │  └──────┬──────────┘   └────────▲─────────┘   └────────▲─────────┘   │
//! │         │                       │                      │             │
//! │  ┌──────┴───────────────────────┴──────────────────────┴──────────┐  │
//! │  │                 Router (MessageSender)                         │  │
//! │  │   local: consumer table  ──  remote: POST <ctx>/cloudbus       │  │
//! │  └──────┬──────────────────────────────────────────────┬──────────┘  │
//! │         │                                              │             │
//! │  ┌──────┴──────────┐                          ┌────────┴─────────┐   │
//! │  │  EndPoints      │                          │  HTTP transport  │   │
//! │  │  (scheduler,    │                          │  (retry, schema  │   │
//! │  │   sync levels)  │                          │   restore)       │   │
//! │  └─────────────────┘                          └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cloud_bus::{BusConfig, CloudBus, Message};
//!
//! let bus = CloudBus::builder(BusConfig::from_env()?).build()?;
//! bus.register_service(Arc::new(HostService::new()))?;
//! bus.start()?;
//!
//! let reply = bus.call(Message::need_reply("PingHostMsg").with_service_id("host")).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bus;
pub mod config;
pub mod context;
pub mod destination;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod message;
pub mod payload;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod timeout;
pub mod transport;

mod router;

pub use bus::{CloudBus, CloudBusBuilder, BUS_SERVICE_NAME, EVENT_SERVICE_NAME};
pub use config::{BusConfig, ConfigError, HttpConfig, MessageLogConfig, TimeoutConfig};
pub use context::TraceContext;
pub use destination::{DestinationResolver, ManagementNode, StaticDestinationMaker};
pub use endpoint::Service;
pub use envelope::EnvelopeStatsSnapshot;
pub use error::{BusError, BusResult, ErrorCode, HandlerError};
pub use events::{EventListener, EventSubscription};
pub use interceptor::{
    BeforeDeliveryInterceptor, BeforePublishInterceptor, BeforeSendInterceptor, ReplyMarshaller, StopRouting,
};
pub use message::{KindTag, Message, MessageId, MessageKind, Tag};
pub use payload::{Body, Field, PayloadRegistry, PayloadType};
pub use scheduler::{Scheduler, TokioScheduler};
