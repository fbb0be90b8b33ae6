//! # CloudBus Test Suite
//!
//! Unified test crate for behaviour that needs more than one node.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── support.rs          # In-process clusters on ephemeral ports
//!     ├── cluster.rs          # Request/reply across nodes
//!     ├── fanout.rs           # Events and API events across nodes
//!     ├── schema_roundtrip.rs # Polymorphic fields over HTTP
//!     └── unreachable.rs      # Dead peers and retries
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p cloud-bus-tests
//! cargo test -p cloud-bus-tests integration::fanout
//! ```

#![allow(dead_code)]

pub mod integration;
