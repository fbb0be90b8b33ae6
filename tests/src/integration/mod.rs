//! Cross-node integration tests.

pub mod support;

mod cluster;
mod fanout;
mod schema_roundtrip;
mod unreachable;
