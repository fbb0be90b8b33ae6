//! Wire schema for polymorphic fields.
//!
//! Before a message goes over HTTP the sender records, for every body path
//! holding a concrete payload, the payload's type name. The generic decoder on
//! the receiving side only sees JSON objects at those paths; [`restore`] runs
//! as a second pass and swaps them for the concrete payloads.
//!
//! The pass is HTTP-only. Messages delivered in-process keep their payloads
//! and never carry a schema.

use crate::message::{Message, SCHEMA};
use crate::payload::{Field, PayloadRegistry};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

/// JSON pointer into the body -> concrete payload type name.
pub type Schema = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("schema header is not a map of strings: {0}")]
    Malformed(String),

    #[error("no payload type registered as {0}")]
    UnknownType(String),

    #[error("invalid field path {0}")]
    InvalidPath(String),

    #[error("failed to decode field {path} as {type_name}: {source}")]
    Decode {
        path: String,
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Schema of the message's current body.
pub fn build(msg: &Message) -> Schema {
    msg.body
        .dyn_paths()
        .into_iter()
        .map(|(path, type_name)| (path, type_name.to_string()))
        .collect()
}

/// Stamps the schema header. An empty schema is still written so the receiver
/// can tell the pass was considered.
pub fn attach(msg: &mut Message) {
    let schema = build(msg);
    let value = Value::Object(schema.into_iter().map(|(k, v)| (k, Value::String(v))).collect());
    msg.put_header(SCHEMA, value);
}

/// Removes the schema header.
pub fn strip(msg: &mut Message) -> Option<Value> {
    msg.headers.remove(SCHEMA)
}

fn read(msg: &Message) -> Result<Schema, SchemaError> {
    match msg.header(SCHEMA) {
        None | Some(Value::Null) => Ok(Schema::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(path, ty)| match ty {
                Value::String(ty) => Ok((path.clone(), ty.clone())),
                other => Err(SchemaError::Malformed(format!("{} -> {}", path, other))),
            })
            .collect(),
        Some(other) => Err(SchemaError::Malformed(other.to_string())),
    }
}

/// Reconstructs the concrete payloads listed in the message's schema header.
///
/// Does nothing when the header is absent or empty. Fields already holding a
/// payload of the right type are left alone; null or missing fields are
/// skipped.
pub fn restore(msg: &mut Message, registry: &PayloadRegistry) -> Result<usize, SchemaError> {
    let schema = read(msg)?;
    if schema.is_empty() {
        return Ok(0);
    }
    validate_paths(&schema)?;

    let mut restored = 0;
    for (path, type_name) in schema {
        let Some(field) = msg.body.get_path_mut(&path) else {
            trace!(path = %path, "schema path absent from body, skipping");
            continue;
        };

        if field.is_null() || field.dyn_type() == Some(type_name.as_str()) {
            continue;
        }

        let raw = field.to_value().map_err(|source| SchemaError::Decode {
            path: path.clone(),
            type_name: type_name.clone(),
            source,
        })?;
        let payload = registry
            .decode(&type_name, raw)
            .ok_or_else(|| SchemaError::UnknownType(type_name.clone()))?
            .map_err(|source| SchemaError::Decode {
                path: path.clone(),
                type_name: type_name.clone(),
                source,
            })?;

        *field = Field::Dyn(payload);
        restored += 1;
    }

    Ok(restored)
}

/// Validates every schema path before decoding anything.
pub fn validate_paths(schema: &Schema) -> Result<(), SchemaError> {
    for path in schema.keys() {
        if crate::payload::parse_path(path).is_none() {
            return Err(SchemaError::InvalidPath(path.clone()));
        }
    }
    Ok(())
}
