//! Message bodies and polymorphic payload fields.
//!
//! A body is an ordered map of named [`Field`]s. Most fields are plain JSON,
//! but a field may also hold a concrete [`PayloadType`] behind a trait object.
//! The wire format only sees JSON, so such fields come back as plain objects
//! unless the receiver reconstructs them through the [`PayloadRegistry`]
//! (see [`crate::schema`]).

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A concrete payload type that can travel in a polymorphic field.
pub trait PayloadType: Serialize + DeserializeOwned + Debug + PartialEq + Send + Sync + 'static {
    /// Name written to the wire schema. Must be unique per registry.
    const TYPE_NAME: &'static str;
}

/// Object-safe view over a [`PayloadType`].
pub trait DynPayload: Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn to_value(&self) -> Result<Value, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn DynPayload) -> bool;
}

impl<T: PayloadType> DynPayload for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn DynPayload) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| o == self)
    }
}

/// One body field.
#[derive(Debug, Clone)]
pub enum Field {
    /// Scalar JSON value (null, bool, number or string).
    Value(Value),
    Object(BTreeMap<String, Field>),
    List(Vec<Field>),
    /// Concrete payload whose type the receiver cannot infer from JSON alone.
    Dyn(Arc<dyn DynPayload>),
}

impl Field {
    /// Converts plain JSON, splitting objects and arrays so nested fields are
    /// addressable by path.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Field::Object(map.into_iter().map(|(k, v)| (k, Field::from_value(v))).collect()),
            Value::Array(items) => Field::List(items.into_iter().map(Field::from_value).collect()),
            other => Field::Value(other),
        }
    }

    pub fn payload<T: PayloadType>(payload: T) -> Self {
        Field::Dyn(Arc::new(payload))
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        Ok(match self {
            Field::Value(v) => v.clone(),
            Field::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_value()?);
                }
                Value::Object(out)
            }
            Field::List(items) => Value::Array(items.iter().map(Field::to_value).collect::<Result<_, _>>()?),
            Field::Dyn(p) => p.to_value()?,
        })
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Field::Value(Value::Null))
    }

    /// Concrete payload type name, for `Dyn` fields.
    pub fn dyn_type(&self) -> Option<&'static str> {
        match self {
            Field::Dyn(p) => Some(p.type_name()),
            _ => None,
        }
    }

    pub fn downcast_ref<T: PayloadType>(&self) -> Option<&T> {
        match self {
            Field::Dyn(p) => p.as_any().downcast_ref::<T>(),
            _ => None,
        }
    }

    fn child(&self, seg: &str) -> Option<&Field> {
        match self {
            Field::Object(map) => map.get(seg),
            Field::List(items) => items.get(parse_index(seg)?),
            _ => None,
        }
    }

    fn child_mut(&mut self, seg: &str) -> Option<&mut Field> {
        match self {
            Field::Object(map) => map.get_mut(seg),
            Field::List(items) => items.get_mut(parse_index(seg)?),
            _ => None,
        }
    }

    fn collect_dyn(&self, path: String, out: &mut Vec<(String, &'static str)>) {
        match self {
            Field::Dyn(p) => out.push((path, p.type_name())),
            Field::Object(map) => {
                for (k, v) in map {
                    v.collect_dyn(format!("{}/{}", path, escape_segment(k)), out);
                }
            }
            Field::List(items) => {
                for (i, v) in items.iter().enumerate() {
                    v.collect_dyn(format!("{}/{}", path, i), out);
                }
            }
            Field::Value(_) => {}
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Field::Value(a), Field::Value(b)) => a == b,
            (Field::Object(a), Field::Object(b)) => a == b,
            (Field::List(a), Field::List(b)) => a == b,
            (Field::Dyn(a), Field::Dyn(b)) => a.dyn_eq(b.as_ref()),
            _ => false,
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Value(v) => v.serialize(serializer),
            Field::Object(map) => map.serialize(serializer),
            Field::List(items) => items.serialize(serializer),
            Field::Dyn(p) => p
                .to_value()
                .map_err(serde::ser::Error::custom)?
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Field {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Field::from_value)
    }
}

/// Escapes one pointer segment: `~` becomes `~0`, `/` becomes `~1`.
pub fn escape_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Splits a JSON pointer such as `/spec/hosts/1/address` into unescaped
/// segments. Returns `None` for malformed pointers.
pub fn parse_path(pointer: &str) -> Option<Vec<String>> {
    let rest = pointer.strip_prefix('/')?;
    rest.split('/').map(unescape_segment).collect()
}

fn unescape_segment(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '0' => out.push('~'),
            '1' => out.push('/'),
            _ => return None,
        }
    }
    Some(out)
}

// RFC 6901 array index: digits only, no leading zero.
fn parse_index(segment: &str) -> Option<usize> {
    let digits = !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit());
    if !digits || (segment.len() > 1 && segment.starts_with('0')) {
        return None;
    }
    segment.parse().ok()
}

/// Message body: named fields in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Body(BTreeMap<String, Field>);

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, field: Field) {
        self.0.insert(name.into(), field);
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: Value) {
        self.insert(name, Field::from_value(value));
    }

    pub fn insert_payload<T: PayloadType>(&mut self, name: impl Into<String>, payload: T) {
        self.insert(name, Field::payload(payload));
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Field> {
        self.0.remove(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes a field. Missing fields decode from `null`, so `Option<T>`
    /// targets yield `None`.
    pub fn decode<T: DeserializeOwned>(&self, name: &str) -> Result<T, serde_json::Error> {
        let value = match self.0.get(name) {
            Some(field) => field.to_value()?,
            None => Value::Null,
        };
        serde_json::from_value(value)
    }

    /// Borrow a reconstructed payload.
    pub fn payload<T: PayloadType>(&self, name: &str) -> Option<&T> {
        self.0.get(name).and_then(Field::downcast_ref::<T>)
    }

    /// Field at a JSON pointer. The first segment names a body field.
    pub fn get_path(&self, pointer: &str) -> Option<&Field> {
        let segments = parse_path(pointer)?;
        let (first, rest) = segments.split_first()?;
        let mut field = self.0.get(first)?;
        for seg in rest {
            field = field.child(seg)?;
        }
        Some(field)
    }

    pub fn get_path_mut(&mut self, pointer: &str) -> Option<&mut Field> {
        let segments = parse_path(pointer)?;
        let (first, rest) = segments.split_first()?;
        let mut field = self.0.get_mut(first)?;
        for seg in rest {
            field = field.child_mut(seg)?;
        }
        Some(field)
    }

    /// JSON pointers and type names of every `Dyn` field, depth first.
    pub fn dyn_paths(&self) -> Vec<(String, &'static str)> {
        let mut out = Vec::new();
        for (name, field) in &self.0 {
            field.collect_dyn(format!("/{}", escape_segment(name)), &mut out);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.0.iter()
    }
}

type Decoder = fn(Value) -> Result<Arc<dyn DynPayload>, serde_json::Error>;

fn decode_as<T: PayloadType>(value: Value) -> Result<Arc<dyn DynPayload>, serde_json::Error> {
    let payload: T = serde_json::from_value(value)?;
    Ok(Arc::new(payload))
}

/// Maps payload type names to decoders.
#[derive(Default)]
pub struct PayloadRegistry {
    decoders: DashMap<&'static str, Decoder>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`. Re-registering the same name replaces the decoder.
    pub fn register<T: PayloadType>(&self) {
        self.decoders.insert(T::TYPE_NAME, decode_as::<T>);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    /// Decodes `value` as the payload registered under `type_name`.
    ///
    /// Returns `None` when the type is unknown.
    pub fn decode(&self, type_name: &str, value: Value) -> Option<Result<Arc<dyn DynPayload>, serde_json::Error>> {
        let decoder = *self.decoders.get(type_name)?;
        Some(decoder(value))
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.decoders.iter().map(|e| *e.key()).collect();
        names.sort_unstable();
        f.debug_struct("PayloadRegistry").field("types", &names).finish()
    }
}
