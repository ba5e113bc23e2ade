//! The self-describing value codec carried as transaction payload.
//!
//! Values are encoded with [`ciborium`] (CBOR), chosen as the "widely
//! implemented binary self-describing codec" called for by the payload
//! format: it preserves UTF-8 strings, IEEE-754 numbers, booleans, null,
//! dates (stored here as epoch-millisecond numbers), ordered maps, sets,
//! byte strings, and arbitrary nesting, and any other CBOR-capable language
//! can read the same ledger.

use std::io;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{DecodeSnafu, EncodeSnafu, TransactionError};

/// A dynamically typed value stored as a transaction payload.
///
/// `Map` and `Set` preserve insertion order (backed by [`IndexMap`]/a
/// `Vec`-backed set), matching the "ordered maps" and "sets" requirement.
/// Encoding always goes through [`TaggedValue`] (see [`Value::encode`]), so
/// this type itself carries no `Serialize`/`Deserialize` derive — an
/// untagged derive here couldn't disambiguate `Date` from `Number` or `Set`
/// from `Array` the way the tagged wire form does.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
    Set(Vec<Value>),
}

impl Value {
    /// Encodes this value using the stable object codec.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Encode`] if the underlying CBOR
    /// serializer fails, which in practice only happens if the value
    /// contains data the codec cannot represent (e.g. a non-finite float is
    /// still representable, so this is effectively infallible for values
    /// constructed through the public API).
    pub fn encode(&self) -> Result<Vec<u8>, TransactionError> {
        let mut buf = Vec::new();
        ciborium::into_writer(&TaggedValue::from(self), &mut buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            .context(EncodeSnafu)?;
        Ok(buf)
    }

    /// Decodes a value previously produced by [`Value::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::Decode`] if `bytes` is not a valid
    /// encoding produced by this codec.
    pub fn decode(bytes: &[u8]) -> Result<Value, TransactionError> {
        let tagged: TaggedValue = ciborium::from_reader(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            .context(DecodeSnafu)?;
        Ok(tagged.into())
    }
}

/// On-wire representation that disambiguates `Date` from `Number` and `Set`
/// from `Array`, both of which would otherwise collapse to the same CBOR
/// shape under `#[serde(untagged)]`.
#[derive(Serialize, Deserialize)]
enum TaggedValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(f64),
    Array(Vec<TaggedValue>),
    Map(Vec<(String, TaggedValue)>),
    Set(Vec<TaggedValue>),
}

impl From<&Value> for TaggedValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => TaggedValue::Null,
            Value::Bool(b) => TaggedValue::Bool(*b),
            Value::Number(n) => TaggedValue::Number(*n),
            Value::String(s) => TaggedValue::String(s.clone()),
            Value::Bytes(b) => TaggedValue::Bytes(b.clone()),
            Value::Date(d) => TaggedValue::Date(*d),
            Value::Array(items) => TaggedValue::Array(items.iter().map(TaggedValue::from).collect()),
            Value::Map(map) => {
                TaggedValue::Map(map.iter().map(|(k, v)| (k.clone(), TaggedValue::from(v))).collect())
            }
            Value::Set(items) => TaggedValue::Set(items.iter().map(TaggedValue::from).collect()),
        }
    }
}

impl From<TaggedValue> for Value {
    fn from(v: TaggedValue) -> Self {
        match v {
            TaggedValue::Null => Value::Null,
            TaggedValue::Bool(b) => Value::Bool(b),
            TaggedValue::Number(n) => Value::Number(n),
            TaggedValue::String(s) => Value::String(s),
            TaggedValue::Bytes(b) => Value::Bytes(b),
            TaggedValue::Date(d) => Value::Date(d),
            TaggedValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            TaggedValue::Map(entries) => {
                Value::Map(entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            TaggedValue::Set(items) => Value::Set(items.into_iter().map(Value::from).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_shape() {
        let mut map = IndexMap::new();
        map.insert("b".to_string(), Value::Number(2.0));
        map.insert("a".to_string(), Value::Number(1.0));

        let values = vec![
            Value::Null,
            Value::Bool(true),
            Value::Number(42.5),
            Value::String("hello".to_string()),
            Value::Bytes(vec![1, 2, 3, 255]),
            Value::Date(1_700_000_000_000.0),
            Value::Array(vec![Value::Number(1.0), Value::String("x".into())]),
            Value::Map(map),
            Value::Set(vec![Value::Number(1.0), Value::Number(2.0)]),
        ];

        for value in values {
            let encoded = value.encode().expect("encode");
            let decoded = Value::decode(&encoded).expect("decode");
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn map_preserves_insertion_order() {
        let mut map = IndexMap::new();
        map.insert("z".to_string(), Value::Number(1.0));
        map.insert("a".to_string(), Value::Number(2.0));
        let value = Value::Map(map);

        let encoded = value.encode().expect("encode");
        let Value::Map(decoded) = Value::decode(&encoded).expect("decode") else {
            panic!("expected map");
        };

        let keys: Vec<_> = decoded.keys().cloned().collect();
        assert_eq!(keys, vec!["z".to_string(), "a".to_string()]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = Value::decode(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, TransactionError::Decode { .. }));
    }
}
