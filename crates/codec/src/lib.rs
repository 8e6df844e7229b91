//! ## POTP value codecs
//!
//! The POTP endpoint layer exchanges self-describing records over a framed
//! transport. This crate defines the value domain those records live in and
//! the codecs that turn a value into frame payload bytes and back.
//!
//! The envelope itself only needs a handful of shapes (string keys, booleans,
//! strings, lists, nested records and an opaque application payload), so the
//! domain is deliberately small. Codecs are pluggable behind the [`Codec`]
//! trait; the default is the tagged [`binary::BinaryCodec`], with
//! [`json::JsonCodec`] available when payloads are restricted to JSON-safe
//! values.

pub mod binary;
pub mod json;

use std::collections::BTreeMap;

#[derive(Debug)]
pub enum Error {
    NotSerializable(String),
    NotInstantiable(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSerializable(cause) => {
                write!(f, "value not serializable: {}", cause)
            }
            Self::NotInstantiable(cause) => {
                write!(f, "bytes not instantiable as a value: {}", cause)
            }
        }
    }
}

/// The value domain carried inside POTP frames.
///
/// Records use [`BTreeMap`] so the encoding of a value is deterministic.
///
/// # Test
///
/// ```
/// use potp_codec::Value;
///
/// let value = Value::from(vec![Value::from(1), Value::from("two")]);
///
/// assert_eq!(value.as_list().unwrap().len(), 2);
/// assert_eq!(value.as_list().unwrap()[1].as_str(), Some("two"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a record value from key/value pairs.
    ///
    /// # Test
    ///
    /// ```
    /// use potp_codec::Value;
    ///
    /// let record = Value::record([("error", Value::Bool(false))]);
    ///
    /// assert_eq!(record.get("error"), Some(&Value::Bool(false)));
    /// assert_eq!(record.get("ret"), None);
    /// ```
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Record(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Looks up a field of a record value.
    ///
    /// Returns `None` when the value is not a record or the key is missing.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Record(fields) => fields.get(key),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(value) => Some(value.as_slice()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(values) => Some(values.as_slice()),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Record(value)
    }
}

/// Converts a value to and from frame payload bytes.
///
/// Implementations must be inverses of each other over the whole [`Value`]
/// domain they accept: `decode(encode(v)) == v` for every `v` that encodes.
pub trait Codec: Send + Sync {
    /// Serialize a value into payload bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error>;

    /// Rebuild a value from payload bytes.
    fn decode(&self, bytes: &[u8]) -> Result<Value, Error>;
}
