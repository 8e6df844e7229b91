use super::{Error, Value};

/// JSON rendition of the POTP value domain.
///
/// Usable when payloads are restricted to JSON-safe values: `Bytes` has no
/// JSON shape and fails with [`Error::NotSerializable`], as do non-finite
/// floats. JSON numbers come back as `Int` when the text parses as an
/// integer and as `Float` otherwise.
///
/// # Test
///
/// ```
/// use potp_codec::{json::JsonCodec, Codec, Value};
///
/// let codec = JsonCodec;
/// let value = Value::record([("x", Value::Int(1))]);
///
/// let bytes = codec.encode(&value).unwrap();
///
/// assert_eq!(bytes, b"{\"x\":1}");
/// assert_eq!(codec.decode(&bytes).unwrap(), value);
/// ```
#[derive(Default, Clone, Copy)]
pub struct JsonCodec;

impl super::Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let value = to_json(value)?;
        serde_json::to_vec(&value).map_err(|e| Error::NotSerializable(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, Error> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| Error::NotInstantiable(e.to_string()))?;
        Ok(from_json(value))
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value, Error> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(value) => serde_json::Value::Bool(*value),
        Value::Int(value) => serde_json::Value::from(*value),
        Value::Float(value) => serde_json::Number::from_f64(*value)
            .map(serde_json::Value::Number)
            .ok_or_else(|| Error::NotSerializable("non-finite float".to_string()))?,
        Value::Str(value) => serde_json::Value::String(value.clone()),
        Value::Bytes(_) => {
            return Err(Error::NotSerializable(
                "bytes values have no JSON form".to_string(),
            ));
        }
        Value::List(values) => serde_json::Value::Array(
            values.iter().map(to_json).collect::<Result<_, Error>>()?,
        ),
        Value::Record(fields) => serde_json::Value::Object(
            fields
                .iter()
                .map(|(key, value)| Ok((key.clone(), to_json(value)?)))
                .collect::<Result<_, Error>>()?,
        ),
    })
}

fn from_json(value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(value) => Value::Bool(value),
        serde_json::Value::Number(value) => match value.as_i64() {
            Some(value) => Value::Int(value),
            None => Value::Float(value.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(value) => Value::Str(value),
        serde_json::Value::Array(values) => {
            Value::List(values.into_iter().map(from_json).collect())
        }
        serde_json::Value::Object(fields) => Value::Record(
            fields
                .into_iter()
                .map(|(key, value)| (key, from_json(value)))
                .collect(),
        ),
    }
}
