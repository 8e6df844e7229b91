use bytes::{BufMut, BytesMut};

use super::{Error, Value};

const NULL: u8 = 0x00;
const BOOL: u8 = 0x01;
const INT: u8 = 0x02;
const FLOAT: u8 = 0x03;
const STR: u8 = 0x04;
const BYTES: u8 = 0x05;
const LIST: u8 = 0x06;
const RECORD: u8 = 0x07;

/// The default POTP codec.
///
/// Every value is written as one tag byte followed by its body; lengths,
/// counts and integers are little-endian. The format is self-describing, so
/// a receiver needs no schema to rebuild the value.
///
/// # Test
///
/// ```
/// use potp_codec::{binary::BinaryCodec, Codec, Value};
///
/// let codec = BinaryCodec;
/// let value = Value::record([
///     ("error", Value::Bool(false)),
///     ("ret", Value::Int(42)),
/// ]);
///
/// let bytes = codec.encode(&value).unwrap();
///
/// assert_eq!(codec.decode(&bytes).unwrap(), value);
/// ```
#[derive(Default, Clone, Copy)]
pub struct BinaryCodec;

impl super::Codec for BinaryCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let mut bytes = BytesMut::new();
        encode_value(value, &mut bytes)?;
        Ok(bytes.to_vec())
    }

    /// # Test
    ///
    /// ```
    /// use potp_codec::{binary::BinaryCodec, Codec};
    ///
    /// // [tag=STR][len=5 LE]["hello"]
    /// let buffer = [0x04u8, 0x05, 0x00, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o'];
    ///
    /// let value = BinaryCodec.decode(&buffer).unwrap();
    ///
    /// assert_eq!(value.as_str(), Some("hello"));
    /// ```
    fn decode(&self, bytes: &[u8]) -> Result<Value, Error> {
        let mut pos = 0;
        let value = decode_value(bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(Error::NotInstantiable(format!(
                "{} trailing bytes after the value",
                bytes.len() - pos
            )));
        }

        Ok(value)
    }
}

fn put_len(len: usize, bytes: &mut BytesMut) -> Result<(), Error> {
    let len = u32::try_from(len)
        .map_err(|_| Error::NotSerializable("length exceeds 32 bits".to_string()))?;
    bytes.put_u32_le(len);
    Ok(())
}

fn encode_value(value: &Value, bytes: &mut BytesMut) -> Result<(), Error> {
    match value {
        Value::Null => {
            bytes.put_u8(NULL);
        }
        Value::Bool(value) => {
            bytes.put_u8(BOOL);
            bytes.put_u8(*value as u8);
        }
        Value::Int(value) => {
            bytes.put_u8(INT);
            bytes.put_i64_le(*value);
        }
        Value::Float(value) => {
            bytes.put_u8(FLOAT);
            bytes.put_f64_le(*value);
        }
        Value::Str(value) => {
            bytes.put_u8(STR);
            put_len(value.len(), bytes)?;
            bytes.extend_from_slice(value.as_bytes());
        }
        Value::Bytes(value) => {
            bytes.put_u8(BYTES);
            put_len(value.len(), bytes)?;
            bytes.extend_from_slice(value);
        }
        Value::List(values) => {
            bytes.put_u8(LIST);
            put_len(values.len(), bytes)?;
            for value in values {
                encode_value(value, bytes)?;
            }
        }
        Value::Record(fields) => {
            bytes.put_u8(RECORD);
            put_len(fields.len(), bytes)?;
            for (key, value) in fields {
                put_len(key.len(), bytes)?;
                bytes.extend_from_slice(key.as_bytes());
                encode_value(value, bytes)?;
            }
        }
    }

    Ok(())
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, size: usize) -> Result<&'a [u8], Error> {
    let end = pos
        .checked_add(size)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| Error::NotInstantiable("truncated input".to_string()))?;
    let chunk = &bytes[*pos..end];
    *pos = end;
    Ok(chunk)
}

fn take_array<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N], Error> {
    take(bytes, pos, N)?
        .try_into()
        .map_err(|_| Error::NotInstantiable("truncated input".to_string()))
}

fn take_len(bytes: &[u8], pos: &mut usize) -> Result<usize, Error> {
    Ok(u32::from_le_bytes(take_array(bytes, pos)?) as usize)
}

fn take_str(bytes: &[u8], pos: &mut usize) -> Result<String, Error> {
    let size = take_len(bytes, pos)?;
    let chunk = take(bytes, pos, size)?;
    String::from_utf8(chunk.to_vec())
        .map_err(|_| Error::NotInstantiable("string is not valid utf-8".to_string()))
}

fn decode_value(bytes: &[u8], pos: &mut usize) -> Result<Value, Error> {
    let tag = take(bytes, pos, 1)?[0];
    Ok(match tag {
        NULL => Value::Null,
        BOOL => match take(bytes, pos, 1)?[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => {
                return Err(Error::NotInstantiable(format!(
                    "invalid bool byte 0x{:02x}",
                    other
                )));
            }
        },
        INT => Value::Int(i64::from_le_bytes(take_array(bytes, pos)?)),
        FLOAT => Value::Float(f64::from_le_bytes(take_array(bytes, pos)?)),
        STR => Value::Str(take_str(bytes, pos)?),
        BYTES => {
            let size = take_len(bytes, pos)?;
            Value::Bytes(take(bytes, pos, size)?.to_vec())
        }
        LIST => {
            let count = take_len(bytes, pos)?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(decode_value(bytes, pos)?);
            }
            Value::List(values)
        }
        RECORD => {
            let count = take_len(bytes, pos)?;
            let mut fields = std::collections::BTreeMap::new();
            for _ in 0..count {
                let key = take_str(bytes, pos)?;
                let value = decode_value(bytes, pos)?;
                fields.insert(key, value);
            }
            Value::Record(fields)
        }
        other => {
            return Err(Error::NotInstantiable(format!(
                "unknown type tag 0x{:02x}",
                other
            )));
        }
    })
}
