use potp_codec::{Codec, Value, binary::BinaryCodec, json::JsonCodec};

fn request_envelope() -> Value {
    Value::record([
        ("src", Value::from("f81d4fae7dec11d0a76500a0c91e6bf6")),
        ("dest", Value::Null),
        (
            "req",
            Value::record([
                ("member", Value::from("sum")),
                ("args", Value::from(vec![Value::Int(10)])),
                ("kwargs", Value::record::<String, _>([])),
            ]),
        ),
    ])
}

fn reply_envelope() -> Value {
    Value::record([
        ("src", Value::from("handler-1")),
        ("dest", Value::from("f81d4fae7dec11d0a76500a0c91e6bf6")),
        ("error", Value::Bool(false)),
        (
            "ret",
            Value::from(vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(-7),
                Value::Float(2.5),
                Value::from("text"),
            ]),
        ),
    ])
}

#[test]
fn binary_envelope_round_trip() {
    let codec = BinaryCodec;

    for envelope in [request_envelope(), reply_envelope()] {
        let bytes = codec.encode(&envelope).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), envelope);
    }
}

#[test]
fn binary_bytes_round_trip() {
    let codec = BinaryCodec;
    let value = Value::record([("payload", Value::from(vec![0u8, 1, 2, 255]))]);

    let bytes = codec.encode(&value).unwrap();

    assert_eq!(codec.decode(&bytes).unwrap(), value);
}

#[test]
fn binary_rejects_malformed_input() {
    let codec = BinaryCodec;

    // unknown tag
    assert!(codec.decode(&[0xff]).is_err());
    // truncated string body
    assert!(codec.decode(&[0x04, 0x05, 0x00, 0x00, 0x00, b'h', b'i']).is_err());
    // truncated length header
    assert!(codec.decode(&[0x06, 0x01]).is_err());
    // trailing garbage after a complete value
    assert!(codec.decode(&[0x00, 0x00]).is_err());
    // empty input
    assert!(codec.decode(&[]).is_err());
}

#[test]
fn json_envelope_round_trip() {
    let codec = JsonCodec;

    for envelope in [request_envelope(), reply_envelope()] {
        let bytes = codec.encode(&envelope).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), envelope);
    }
}

#[test]
fn json_rejects_bytes_values() {
    let codec = JsonCodec;
    let value = Value::record([("payload", Value::from(vec![1u8, 2, 3]))]);

    assert!(codec.encode(&value).is_err());
}

#[test]
fn json_rejects_malformed_input() {
    let codec = JsonCodec;

    assert!(codec.decode(b"{\"x\":").is_err());
}
