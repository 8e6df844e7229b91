//! ## Plain Object Transfer Protocol (POTP)
//!
//! POTP lets a process expose local objects ("avatars") at a network address
//! and lets remote processes drive them through client-side stand-ins
//! ("proxies") without a schema or IDL: the member list is discovered when
//! the proxy attaches.
//!
//! The crate is layered bottom-up:
//!
//! - [`transport`]: length-prefixed byte frames over TCP, with a server
//!   accept loop and one worker task per connection.
//! - [`codec`]: converts envelope values to and from frame payloads.
//! - [`endpoint`]: the request/reply envelope, the handler registry and the
//!   dispatch state machine.
//! - [`avatar`]: avatars and proxies on top of an endpoint, member discovery
//!   plus invocation forwarding.
//!
//! Addresses are written as URIs, `potp://tcp@host:port[/handler-id]`, where
//! the optional handler segment selects a non-default handler of the target
//! endpoint.

pub mod avatar;
pub mod config;
pub mod endpoint;
pub mod sap;
pub mod transport;

pub use codec;
pub use codec::{Codec, Value};

/// A failure reported by the remote side of an exchange.
///
/// Handler and avatar-member errors cross the wire as a descriptor record
/// (`kind` + `message` + optional payload) and are rebuilt into this type at
/// the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub payload: Option<Value>,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Renders the error as its wire descriptor record.
    pub fn to_value(&self) -> Value {
        let mut fields = vec![
            ("kind", Value::Str(self.kind.clone())),
            ("message", Value::Str(self.message.clone())),
        ];
        if let Some(payload) = &self.payload {
            fields.push(("payload", payload.clone()));
        }

        Value::record(fields)
    }

    /// Rebuilds the error from a wire descriptor record.
    ///
    /// Returns `None` when the value does not carry the descriptor shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        let kind = value.get("kind")?.as_str()?.to_string();
        let message = value.get("message")?.as_str()?.to_string();
        Some(Self {
            kind,
            message,
            payload: value.get("payload").cloned(),
        })
    }
}

impl std::error::Error for RemoteError {}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[derive(Debug)]
pub enum Error {
    /// A required envelope key is missing.
    MissingMessageKey(String),
    /// An inbound request carries no source and the endpoint does not accept
    /// anonymous traffic.
    AnonymousMessage,
    /// A reply carries no source and the endpoint does not accept anonymous
    /// traffic.
    AnonymousReply,
    /// The envelope payload is not a record.
    InvalidMessageFormat,
    /// No handler is registered under the requested id.
    HandlerNotFound(String),
    /// The endpoint cannot serve because no handler is registered.
    NoDefaultHandler,
    /// The default handler cannot be removed while it is the default.
    CannotUnregisterDefault,
    /// The string does not parse as a POTP URI or SAP.
    InvalidUri(String),
    /// A client operation was attempted without an active connection.
    EndpointNotConnected,
    /// The reply addresses a different endpoint than the requester.
    MismatchedReply,
    /// The remote handler failed; the inner error carries the reported cause.
    Handler(RemoteError),
    TransportOpen(std::io::Error),
    TransportConnect(std::io::Error),
    TransportIo(std::io::Error),
    TransportNotConnected,
    Codec(codec::Error),
    /// The configuration file could not be read or parsed.
    Config(String),
    /// The avatar discovery reply is missing or malformed.
    CannotAttach(String),
    /// An avatar export name is empty, duplicated or reserved.
    InvalidMemberName(String),
    /// The proxy has no stub under the requested name.
    NoSuchMember(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMessageKey(key) => {
                write!(f, "the key \"{}\" is missing in the message", key)
            }
            Self::AnonymousMessage => write!(f, "message is from anonymous"),
            Self::AnonymousReply => write!(f, "reply is from anonymous"),
            Self::InvalidMessageFormat => write!(f, "message should be a record"),
            Self::HandlerNotFound(id) => {
                write!(f, "handler with id=\"{}\" not registered in endpoint", id)
            }
            Self::NoDefaultHandler => write!(
                f,
                "endpoint cannot run in server mode because no handler is registered"
            ),
            Self::CannotUnregisterDefault => write!(
                f,
                "default handler cannot be unregistered, change the default handler first"
            ),
            Self::InvalidUri(uri) => write!(f, "cannot decode \"{}\" as POTP URI", uri),
            Self::EndpointNotConnected => {
                write!(f, "endpoint is disconnected, connect first")
            }
            Self::MismatchedReply => {
                write!(f, "reply belongs to another endpoint's request")
            }
            Self::Handler(inner) => write!(f, "handler exception: {}", inner),
            Self::TransportOpen(e) => write!(f, "unable to open transport: {}", e),
            Self::TransportConnect(e) => write!(f, "unable to connect transport: {}", e),
            Self::TransportIo(e) => write!(f, "error in transport: {}", e),
            Self::TransportNotConnected => write!(f, "transport is not connected yet"),
            Self::Codec(e) => write!(f, "{}", e),
            Self::Config(cause) => write!(f, "cannot load configuration: {}", cause),
            Self::CannotAttach(aid) => write!(f, "cannot get avatar [{}]", aid),
            Self::InvalidMemberName(name) => {
                write!(f, "\"{}\" cannot be exported as an avatar member", name)
            }
            Self::NoSuchMember(name) => {
                write!(f, "proxy has no member named \"{}\"", name)
            }
        }
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        Self::Codec(value)
    }
}

impl From<RemoteError> for Error {
    fn from(value: RemoteError) -> Self {
        Self::Handler(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// 128 random bits as lower-hex; endpoint, avatar and proxy identities.
pub(crate) fn generate_id() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
