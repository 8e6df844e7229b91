use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use codec::{Codec, Value, binary::BinaryCodec};
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::{
    Error, RemoteError, Result,
    config::Config,
    generate_id,
    sap::{Sap, Uri},
    transport::TcpTransport,
};

/// A request handler registered at an endpoint.
///
/// Takes the application payload of one request and produces the reply
/// payload; a failure crosses the wire as an exception descriptor and is
/// re-raised at the caller. The dispatcher invokes handlers synchronously on
/// the connection's worker task.
pub type RequestHandler =
    Arc<dyn Fn(Value) -> std::result::Result<Value, RemoteError> + Send + Sync>;

struct Inner {
    id: String,
    codec: Arc<dyn Codec>,
    transport: TcpTransport,
    handlers: RwLock<AHashMap<String, RequestHandler>>,
    default_handler: RwLock<Option<String>>,
    dest_handler: RwLock<Option<String>>,
    anonymous: AtomicBool,
    allow_anonymous: bool,
    request_timeout: Option<Duration>,
    serving: watch::Sender<bool>,
}

/// An addressable POTP participant.
///
/// One endpoint type covers all roles: register handlers and call
/// [`Endpoint::server_loop`] to serve, call [`Endpoint::connect`] and
/// [`Endpoint::request`] to act as a client, or do both at once. Cloning is
/// cheap and clones share the same endpoint, so one clone can serve on a
/// background task while another drives it.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    pub fn new(config: Config) -> Self {
        Self::with_codec(config, Arc::new(BinaryCodec))
    }

    pub fn with_codec(config: Config, codec: Arc<dyn Codec>) -> Self {
        let id = generate_id();
        log::debug!("endpoint created: id={}", id);

        Self {
            inner: Arc::new(Inner {
                transport: TcpTransport::new(config.connect_timeout(), config.max_frame_size),
                request_timeout: config.request_timeout(),
                allow_anonymous: config.allow_anonymous,
                anonymous: AtomicBool::new(config.anonymous),
                handlers: RwLock::new(AHashMap::new()),
                default_handler: RwLock::new(None),
                dest_handler: RwLock::new(None),
                serving: watch::channel(false).0,
                codec,
                id,
            }),
        }
    }

    /// The endpoint identity, stable for the life of the process.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn transport(&self) -> &TcpTransport {
        &self.inner.transport
    }

    /// The endpoint reference, `potp://<sap>`.
    ///
    /// The SAP carries the concrete port once the endpoint is serving.
    pub fn uri(&self) -> String {
        format!(
            "potp://{}",
            self.inner.transport.sap().unwrap_or(Sap::Null)
        )
    }

    pub fn server_enabled(&self) -> bool {
        self.inner.transport.server_mode()
    }

    pub fn client_enabled(&self) -> bool {
        self.inner.transport.client_mode()
    }

    pub fn anonymous(&self) -> bool {
        self.inner.anonymous.load(Ordering::Relaxed)
    }

    /// Hide or expose the endpoint identity in outgoing requests.
    pub fn set_anonymous(&self, anonymous: bool) {
        self.inner.anonymous.store(anonymous, Ordering::Relaxed);
    }

    pub fn allow_anonymous(&self) -> bool {
        self.inner.allow_anonymous
    }

    /// Adds a handler to the registry and returns its id.
    ///
    /// A missing id is generated. The first registered handler becomes the
    /// default destination for requests without a handler segment.
    pub fn register<F>(&self, handler: F, id: Option<&str>) -> String
    where
        F: Fn(Value) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let id = id.map(str::to_string).unwrap_or_else(generate_id);
        log::debug!("register handler: id={}", id);

        self.inner
            .handlers
            .write()
            .insert(id.clone(), Arc::new(handler));

        let mut default_handler = self.inner.default_handler.write();
        if default_handler.is_none() {
            log::debug!("set default handler: id={}", id);
            *default_handler = Some(id.clone());
        }

        id
    }

    pub fn set_default(&self, id: &str) -> Result<()> {
        if !self.inner.handlers.read().contains_key(id) {
            return Err(Error::HandlerNotFound(id.to_string()));
        }

        log::debug!("set default handler: id={}", id);
        *self.inner.default_handler.write() = Some(id.to_string());
        Ok(())
    }

    pub fn default_handler(&self) -> Option<String> {
        self.inner.default_handler.read().clone()
    }

    /// Removes a handler from the registry.
    ///
    /// The current default cannot be removed; change the default first.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut handlers = self.inner.handlers.write();
        if !handlers.contains_key(id) {
            return Err(Error::HandlerNotFound(id.to_string()));
        }

        if self.inner.default_handler.read().as_deref() == Some(id) {
            return Err(Error::CannotUnregisterDefault);
        }

        log::debug!("unregister handler: id={}", id);
        handlers.remove(id);
        Ok(())
    }

    /// Opens the transport and serves until [`Endpoint::stop_serving`] is
    /// called, then closes the transport.
    ///
    /// Without a SAP a free tcp port on all interfaces is chosen.
    pub async fn server_loop(&self, sap: Option<Sap>) -> Result<()> {
        self.start_serving(sap).await?;

        let mut serving = self.inner.serving.subscribe();
        let _ = serving.wait_for(|serving| !*serving).await;

        self.inner.transport.close().await;
        Ok(())
    }

    /// Binds the dispatcher, opens the transport and returns once listening.
    ///
    /// Fails with [`Error::NoDefaultHandler`] when nothing is registered,
    /// since such an endpoint could answer no request at all.
    pub async fn start_serving(&self, sap: Option<Sap>) -> Result<()> {
        if self.inner.default_handler.read().is_none() {
            return Err(Error::NoDefaultHandler);
        }

        let inner = self.inner.clone();
        self.inner
            .transport
            .bind(move |frame| inner.dispatch(frame));
        self.inner
            .transport
            .open(sap.unwrap_or_else(Sap::any))
            .await?;
        self.inner.serving.send_replace(true);

        log::info!("endpoint serving: id={}, uri={}", self.inner.id, self.uri());
        Ok(())
    }

    /// Requests the server loop to exit; safe to call from any task.
    ///
    /// In-flight handler invocations are allowed to complete.
    pub fn stop_serving(&self) {
        log::debug!("shutdown received: id={}", self.inner.id);
        self.inner.serving.send_replace(false);
    }

    /// Connects the client side to a remote endpoint.
    ///
    /// The URI's optional handler segment becomes the destination of
    /// subsequent [`Endpoint::request`] calls.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        let uri: Uri = uri.parse()?;
        log::debug!("endpoint connect: id={}, uri={}", self.inner.id, uri);

        self.inner.transport.connect(&uri.sap).await?;
        *self.inner.dest_handler.write() = uri.handler;
        Ok(())
    }

    pub async fn disconnect(&self) {
        log::debug!("endpoint disconnect: id={}", self.inner.id);
        self.inner.transport.disconnect().await;
        *self.inner.dest_handler.write() = None;
    }

    /// Sends one request to the connected endpoint and returns the reply
    /// payload, re-raising remote failures.
    pub async fn request(&self, payload: Value) -> Result<Value> {
        self.request_to(payload, None).await
    }

    /// Like [`Endpoint::request`] with an explicit destination handler,
    /// overriding the one taken from the connect URI.
    pub async fn request_to(&self, payload: Value, dest: Option<&str>) -> Result<Value> {
        if !self.inner.transport.client_mode() {
            return Err(Error::EndpointNotConnected);
        }

        let src = if self.anonymous() {
            Value::Null
        } else {
            Value::Str(self.inner.id.clone())
        };
        let dest = dest
            .map(str::to_string)
            .or_else(|| self.inner.dest_handler.read().clone())
            .map(Value::Str)
            .unwrap_or(Value::Null);

        let request = Value::record([("req", payload), ("src", src), ("dest", dest)]);
        let frame = self.inner.codec.encode(&request)?;

        let reply = match self.inner.request_timeout {
            Some(limit) => tokio::time::timeout(limit, self.inner.transport.send_request(&frame))
                .await
                .map_err(|_| {
                    Error::TransportIo(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "request timed out",
                    ))
                })??,
            None => self.inner.transport.send_request(&frame).await?,
        };

        self.check_reply(self.inner.codec.decode(&reply)?)
    }

    /// Validates a reply envelope and extracts its outcome.
    fn check_reply(&self, reply: Value) -> Result<Value> {
        let Value::Record(mut fields) = reply else {
            return Err(Error::InvalidMessageFormat);
        };

        let error = match fields.get("error") {
            Some(Value::Bool(error)) => *error,
            Some(_) => return Err(Error::InvalidMessageFormat),
            None => return Err(Error::MissingMessageKey("error".to_string())),
        };

        if !error && !fields.contains_key("ret") {
            return Err(Error::MissingMessageKey("ret".to_string()));
        }

        if error && !fields.contains_key("exception") {
            return Err(Error::MissingMessageKey("exception".to_string()));
        }

        if is_anonymous(&fields, "src") && !self.inner.allow_anonymous {
            return Err(Error::AnonymousReply);
        }

        // A reply addressed to another endpoint cannot belong to this
        // request; per-connection ordering makes any mismatch a protocol
        // violation.
        if let Some(Value::Str(dest)) = fields.get("dest") {
            if *dest != self.inner.id {
                return Err(Error::MismatchedReply);
            }
        }

        if error {
            match fields.remove("exception") {
                Some(descriptor) => Err(rebuild_error(&descriptor)),
                None => Err(Error::MissingMessageKey("exception".to_string())),
            }
        } else {
            fields
                .remove("ret")
                .ok_or_else(|| Error::MissingMessageKey("ret".to_string()))
        }
    }
}

impl Inner {
    /// Serves one inbound frame: decode, validate, route, reply.
    ///
    /// Every outcome is a reply frame; validation failures produce canned
    /// error replies instead of terminating the connection.
    fn dispatch(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let reply = self.dispatch_request(frame);
        match self.codec.encode(&reply) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::error!("reply not serializable: id={}, err={}", self.id, e);
                None
            }
        }
    }

    fn dispatch_request(&self, frame: &[u8]) -> Value {
        let request = match self.codec.decode(frame) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("undecodable request: id={}, err={}", self.id, e);
                return error_reply(Error::MissingMessageKey("envelope".to_string()), None);
            }
        };

        let Value::Record(fields) = request else {
            log::debug!("request is not a record: id={}", self.id);
            return error_reply(Error::InvalidMessageFormat, None);
        };

        let src = match fields.get("src") {
            Some(Value::Null) | None => None,
            Some(src) => Some(src.clone()),
        };

        if src.is_none() && !self.allow_anonymous {
            log::debug!("anonymous messages not allowed: id={}", self.id);
            return error_reply(Error::AnonymousMessage, None);
        }

        for key in ["req", "dest"] {
            if !fields.contains_key(key) {
                log::debug!("missing key in request: id={}, key={}", self.id, key);
                return error_reply(Error::MissingMessageKey(key.to_string()), src);
            }
        }

        let dest = match fields.get("dest") {
            Some(Value::Str(dest)) => Some(dest.clone()),
            Some(Value::Null) | None => None,
            Some(_) => return error_reply(Error::InvalidMessageFormat, src),
        };
        let dest = match dest.or_else(|| self.default_handler.read().clone()) {
            Some(dest) => dest,
            None => {
                return error_reply(Error::HandlerNotFound("default".to_string()), src);
            }
        };

        let handler = match self.handlers.read().get(&dest) {
            Some(handler) => handler.clone(),
            None => {
                log::debug!("unknown destination: id={}, dest={}", self.id, dest);
                return error_reply(Error::HandlerNotFound(dest), src);
            }
        };

        let Some(req) = fields.get("req").cloned() else {
            return error_reply(Error::MissingMessageKey("req".to_string()), src);
        };

        log::debug!("request received: id={}, dest={}", self.id, dest);

        let mut reply = BTreeMap::new();
        reply.insert("src".to_string(), Value::Str(dest));
        reply.insert("dest".to_string(), src.unwrap_or(Value::Null));

        // The handler runs outside the registry lock, so registration stays
        // possible while a request is in flight.
        match handler(req) {
            Ok(ret) => {
                reply.insert("error".to_string(), Value::Bool(false));
                reply.insert("ret".to_string(), ret);
            }
            Err(e) => {
                log::debug!("request raised exception: id={}, kind={}", self.id, e.kind);
                reply.insert("error".to_string(), Value::Bool(true));
                reply.insert("exception".to_string(), e.to_value());
            }
        }

        Value::Record(reply)
    }
}

fn is_anonymous(fields: &BTreeMap<String, Value>, key: &str) -> bool {
    matches!(fields.get(key), Some(Value::Null) | None)
}

/// A canned reply reporting a validation failure to the requester.
fn error_reply(error: Error, request_src: Option<Value>) -> Value {
    Value::record([
        ("src", Value::Null),
        ("dest", request_src.unwrap_or(Value::Null)),
        ("error", Value::Bool(true)),
        ("exception", error_descriptor(&error)),
    ])
}

/// Renders a protocol error as its wire descriptor.
pub(crate) fn error_descriptor(error: &Error) -> Value {
    if let Error::Handler(remote) = error {
        return remote.to_value();
    }

    let (kind, payload) = match error {
        Error::MissingMessageKey(key) => ("MissingMessageKey", Some(Value::Str(key.clone()))),
        Error::AnonymousMessage => ("AnonymousMessage", None),
        Error::InvalidMessageFormat => ("InvalidMessageFormat", None),
        Error::HandlerNotFound(id) => ("HandlerNotFound", Some(Value::Str(id.clone()))),
        _ => ("Error", None),
    };

    let mut remote = RemoteError::new(kind, error.to_string());
    if let Some(payload) = payload {
        remote = remote.with_payload(payload);
    }

    remote.to_value()
}

/// Rebuilds the error a reply descriptor reports.
///
/// Protocol kinds map back to their typed variants; anything else surfaces
/// as a remote handler failure.
pub(crate) fn rebuild_error(descriptor: &Value) -> Error {
    let Some(remote) = RemoteError::from_value(descriptor) else {
        return Error::MissingMessageKey("exception".to_string());
    };

    let payload_str = |remote: &RemoteError| {
        remote
            .payload
            .as_ref()
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };

    match remote.kind.as_str() {
        "MissingMessageKey" => Error::MissingMessageKey(payload_str(&remote)),
        "AnonymousMessage" => Error::AnonymousMessage,
        "InvalidMessageFormat" => Error::InvalidMessageFormat,
        "HandlerNotFound" => Error::HandlerNotFound(payload_str(&remote)),
        _ => Error::Handler(remote),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_round_trip_through_descriptors() {
        for error in [
            Error::MissingMessageKey("req".to_string()),
            Error::AnonymousMessage,
            Error::InvalidMessageFormat,
            Error::HandlerNotFound("calculator".to_string()),
        ] {
            let descriptor = error_descriptor(&error);
            let rebuilt = rebuild_error(&descriptor);
            assert_eq!(format!("{:?}", rebuilt), format!("{:?}", error));
        }
    }

    #[test]
    fn handler_errors_keep_kind_and_message() {
        let error = Error::Handler(
            RemoteError::new("DivisionByZero", "division by zero")
                .with_payload(Value::Int(0)),
        );

        match rebuild_error(&error_descriptor(&error)) {
            Error::Handler(remote) => {
                assert_eq!(remote.kind, "DivisionByZero");
                assert_eq!(remote.message, "division by zero");
                assert_eq!(remote.payload, Some(Value::Int(0)));
            }
            other => panic!("expected a handler error, got {:?}", other),
        }
    }
}
