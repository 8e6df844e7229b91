use std::{collections::BTreeMap, sync::Arc};

use ahash::AHashMap;
use codec::Value;
use parking_lot::RwLock;

use crate::{
    Error, RemoteError, Result,
    endpoint::{Endpoint, rebuild_error},
    generate_id,
};

/// Names the avatar sub-protocol claims for itself.
const RESERVED_NAMES: [&str; 3] = ["attach", "members", "dispatch_request"];

/// An avatar member taking positional and keyword arguments.
pub type MemberFn = Box<
    dyn Fn(&[Value], &BTreeMap<String, Value>) -> std::result::Result<Value, RemoteError>
        + Send
        + Sync,
>;

/// An avatar property; evaluated on every remote read.
pub type PropertyFn = Box<dyn Fn() -> std::result::Result<Value, RemoteError> + Send + Sync>;

#[derive(Default)]
struct Exports {
    members: AHashMap<String, MemberFn>,
    properties: AHashMap<String, PropertyFn>,
}

impl Exports {
    fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name) || self.properties.contains_key(name)
    }
}

/// A local object published for remote invocation.
///
/// The export set is declared explicitly: the user registers `(name,
/// function)` pairs for members and `(name, getter)` pairs for properties,
/// then attaches the avatar to a serving endpoint. Proxies discover the
/// declared names at attach time and forward invocations to them.
///
/// ```no_run
/// use potp::{avatar::Avatar, Value};
///
/// let mut counter = Avatar::new();
/// counter
///     .export_member("add", |args, _| {
///         Ok(Value::Int(args.iter().filter_map(Value::as_int).sum()))
///     })
///     .unwrap();
/// ```
pub struct Avatar {
    id: String,
    exports: Arc<RwLock<Exports>>,
}

impl Avatar {
    pub fn new() -> Self {
        Self {
            id: generate_id(),
            exports: Arc::new(RwLock::new(Exports::default())),
        }
    }

    /// The avatar identity; proxies attach to it.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The URI a proxy connects to, `<endpoint-uri>/<avatar-id>`.
    pub fn uri(&self, endpoint: &Endpoint) -> String {
        format!("{}/{}", endpoint.uri(), self.id)
    }

    /// Exports a callable member under `name`.
    ///
    /// Names must be non-empty, unique across members and properties, and
    /// none of the reserved sub-protocol names.
    pub fn export_member<F>(&mut self, name: &str, member: F) -> Result<()>
    where
        F: Fn(&[Value], &BTreeMap<String, Value>) -> std::result::Result<Value, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        let mut exports = self.exports.write();
        check_name(name, &exports)?;
        exports.members.insert(name.to_string(), Box::new(member));
        Ok(())
    }

    /// Exports a property under `name`; the getter runs at every remote
    /// read, so the caller always sees the current value.
    pub fn export_property<F>(&mut self, name: &str, property: F) -> Result<()>
    where
        F: Fn() -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
    {
        let mut exports = self.exports.write();
        check_name(name, &exports)?;
        exports
            .properties
            .insert(name.to_string(), Box::new(property));
        Ok(())
    }

    /// Publishes the avatar on an endpoint by registering its dispatch
    /// handler under the avatar id.
    ///
    /// The avatar stays published until the endpoint stops serving.
    pub fn attach(&self, endpoint: &Endpoint) {
        log::debug!("avatar attach: aid={}", self.id);

        let aid = self.id.clone();
        let exports = self.exports.clone();
        endpoint.register(
            move |request| dispatch_request(&aid, &exports, request),
            Some(&self.id),
        );
    }
}

impl Default for Avatar {
    fn default() -> Self {
        Self::new()
    }
}

fn check_name(name: &str, exports: &Exports) -> Result<()> {
    if name.is_empty() || RESERVED_NAMES.contains(&name) || exports.contains(name) {
        return Err(Error::InvalidMemberName(name.to_string()));
    }

    Ok(())
}

/// The avatar side of the discovery+invocation sub-protocol.
fn dispatch_request(
    aid: &str,
    exports: &Arc<RwLock<Exports>>,
    request: Value,
) -> std::result::Result<Value, RemoteError> {
    let Value::Record(fields) = request else {
        return Err(RemoteError::new(
            "InvalidMessageFormat",
            "avatar request is not a record",
        ));
    };

    let exports = exports.read();

    // Discovery request
    if fields.contains_key("attach") {
        log::debug!("proxy requests to attach: aid={}", aid);

        let mut members: Vec<_> = exports.members.keys().cloned().collect();
        let mut properties: Vec<_> = exports.properties.keys().cloned().collect();
        members.sort();
        properties.sort();

        return Ok(Value::record([
            ("members", Value::List(members.into_iter().map(Value::Str).collect())),
            (
                "properties",
                Value::List(properties.into_iter().map(Value::Str).collect()),
            ),
        ]));
    }

    // Invocation request
    let Some(Value::Str(name)) = fields.get("member") else {
        return Err(RemoteError::new(
            "MissingMessageKey",
            "avatar request carries no member name",
        ));
    };

    let args = match fields.get("args") {
        Some(Value::List(args)) => args.clone(),
        _ => vec![],
    };
    let kwargs = match fields.get("kwargs") {
        Some(Value::Record(kwargs)) => kwargs.clone(),
        _ => BTreeMap::new(),
    };

    log::debug!("proxy requests member: aid={}, member={}", aid, name);

    let mut reply = BTreeMap::new();
    let outcome = if let Some(property) = exports.properties.get(name.as_str()) {
        reply.insert("property".to_string(), Value::Bool(true));
        property()
    } else if let Some(member) = exports.members.get(name.as_str()) {
        member(&args, &kwargs)
    } else {
        Err(RemoteError::new(
            "UnknownMember",
            format!("avatar has no member \"{}\"", name),
        ))
    };

    match outcome {
        Ok(value) => {
            reply.insert("return".to_string(), value);
        }
        Err(e) => {
            log::debug!("member raised exception: aid={}, kind={}", aid, e.kind);
            reply.remove("property");
            reply.insert("return".to_string(), e.to_value());
            reply.insert("is_exception".to_string(), Value::Bool(true));
        }
    }

    Ok(Value::Record(reply))
}

/// A client-side stand-in for a remote avatar.
///
/// Attaching issues the discovery request and freezes the member and
/// property name sets; afterwards every declared name has a stub reachable
/// through [`AvatarProxy::call`] and [`AvatarProxy::get`], and undeclared
/// names fail locally without touching the wire.
pub struct AvatarProxy {
    endpoint: Endpoint,
    pid: String,
    aid: Option<String>,
    members: Vec<String>,
    properties: Vec<String>,
    attached: bool,
}

impl AvatarProxy {
    /// Creates a detached proxy over a connected client endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            pid: generate_id(),
            aid: None,
            members: vec![],
            properties: vec![],
            attached: false,
            endpoint,
        }
    }

    /// Creates a proxy and attaches it immediately.
    pub async fn attach_to(endpoint: Endpoint, aid: Option<&str>) -> Result<Self> {
        let mut proxy = Self::new(endpoint);
        proxy.attach(aid).await?;
        Ok(proxy)
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    /// Member names discovered at attach time.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Property names discovered at attach time.
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    /// Performs the attach handshake with the remote avatar.
    ///
    /// Without an explicit avatar id the request goes to the destination
    /// handler of the endpoint's connect URI. A missing or malformed
    /// discovery reply fails with [`Error::CannotAttach`].
    pub async fn attach(&mut self, aid: Option<&str>) -> Result<()> {
        self.aid = aid.map(str::to_string);
        log::debug!("requesting attachment: aid={:?}, pid={}", self.aid, self.pid);

        let request = Value::record([("attach", Value::Str(self.pid.clone()))]);
        let reply = self
            .endpoint
            .request_to(request, self.aid.as_deref())
            .await
            .map_err(|e| {
                log::debug!("attach request failed: aid={:?}, err={}", self.aid, e);
                self.cannot_attach()
            })?;

        let members = string_list(reply.get("members")).ok_or_else(|| self.cannot_attach())?;
        let properties = string_list(reply.get("properties")).ok_or_else(|| self.cannot_attach())?;

        self.members = members;
        self.properties = properties;
        self.attached = true;
        Ok(())
    }

    /// Invokes a remote member with positional arguments.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_kwargs(name, args, BTreeMap::new()).await
    }

    /// Invokes a remote member with positional and keyword arguments.
    pub async fn call_with_kwargs(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        if !self.members.iter().any(|member| member == name) {
            return Err(Error::NoSuchMember(name.to_string()));
        }

        self.invoke(name, args, kwargs).await
    }

    /// Reads a remote property; the avatar materializes the value at the
    /// call site.
    pub async fn get(&self, name: &str) -> Result<Value> {
        if !self.properties.iter().any(|property| property == name) {
            return Err(Error::NoSuchMember(name.to_string()));
        }

        self.invoke(name, vec![], BTreeMap::new()).await
    }

    async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value> {
        log::debug!("requesting member: aid={:?}, member={}", self.aid, name);

        let request = Value::record([
            ("member", Value::Str(name.to_string())),
            ("args", Value::List(args)),
            ("kwargs", Value::Record(kwargs)),
        ]);

        let reply = self.endpoint.request_to(request, self.aid.as_deref()).await?;
        let Value::Record(mut fields) = reply else {
            return Err(Error::InvalidMessageFormat);
        };

        let ret = fields
            .remove("return")
            .ok_or_else(|| Error::MissingMessageKey("return".to_string()))?;

        if matches!(fields.get("is_exception"), Some(Value::Bool(true))) {
            return Err(rebuild_error(&ret));
        }

        Ok(ret)
    }

    fn cannot_attach(&self) -> Error {
        Error::CannotAttach(self.aid.clone().unwrap_or_else(|| "default".to_string()))
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value?
        .as_list()?
        .iter()
        .map(|name| name.as_str().map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_names_are_validated() {
        let mut avatar = Avatar::new();
        avatar.export_member("sum", |_, _| Ok(Value::Null)).unwrap();

        for name in ["", "attach", "members", "dispatch_request", "sum"] {
            assert!(matches!(
                avatar.export_member(name, |_, _| Ok(Value::Null)),
                Err(Error::InvalidMemberName(_))
            ));
            assert!(matches!(
                avatar.export_property(name, || Ok(Value::Null)),
                Err(Error::InvalidMemberName(_))
            ));
        }

        // a property cannot shadow a member either
        assert!(avatar.export_property("sum", || Ok(Value::Null)).is_err());
    }

    #[test]
    fn dispatch_reports_unknown_members() {
        let avatar = Avatar::new();
        let request = Value::record([
            ("member", Value::from("missing")),
            ("args", Value::List(vec![])),
        ]);

        let reply = dispatch_request(avatar.id(), &avatar.exports, request).unwrap();

        assert_eq!(reply.get("is_exception"), Some(&Value::Bool(true)));
        let descriptor = reply.get("return").unwrap();
        assert_eq!(descriptor.get("kind").unwrap().as_str(), Some("UnknownMember"));
    }
}
