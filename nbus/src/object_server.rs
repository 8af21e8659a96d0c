//! The local object registry: exported objects, method demultiplexing and
//! the standard interface responders.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, RwLock},
};

use nvariant::{Dict, ObjectPath, Signature, Type as ValueType, Value};
use tracing::{debug, warn};

use crate::{
    fdo,
    interface::{EmitsChanged, Interface, Method, MethodCall, PropertyGetter},
    message::{Builder as MessageBuilder, Flags, Message},
    names::{InterfaceName, MemberName},
    xml, Connection, Error, Result, WeakConnection,
};

pub(crate) const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
pub(crate) const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub(crate) const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// An object exported at one path: an ordered list of interfaces plus the
/// explicit `(member) -> interface` bindings that disambiguate members
/// shared between interfaces.
#[derive(Debug)]
pub struct Object {
    interfaces: Vec<Interface>,
    bindings: HashMap<MemberName, InterfaceName>,
}

impl Object {
    /// An object implementing `interfaces`, in declaration order.
    pub fn new(interfaces: Vec<Interface>) -> Self {
        Object {
            interfaces,
            bindings: HashMap::new(),
        }
    }

    /// Bind `member` to a specific interface, overriding the
    /// declaration-order lookup used for calls without an `INTERFACE`
    /// header.
    pub fn bind<M, I>(mut self, member: M, interface: I) -> Result<Self>
    where
        M: TryInto<MemberName>,
        I: TryInto<InterfaceName>,
        M::Error: Into<Error>,
        I::Error: Into<Error>,
    {
        let member = member.try_into().map_err(Into::into)?;
        let interface = interface.try_into().map_err(Into::into)?;
        let bound = self
            .interface(interface.as_str())
            .and_then(|i| i.method(member.as_str()));
        if bound.is_none() {
            return Err(Error::Failure(format!(
                "cannot bind `{member}`: no such method on {interface}"
            )));
        }
        self.bindings.insert(member, interface);
        Ok(self)
    }

    fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name().as_str() == name)
    }

    /// Resolve a call to `(interface, method)` per the dispatch policy:
    /// explicit header, else explicit binding, else declaration order.
    fn resolve(
        &self,
        interface: Option<&InterfaceName>,
        member: &str,
    ) -> std::result::Result<(InterfaceName, Method), fdo::Error> {
        match interface {
            Some(name) => match self.interface(name.as_str()) {
                Some(iface) => match iface.method(member) {
                    Some(method) => Ok((iface.name().clone(), method.clone())),
                    None => Err(fdo::Error::UnknownMethod(format!(
                        "no method `{member}` on {name}"
                    ))),
                },
                None => Err(fdo::Error::UnknownMethod(format!(
                    "no interface {name} on this object"
                ))),
            },
            None => {
                if let Some(bound) = self.bindings.get(member) {
                    let method = self
                        .interface(bound.as_str())
                        .and_then(|i| i.method(member));
                    if let Some(method) = method {
                        return Ok((bound.clone(), method.clone()));
                    }
                }
                for iface in &self.interfaces {
                    if let Some(method) = iface.method(member) {
                        return Ok((iface.name().clone(), method.clone()));
                    }
                }
                Err(fdo::Error::UnknownMethod(format!(
                    "no method `{member}` on this object"
                )))
            }
        }
    }

    fn property(
        &self,
        interface: &str,
        name: &str,
    ) -> std::result::Result<(&Interface, &crate::interface::Property), fdo::Error> {
        if interface.is_empty() {
            // An empty interface string asks for a search across all
            // interfaces.
            for iface in &self.interfaces {
                if let Some(property) = iface.property(name) {
                    return Ok((iface, property));
                }
            }
            return Err(fdo::Error::UnknownProperty(format!(
                "no property `{name}` on this object"
            )));
        }
        let iface = self.interface(interface).ok_or_else(|| {
            fdo::Error::UnknownInterface(format!("no interface {interface} on this object"))
        })?;
        let property = iface.property(name).ok_or_else(|| {
            fdo::Error::UnknownProperty(format!("no property `{name}` on {interface}"))
        })?;
        Ok((iface, property))
    }
}

/// The three standard interfaces every exported object answers, as
/// introspection data.
fn standard_interfaces() -> Result<Vec<Interface>> {
    Ok(vec![
        Interface::builder(PEER_IFACE)?
            .method("Ping", "", "", None)?
            .method("GetMachineId", "", "s", None)?
            .build(),
        Interface::builder(INTROSPECTABLE_IFACE)?
            .method("Introspect", "", "s", None)?
            .build(),
        Interface::builder(PROPERTIES_IFACE)?
            .method("Get", "ss", "v", None)?
            .method("Set", "ssv", "", None)?
            .method("GetAll", "s", "a{sv}", None)?
            .signal("PropertiesChanged", "sa{sv}as")?
            .build(),
    ])
}

/// The standard members resolvable without an `INTERFACE` header.
fn standard_member(member: &str) -> Option<&'static str> {
    match member {
        "Ping" | "GetMachineId" => Some(PEER_IFACE),
        "Introspect" => Some(INTROSPECTABLE_IFACE),
        "Get" | "Set" | "GetAll" => Some(PROPERTIES_IFACE),
        _ => None,
    }
}

/// The connection's registry of exported objects.
///
/// All mutation happens through the connection's handle; dispatch runs on
/// the connection's read task.
#[derive(Debug)]
pub struct ObjectServer {
    conn: OnceLock<WeakConnection>,
    objects: RwLock<HashMap<ObjectPath, Object>>,
}

impl ObjectServer {
    pub(crate) fn new() -> Self {
        ObjectServer {
            conn: OnceLock::new(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn set_connection(&self, conn: WeakConnection) {
        // A second registration can only happen through connection
        // construction, which creates the server itself.
        let _ = self.conn.set(conn);
    }

    fn connection(&self) -> Result<Connection> {
        self.conn
            .get()
            .and_then(WeakConnection::upgrade)
            .ok_or(Error::Disconnected)
    }

    /// Export `object` at `path`. Returns `false` without touching the
    /// registry when the path is already taken.
    pub fn at<P>(&self, path: P, object: Object) -> Result<bool>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        let path = path.try_into().map_err(Into::into)?;
        let mut objects = self.objects.write().expect("lock poisoned");
        if objects.contains_key(&path) {
            return Ok(false);
        }
        debug!("exporting object at {path}");
        objects.insert(path, object);
        Ok(true)
    }

    /// Remove the object at `path`. Returns `false` if none was exported.
    pub fn remove<P>(&self, path: P) -> Result<bool>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        let path = path.try_into().map_err(Into::into)?;
        Ok(self
            .objects
            .write()
            .expect("lock poisoned")
            .remove(&path)
            .is_some())
    }

    /// Emit a signal declared by one of the interfaces of the object at
    /// `path`, validating the body against the declared signature.
    pub fn emit_signal<P, I, M>(
        &self,
        path: P,
        interface: I,
        member: M,
        body: Vec<Value>,
    ) -> Result<()>
    where
        P: TryInto<ObjectPath>,
        I: TryInto<InterfaceName>,
        M: TryInto<MemberName>,
        P::Error: Into<Error>,
        I::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        let path = path.try_into().map_err(Into::into)?;
        let interface = interface.try_into().map_err(Into::into)?;
        let member = member.try_into().map_err(Into::into)?;

        {
            let objects = self.objects.read().expect("lock poisoned");
            let object = objects
                .get(&path)
                .ok_or_else(|| Error::Failure(format!("no object exported at {path}")))?;
            let declared = object
                .interface(interface.as_str())
                .and_then(|i| i.signal(member.as_str()))
                .ok_or_else(|| {
                    Error::Failure(format!("{interface} declares no signal `{member}`"))
                })?;
            nvariant::check_signature(&body, declared.sig())?;
        }

        let conn = self.connection()?;
        send_signal(&conn, &path, &interface, &member, body)
    }

    /// Direct child node names of `path`, for introspection.
    fn children_of(&self, path: &ObjectPath) -> Vec<String> {
        let objects = self.objects.read().expect("lock poisoned");
        let prefix = if path.as_str() == "/" {
            String::from("/")
        } else {
            format!("{path}/")
        };
        let mut children: Vec<String> = objects
            .keys()
            .filter_map(|p| p.as_str().strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty())
            .map(|rest| match rest.split_once('/') {
                Some((first, _)) => first.to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.sort();
        children.dedup();
        children
    }

    /// Serve one incoming method call. Always produces exactly one reply
    /// (return or error) unless the caller asked for none.
    pub(crate) async fn dispatch(&self, conn: &Connection, msg: Arc<Message>) {
        let no_reply = msg.flags().contains(Flags::NoReplyExpected);
        let result = self.dispatch_inner(conn, &msg).await;

        match result {
            Ok(Some(body)) => {
                if !no_reply {
                    if let Err(e) = send_reply(conn, &msg, body) {
                        warn!("failed to send reply: {e}");
                    }
                }
            }
            // The handler deferred the reply or asked us not to send one.
            Ok(None) => {}
            Err(e) => {
                if !no_reply {
                    if let Err(e) = send_error(conn, &msg, &e) {
                        warn!("failed to send error reply: {e}");
                    }
                }
            }
        }
    }

    async fn dispatch_inner(
        &self,
        conn: &Connection,
        msg: &Arc<Message>,
    ) -> std::result::Result<Option<Vec<Value>>, fdo::Error> {
        // PATH and MEMBER presence is guaranteed by decode-time validation.
        let path = msg
            .path()
            .cloned()
            .ok_or_else(|| fdo::Error::InvalidArgs("missing PATH".to_string()))?;
        let member = msg
            .member()
            .cloned()
            .ok_or_else(|| fdo::Error::InvalidArgs("missing MEMBER".to_string()))?;
        let header_iface = msg.interface().cloned();

        enum Target {
            Standard(&'static str),
            Method(InterfaceName, Method),
        }

        let target = {
            let objects = self.objects.read().expect("lock poisoned");
            let object = objects.get(&path).ok_or_else(|| {
                fdo::Error::UnknownObject(format!("no object exported at {path}"))
            })?;

            match header_iface.as_ref().map(InterfaceName::as_str) {
                Some(PEER_IFACE) => Target::Standard(PEER_IFACE),
                Some(INTROSPECTABLE_IFACE) => Target::Standard(INTROSPECTABLE_IFACE),
                Some(PROPERTIES_IFACE) => Target::Standard(PROPERTIES_IFACE),
                _ => match object.resolve(header_iface.as_ref(), member.as_str()) {
                    Ok((interface, method)) => Target::Method(interface, method),
                    Err(e) => {
                        // Without an INTERFACE header the standard members
                        // are served after the object's own interfaces.
                        match (header_iface.is_none(), standard_member(member.as_str())) {
                            (true, Some(iface)) => Target::Standard(iface),
                            _ => return Err(e),
                        }
                    }
                },
            }
        };

        match target {
            Target::Standard(PEER_IFACE) => self.serve_peer(&member, msg),
            Target::Standard(INTROSPECTABLE_IFACE) => self.serve_introspect(&member, &path, msg),
            Target::Standard(_) => self.serve_properties(conn, &member, &path, msg),
            Target::Method(interface, method) => {
                let handler = method.handler().cloned().ok_or_else(|| {
                    fdo::Error::UnknownMethod(format!(
                        "method `{member}` has no handler attached"
                    ))
                })?;

                let args = msg.body().to_vec();
                let arg_types: Vec<ValueType> = args.iter().map(Value::ty).collect();
                if Signature::from_types(&arg_types) != *method.in_sig() {
                    return Err(fdo::Error::InvalidArgs(format!(
                        "call to {interface}.{member} expects `{}`",
                        method.in_sig()
                    )));
                }

                let call = MethodCall {
                    connection: conn.clone(),
                    path,
                    interface: interface.clone(),
                    member: member.clone(),
                    args,
                    sender: msg.sender().cloned(),
                    no_reply: msg.flags().contains(Flags::NoReplyExpected),
                };
                let body = handler.as_ref()(call).await?;

                let body_types: Vec<ValueType> = body.iter().map(Value::ty).collect();
                if Signature::from_types(&body_types) != *method.out_sig() {
                    warn!(
                        "handler for {interface}.{member} returned `{}`, declared `{}`",
                        Signature::from_types(&body_types),
                        method.out_sig()
                    );
                    return Err(fdo::Error::Failed(format!(
                        "handler for {member} returned a mismatched signature"
                    )));
                }
                Ok(Some(body))
            }
        }
    }

    fn serve_peer(
        &self,
        member: &MemberName,
        msg: &Message,
    ) -> std::result::Result<Option<Vec<Value>>, fdo::Error> {
        expect_args(msg, "")?;
        match member.as_str() {
            "Ping" => Ok(Some(vec![])),
            "GetMachineId" => {
                let id = machine_id()?;
                Ok(Some(vec![Value::from(id)]))
            }
            other => Err(fdo::Error::UnknownMethod(format!(
                "no method `{other}` on {PEER_IFACE}"
            ))),
        }
    }

    fn serve_introspect(
        &self,
        member: &MemberName,
        path: &ObjectPath,
        msg: &Message,
    ) -> std::result::Result<Option<Vec<Value>>, fdo::Error> {
        expect_args(msg, "")?;
        if member.as_str() != "Introspect" {
            return Err(fdo::Error::UnknownMethod(format!(
                "no method `{member}` on {INTROSPECTABLE_IFACE}"
            )));
        }

        let children = self.children_of(path);
        let objects = self.objects.read().expect("lock poisoned");
        let object = objects
            .get(path)
            .ok_or_else(|| fdo::Error::UnknownObject(format!("no object exported at {path}")))?;

        let standard = standard_interfaces().map_err(|e| fdo::Error::Failed(e.to_string()))?;
        let mut interfaces: Vec<&Interface> = object.interfaces.iter().collect();
        interfaces.extend(standard.iter());

        let xml = xml::emit(&interfaces, &children);
        Ok(Some(vec![Value::from(xml)]))
    }

    fn serve_properties(
        &self,
        conn: &Connection,
        member: &MemberName,
        path: &ObjectPath,
        msg: &Message,
    ) -> std::result::Result<Option<Vec<Value>>, fdo::Error> {
        match member.as_str() {
            "Get" => {
                expect_args(msg, "ss")?;
                let (iface, name) = two_strings(msg)?;
                let getter = {
                    let objects = self.objects.read().expect("lock poisoned");
                    let object = objects.get(path).ok_or_else(|| {
                        fdo::Error::UnknownObject(format!("no object exported at {path}"))
                    })?;
                    let (_, property) = object.property(&iface, &name)?;
                    if !property.access().readable() {
                        return Err(fdo::Error::AccessDenied(format!(
                            "property `{name}` is write-only"
                        )));
                    }
                    property
                        .getter()
                        .cloned()
                        .ok_or_else(|| {
                            fdo::Error::Failed(format!("property `{name}` has no getter"))
                        })?
                };
                let value = getter.as_ref()()?;
                Ok(Some(vec![value.into_variant()]))
            }
            "GetAll" => {
                expect_args(msg, "s")?;
                let iface = match msg.body().first() {
                    Some(Value::Str(s)) => s.clone(),
                    _ => return Err(fdo::Error::InvalidArgs("expected `s`".to_string())),
                };
                let getters = {
                    let objects = self.objects.read().expect("lock poisoned");
                    let object = objects.get(path).ok_or_else(|| {
                        fdo::Error::UnknownObject(format!("no object exported at {path}"))
                    })?;
                    let matching: Vec<&Interface> = if iface.is_empty() {
                        object.interfaces.iter().collect()
                    } else {
                        match object.interface(&iface) {
                            Some(i) => vec![i],
                            None => {
                                return Err(fdo::Error::UnknownInterface(format!(
                                    "no interface {iface} on this object"
                                )))
                            }
                        }
                    };
                    let mut getters: Vec<(String, PropertyGetter)> = Vec::new();
                    for iface in matching {
                        for property in iface.properties() {
                            if let (true, Some(getter)) =
                                (property.access().readable(), property.getter())
                            {
                                getters.push((property.name().to_string(), getter.clone()));
                            }
                        }
                    }
                    getters
                };

                let mut dict = Dict::new(ValueType::String, ValueType::Variant)
                    .map_err(|e| fdo::Error::Failed(e.to_string()))?;
                for (name, getter) in getters {
                    match getter.as_ref()() {
                        Ok(value) => dict
                            .insert(Value::from(name), value.into_variant())
                            .map_err(|e| fdo::Error::Failed(e.to_string()))?,
                        Err(e) => warn!("skipping property `{name}` in GetAll: {e}"),
                    }
                }
                Ok(Some(vec![Value::Dict(dict)]))
            }
            "Set" => {
                expect_args(msg, "ssv")?;
                let (iface, name) = two_strings(msg)?;
                let value = match msg.body().get(2) {
                    Some(Value::Variant(inner)) => (**inner).clone(),
                    _ => return Err(fdo::Error::InvalidArgs("expected `ssv`".to_string())),
                };

                let (setter, emits, resolved_iface, declared_sig) = {
                    let objects = self.objects.read().expect("lock poisoned");
                    let object = objects.get(path).ok_or_else(|| {
                        fdo::Error::UnknownObject(format!("no object exported at {path}"))
                    })?;
                    let (owner, property) = object.property(&iface, &name)?;
                    if !property.access().writeable() {
                        return Err(fdo::Error::PropertyReadOnly(format!(
                            "property `{name}` cannot be written"
                        )));
                    }
                    let setter = property.setter().cloned().ok_or_else(|| {
                        fdo::Error::PropertyReadOnly(format!("property `{name}` has no setter"))
                    })?;
                    (
                        setter,
                        property.emits_changed(),
                        owner.name().clone(),
                        property.sig().clone(),
                    )
                };

                let declared = declared_sig
                    .single_type()
                    .map_err(|e| fdo::Error::Failed(e.to_string()))?;
                if !value.matches(&declared) {
                    return Err(fdo::Error::InvalidArgs(format!(
                        "property `{name}` has type `{declared_sig}`"
                    )));
                }

                setter.as_ref()(value.clone())?;
                self.emit_properties_changed(conn, path, &resolved_iface, &name, value, emits);
                Ok(Some(vec![]))
            }
            other => Err(fdo::Error::UnknownMethod(format!(
                "no method `{other}` on {PROPERTIES_IFACE}"
            ))),
        }
    }

    fn emit_properties_changed(
        &self,
        conn: &Connection,
        path: &ObjectPath,
        interface: &InterfaceName,
        name: &str,
        value: Value,
        emits: EmitsChanged,
    ) {
        let (changed, invalidated) = match emits {
            EmitsChanged::True => (Some((name, value)), vec![]),
            EmitsChanged::Invalidates => (None, vec![name.to_string()]),
            EmitsChanged::False => return,
        };

        let result = (|| -> Result<()> {
            let mut changed_dict = Dict::new(ValueType::String, ValueType::Variant)?;
            if let Some((name, value)) = changed {
                changed_dict.insert(Value::from(name), value.into_variant())?;
            }
            let mut invalidated_array = nvariant::Array::new(ValueType::String);
            for name in invalidated {
                invalidated_array.push(Value::from(name))?;
            }
            let body = vec![
                Value::from(interface.as_str()),
                Value::Dict(changed_dict),
                Value::Array(invalidated_array),
            ];
            send_signal(
                conn,
                path,
                &InterfaceName::from_str_unchecked(PROPERTIES_IFACE),
                &MemberName::from_str_unchecked("PropertiesChanged"),
                body,
            )
        })();
        if let Err(e) = result {
            warn!("failed to emit PropertiesChanged for `{name}`: {e}");
        }
    }
}

fn expect_args(msg: &Message, signature: &str) -> std::result::Result<(), fdo::Error> {
    if msg.body_signature().as_str() != signature {
        return Err(fdo::Error::InvalidArgs(format!(
            "expected `{signature}`, got `{}`",
            msg.body_signature()
        )));
    }
    Ok(())
}

fn two_strings(msg: &Message) -> std::result::Result<(String, String), fdo::Error> {
    match (msg.body().first(), msg.body().get(1)) {
        (Some(Value::Str(a)), Some(Value::Str(b))) => Ok((a.clone(), b.clone())),
        _ => Err(fdo::Error::InvalidArgs("expected two strings".to_string())),
    }
}

fn machine_id() -> std::result::Result<String, fdo::Error> {
    for path in ["/var/lib/dbus/machine-id", "/etc/machine-id"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }
    }
    Err(fdo::Error::Failed(
        "no machine id available on this system".to_string(),
    ))
}

fn send_reply(conn: &Connection, call: &Message, body: Vec<Value>) -> Result<()> {
    let mut builder = MessageBuilder::method_return(call)?;
    if let Some(name) = conn.unique_name() {
        builder = builder.sender(name.clone())?;
    }
    let reply = builder.body(body)?.build()?;
    conn.send(reply)?;
    Ok(())
}

fn send_error(conn: &Connection, call: &Message, error: &fdo::Error) -> Result<()> {
    let mut builder = MessageBuilder::error(call, error.name())?;
    if let Some(name) = conn.unique_name() {
        builder = builder.sender(name.clone())?;
    }
    // Error replies carry the message as their single string argument.
    let reply = builder
        .body(vec![Value::from(error.message())])?
        .build()?;
    conn.send(reply)?;
    Ok(())
}

fn send_signal(
    conn: &Connection,
    path: &ObjectPath,
    interface: &InterfaceName,
    member: &MemberName,
    body: Vec<Value>,
) -> Result<()> {
    let mut builder = MessageBuilder::signal(path.clone(), interface.clone(), member.clone())?;
    if let Some(name) = conn.unique_name() {
        builder = builder.sender(name.clone())?;
    }
    let signal = builder.body(body)?.build()?;
    conn.send(signal)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{method_handler, Access};

    fn iface(name: &str, methods: &[&str]) -> Interface {
        let mut builder = Interface::builder(name).unwrap();
        for method in methods {
            builder = builder
                .method(
                    *method,
                    "",
                    "",
                    Some(method_handler(|_call| async { Ok(vec![]) })),
                )
                .unwrap();
        }
        builder.build()
    }

    #[test]
    fn declaration_order_wins_without_header() {
        let object = Object::new(vec![
            iface("org.example.A", &["Common", "OnlyA"]),
            iface("org.example.B", &["Common"]),
        ]);

        let (resolved, _) = object.resolve(None, "Common").unwrap();
        assert_eq!(resolved.as_str(), "org.example.A");

        let b = InterfaceName::try_from("org.example.B").unwrap();
        let (resolved, _) = object.resolve(Some(&b), "Common").unwrap();
        assert_eq!(resolved.as_str(), "org.example.B");
    }

    #[test]
    fn explicit_binding_overrides_declaration_order() {
        let object = Object::new(vec![
            iface("org.example.A", &["Common"]),
            iface("org.example.B", &["Common"]),
        ])
        .bind("Common", "org.example.B")
        .unwrap();

        let (resolved, _) = object.resolve(None, "Common").unwrap();
        assert_eq!(resolved.as_str(), "org.example.B");
    }

    #[test]
    fn binding_requires_the_method_to_exist() {
        let object = Object::new(vec![iface("org.example.A", &["M"])]);
        assert!(object.bind("Absent", "org.example.A").is_err());
    }

    #[test]
    fn unknown_members_are_reported() {
        let object = Object::new(vec![iface("org.example.A", &["M"])]);
        assert!(matches!(
            object.resolve(None, "Nope"),
            Err(fdo::Error::UnknownMethod(_))
        ));
        let missing = InterfaceName::try_from("org.example.Missing").unwrap();
        assert!(matches!(
            object.resolve(Some(&missing), "M"),
            Err(fdo::Error::UnknownMethod(_))
        ));
    }

    #[test]
    fn property_search_with_empty_interface() {
        let with_prop = Interface::builder("org.example.P")
            .unwrap()
            .property(
                "Level",
                "i",
                Access::Read,
                EmitsChanged::True,
                Some(Arc::new(|| Ok(Value::from(3i32)))),
                None,
            )
            .unwrap()
            .build();
        let object = Object::new(vec![iface("org.example.A", &["M"]), with_prop]);

        assert!(object.property("", "Level").is_ok());
        assert!(object.property("org.example.P", "Level").is_ok());
        assert!(matches!(
            object.property("", "Absent"),
            Err(fdo::Error::UnknownProperty(_))
        ));
        assert!(matches!(
            object.property("org.example.Q", "Level"),
            Err(fdo::Error::UnknownInterface(_))
        ));
    }

    #[test]
    fn standard_interfaces_build() {
        let interfaces = standard_interfaces().unwrap();
        assert_eq!(interfaces.len(), 3);
        assert!(interfaces[2].signal("PropertiesChanged").is_some());
    }
}
