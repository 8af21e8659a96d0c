//! Client-side proxies for remote objects.
//!
//! A [`Proxy`] binds a destination bus name and an object path on a
//! connection. Its interface descriptions come from introspection, from the
//! caller, or from a union of both (the caller's definitions win on
//! overlap), and drive local argument checking and member-to-interface
//! resolution.

use nvariant::{ObjectPath, StructInit, Structure, Value};
use tracing::debug;

use crate::{
    connection::{CallOptions, SignalHandler, SignalSubscription},
    interface::Interface,
    match_rule::MatchRule,
    message::Type,
    names::{BusName, InterfaceName, MemberName},
    object_server::{INTROSPECTABLE_IFACE, PROPERTIES_IFACE},
    xml, Connection, Error, Result,
};

/// The decoded body of a method reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    args: Vec<Value>,
}

impl Reply {
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    /// Collapse per reply arity: `None` for an empty reply, the bare value
    /// for a single-argument reply, a structure for anything longer.
    pub fn into_value(mut self) -> Option<Value> {
        match self.args.len() {
            0 => None,
            1 => Some(self.args.remove(0)),
            _ => Structure::from_init(StructInit::Ordered(self.args))
                .ok()
                .map(Value::Structure),
        }
    }
}

/// A handle to an object on a remote peer.
#[derive(Debug, Clone)]
pub struct Proxy {
    conn: Connection,
    destination: BusName,
    path: ObjectPath,
    preferred: Option<InterfaceName>,
    interfaces: Vec<Interface>,
}

impl Proxy {
    pub fn builder(conn: &Connection) -> Builder {
        Builder {
            conn: conn.clone(),
            destination: None,
            path: None,
            preferred: None,
            interfaces: Vec::new(),
            introspect: None,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn destination(&self) -> &BusName {
        &self.destination
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// The interface descriptions this proxy resolves members against.
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Resolve which interface a member belongs to: the preferred interface
    /// when it declares it, else the first declaring interface, else the
    /// preferred interface (the server may know more than we do), else no
    /// `INTERFACE` header at all.
    fn resolve_interface(&self, member: &str) -> Result<Option<InterfaceName>> {
        if let Some(preferred) = &self.preferred {
            let declared = self
                .interface(preferred.as_str())
                .map(|i| i.method(member).is_some())
                .unwrap_or(false);
            if declared {
                return Ok(Some(preferred.clone()));
            }
        }
        for iface in &self.interfaces {
            if iface.method(member).is_some() {
                return Ok(Some(iface.name().clone()));
            }
        }
        match (&self.preferred, self.interfaces.is_empty()) {
            (Some(preferred), _) => Ok(Some(preferred.clone())),
            (None, true) => Ok(None),
            (None, false) => Err(Error::Failure(format!(
                "no interface of {} declares a method `{member}`",
                self.destination
            ))),
        }
    }

    fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.name().as_str() == name)
    }

    /// Call `member` with default options and wait for the reply.
    pub async fn call(&self, member: &str, args: Vec<Value>) -> Result<Reply> {
        self.call_with(member, args, CallOptions::default()).await
    }

    /// Call `member` with explicit options. With `expect_reply` cleared, the
    /// reply resolves immediately and is empty.
    pub async fn call_with(
        &self,
        member: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Reply> {
        let interface = self.resolve_interface(member)?;
        self.call_on_interface(interface, member, args, options)
            .await
    }

    /// Call `member` on an explicitly chosen interface (or none), bypassing
    /// resolution.
    pub async fn call_on_interface(
        &self,
        interface: Option<InterfaceName>,
        member: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Reply> {
        // Check arguments locally when the member is declared.
        if let Some(declared) = interface
            .as_ref()
            .and_then(|i| self.interface(i.as_str()))
            .and_then(|i| i.method(member))
        {
            nvariant::check_signature(&args, declared.in_sig())?;
        }

        let reply = self
            .conn
            .call_with(
                Some(self.destination.clone()),
                self.path.clone(),
                interface,
                MemberName::try_from(member)?,
                args,
                options,
            )
            .await?;
        Ok(Reply {
            args: reply.map(|msg| msg.body().to_vec()).unwrap_or_default(),
        })
    }

    /// Read a property via `org.freedesktop.DBus.Properties.Get`. An empty
    /// `interface` searches all interfaces of the remote object.
    pub async fn get_property(&self, interface: &str, name: &str) -> Result<Value> {
        let reply = self
            .conn
            .call_method(
                Some(self.destination.clone()),
                self.path.clone(),
                Some(InterfaceName::from_str_unchecked(PROPERTIES_IFACE)),
                MemberName::from_str_unchecked("Get"),
                vec![Value::from(interface), Value::from(name)],
            )
            .await?;
        match reply.body().first() {
            Some(Value::Variant(inner)) => Ok((**inner).clone()),
            _ => Err(Error::Failure(
                "malformed Properties.Get reply".to_string(),
            )),
        }
    }

    /// Write a property via `org.freedesktop.DBus.Properties.Set`.
    pub async fn set_property(&self, interface: &str, name: &str, value: Value) -> Result<()> {
        self.conn
            .call_method(
                Some(self.destination.clone()),
                self.path.clone(),
                Some(InterfaceName::from_str_unchecked(PROPERTIES_IFACE)),
                MemberName::from_str_unchecked("Set"),
                vec![
                    Value::from(interface),
                    Value::from(name),
                    value.into_variant(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Fetch the remote object's raw introspection document.
    pub async fn introspect(&self) -> Result<String> {
        let reply = self
            .conn
            .call_method(
                Some(self.destination.clone()),
                self.path.clone(),
                Some(InterfaceName::from_str_unchecked(INTROSPECTABLE_IFACE)),
                MemberName::from_str_unchecked("Introspect"),
                vec![],
            )
            .await?;
        match reply.body().first() {
            Some(Value::Str(xml)) => Ok(xml.clone()),
            _ => Err(Error::Introspection(
                "malformed Introspect reply".to_string(),
            )),
        }
    }

    /// Subscribe to a signal of this proxy's object. The match rule binds
    /// the proxy's destination, path and (when resolvable) interface.
    pub async fn receive_signal(
        &self,
        signal_name: &str,
        handler: SignalHandler,
    ) -> Result<SignalSubscription> {
        let mut builder = MatchRule::builder()
            .msg_type(Type::Signal)
            .path(self.path.clone())?
            .member(signal_name)?;

        // Signals on a direct peer-to-peer link carry no SENDER field; the
        // criterion only makes sense against a bus.
        if self.conn.is_bus() {
            builder = builder.sender(self.destination.clone())?;
        }

        let declaring = self
            .interfaces
            .iter()
            .find(|i| i.signal(signal_name).is_some())
            .map(|i| i.name().clone())
            .or_else(|| self.preferred.clone());
        if let Some(interface) = declaring {
            builder = builder.interface(interface)?;
        }

        self.conn.add_match(builder.build(), handler).await
    }
}

/// Builds a [`Proxy`].
#[derive(Debug)]
pub struct Builder {
    conn: Connection,
    destination: Option<BusName>,
    path: Option<ObjectPath>,
    preferred: Option<InterfaceName>,
    interfaces: Vec<Interface>,
    introspect: Option<bool>,
}

impl Builder {
    pub fn destination<D>(mut self, destination: D) -> Result<Self>
    where
        D: TryInto<BusName>,
        D::Error: Into<Error>,
    {
        self.destination = Some(destination.try_into().map_err(Into::into)?);
        Ok(self)
    }

    pub fn path<P>(mut self, path: P) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        self.path = Some(path.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Prefer this interface when resolving members.
    pub fn interface<I>(mut self, interface: I) -> Result<Self>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        self.preferred = Some(interface.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Supply explicit interface descriptions. Unless
    /// [`Builder::introspect`] asks for it, this skips introspection.
    pub fn with_interfaces(mut self, interfaces: Vec<Interface>) -> Self {
        self.interfaces = interfaces;
        self
    }

    /// Force introspection on or off. The default is to introspect exactly
    /// when no explicit interfaces were supplied.
    pub fn introspect(mut self, introspect: bool) -> Self {
        self.introspect = Some(introspect);
        self
    }

    /// Construct the proxy, introspecting the remote object if called for.
    pub async fn build(self) -> Result<Proxy> {
        let destination = self
            .destination
            .ok_or_else(|| Error::Failure("proxy is missing a destination".to_string()))?;
        let path = self
            .path
            .ok_or_else(|| Error::Failure("proxy is missing a path".to_string()))?;

        let mut proxy = Proxy {
            conn: self.conn,
            destination,
            path,
            preferred: self.preferred,
            interfaces: self.interfaces,
        };

        let introspect = self.introspect.unwrap_or(proxy.interfaces.is_empty());
        if introspect {
            let document = proxy.introspect().await?;
            let parsed = xml::parse(&document)?;
            debug!(
                "introspected {} interfaces on {}{}",
                parsed.len(),
                proxy.destination,
                proxy.path
            );
            proxy.interfaces = merge_interfaces(proxy.interfaces, parsed)?;
        }

        Ok(proxy)
    }
}

/// The union of explicit and introspected descriptions; explicit
/// definitions win wherever both declare the same member.
fn merge_interfaces(explicit: Vec<Interface>, parsed: Vec<Interface>) -> Result<Vec<Interface>> {
    let mut merged = explicit;
    for iface in parsed {
        match merged
            .iter()
            .position(|existing| existing.name() == iface.name())
        {
            None => merged.push(iface),
            Some(at) => {
                let combined = merge_one(&merged[at], &iface)?;
                merged[at] = combined;
            }
        }
    }
    Ok(merged)
}

fn merge_one(explicit: &Interface, parsed: &Interface) -> Result<Interface> {
    let mut builder = Interface::builder(explicit.name().clone())?;
    for method in explicit.methods() {
        builder = builder.method(
            method.name().clone(),
            method.in_sig().clone(),
            method.out_sig().clone(),
            None,
        )?;
        for annotation in method.annotations() {
            builder = builder.annotate(annotation.name.clone(), annotation.value.clone())?;
        }
    }
    for method in parsed.methods() {
        if explicit.method(method.name().as_str()).is_none() {
            builder = builder.method(
                method.name().clone(),
                method.in_sig().clone(),
                method.out_sig().clone(),
                None,
            )?;
        }
    }
    for signal in explicit.signals() {
        builder = builder.signal(signal.name().clone(), signal.sig().clone())?;
    }
    for signal in parsed.signals() {
        if explicit.signal(signal.name().as_str()).is_none() {
            builder = builder.signal(signal.name().clone(), signal.sig().clone())?;
        }
    }
    for property in explicit
        .properties()
        .iter()
        .chain(
            parsed
                .properties()
                .iter()
                .filter(|p| explicit.property(p.name().as_str()).is_none()),
        )
    {
        builder = builder.property(
            property.name().clone(),
            property.sig().clone(),
            property.access(),
            property.emits_changed(),
            None,
            None,
        )?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, methods: &[(&str, &str, &str)]) -> Interface {
        let mut builder = Interface::builder(name).unwrap();
        for (method, in_sig, out_sig) in methods {
            builder = builder.method(*method, *in_sig, *out_sig, None).unwrap();
        }
        builder.build()
    }

    #[test]
    fn merge_prefers_explicit_definitions() {
        let explicit = vec![iface("org.example.I", &[("M", "s", "s")])];
        let parsed = vec![
            iface("org.example.I", &[("M", "i", "i"), ("Extra", "", "")]),
            iface("org.example.Other", &[("O", "", "")]),
        ];

        let merged = merge_interfaces(explicit, parsed).unwrap();
        assert_eq!(merged.len(), 2);

        let first = &merged[0];
        // The explicit signature for M survives; the introspected extra
        // member is added.
        assert_eq!(first.method("M").unwrap().in_sig().as_str(), "s");
        assert!(first.method("Extra").is_some());
        assert_eq!(merged[1].name().as_str(), "org.example.Other");
    }

    #[test]
    fn reply_value_shapes() {
        assert_eq!(Reply { args: vec![] }.into_value(), None);
        assert_eq!(
            Reply {
                args: vec![Value::from(7u32)]
            }
            .into_value(),
            Some(Value::from(7u32))
        );
        let both = Reply {
            args: vec![Value::from(7u32), Value::from("x")],
        }
        .into_value()
        .unwrap();
        assert!(matches!(both, Value::Structure(_)));
    }
}
