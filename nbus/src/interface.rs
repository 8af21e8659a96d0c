//! Declarative interface descriptions.
//!
//! An [`Interface`] is a first-class value describing methods, signals and
//! properties, with the handler for each member attached at construction
//! time. The object server dispatches incoming calls against these tables;
//! proxies use handler-less descriptions parsed from introspection XML.

use std::{fmt, future::Future, sync::Arc};

use futures_util::future::BoxFuture;
use nvariant::{ObjectPath, Signature, Value};

use crate::{
    fdo,
    names::{InterfaceName, MemberName, UniqueName},
    Connection, Error, Result,
};

/// What a method handler resolves to: the reply body, or an error reply.
pub type MethodResult = std::result::Result<Vec<Value>, fdo::Error>;

/// A method implementation. Returning a future defers the reply until it
/// resolves.
pub type MethodHandler = Arc<dyn Fn(MethodCall) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// A property read accessor.
pub type PropertyGetter = Arc<dyn Fn() -> fdo::Result<Value> + Send + Sync>;

/// A property write accessor.
pub type PropertySetter = Arc<dyn Fn(Value) -> fdo::Result<()> + Send + Sync>;

/// Wrap an async closure as a [`MethodHandler`].
pub fn method_handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

/// Everything a method handler gets to see about the call it is serving.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// The connection the call arrived on; replies and signals go back
    /// through it.
    pub connection: Connection,
    /// The path the call was addressed to.
    pub path: ObjectPath,
    /// The interface the dispatcher resolved the call to.
    pub interface: InterfaceName,
    /// The method name.
    pub member: MemberName,
    /// The decoded arguments.
    pub args: Vec<Value>,
    /// The caller's unique bus name, from the `SENDER` header field.
    pub sender: Option<UniqueName>,
    /// Whether the caller asked for no reply.
    pub no_reply: bool,
}

/// A method of an interface.
#[derive(Clone)]
pub struct Method {
    name: MemberName,
    in_sig: Signature,
    out_sig: Signature,
    handler: Option<MethodHandler>,
    annotations: Vec<Annotation>,
}

impl Method {
    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn in_sig(&self) -> &Signature {
        &self.in_sig
    }

    pub fn out_sig(&self) -> &Signature {
        &self.out_sig
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub(crate) fn handler(&self) -> Option<&MethodHandler> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("in_sig", &self.in_sig)
            .field("out_sig", &self.out_sig)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// A signal of an interface.
#[derive(Debug, Clone)]
pub struct Signal {
    name: MemberName,
    sig: Signature,
}

impl Signal {
    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }
}

/// Whether a property can be read, written, or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writeable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

/// How property changes are announced via
/// `org.freedesktop.DBus.Properties.PropertiesChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitsChanged {
    /// The signal carries the new value.
    #[default]
    True,
    /// The signal only names the property as invalidated.
    Invalidates,
    /// No signal is emitted.
    False,
}

/// A property of an interface.
#[derive(Clone)]
pub struct Property {
    name: MemberName,
    sig: Signature,
    access: Access,
    emits_changed: EmitsChanged,
    getter: Option<PropertyGetter>,
    setter: Option<PropertySetter>,
}

impl Property {
    pub fn name(&self) -> &MemberName {
        &self.name
    }

    pub fn sig(&self) -> &Signature {
        &self.sig
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn emits_changed(&self) -> EmitsChanged {
        self.emits_changed
    }

    pub(crate) fn getter(&self) -> Option<&PropertyGetter> {
        self.getter.as_ref()
    }

    pub(crate) fn setter(&self) -> Option<&PropertySetter> {
        self.setter.as_ref()
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("sig", &self.sig)
            .field("access", &self.access)
            .field("emits_changed", &self.emits_changed)
            .finish()
    }
}

/// A freeform annotation on an interface member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub name: String,
    pub value: String,
}

/// A named set of methods, signals and properties.
#[derive(Debug, Clone)]
pub struct Interface {
    name: InterfaceName,
    methods: Vec<Method>,
    signals: Vec<Signal>,
    properties: Vec<Property>,
}

impl Interface {
    pub fn builder<I>(name: I) -> Result<Builder>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        Ok(Builder {
            interface: Interface {
                name: name.try_into().map_err(Into::into)?,
                methods: Vec::new(),
                signals: Vec::new(),
                properties: Vec::new(),
            },
        })
    }

    pub fn name(&self) -> &InterfaceName {
        &self.name
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name.as_str() == name)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name.as_str() == name)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name.as_str() == name)
    }
}

/// Builds an [`Interface`] member by member.
pub struct Builder {
    interface: Interface,
}

impl Builder {
    /// Declare a method. `handler` may be `None` for proxy-side
    /// descriptions; exported objects need one.
    pub fn method<M, I, O>(
        mut self,
        name: M,
        in_sig: I,
        out_sig: O,
        handler: Option<MethodHandler>,
    ) -> Result<Self>
    where
        M: TryInto<MemberName>,
        I: TryInto<Signature>,
        O: TryInto<Signature>,
        M::Error: Into<Error>,
        I::Error: Into<Error>,
        O::Error: Into<Error>,
    {
        let name = name.try_into().map_err(Into::into)?;
        if self.interface.method(name.as_str()).is_some() {
            return Err(Error::Failure(format!(
                "method `{name}` declared twice on {}",
                self.interface.name
            )));
        }
        self.interface.methods.push(Method {
            name,
            in_sig: in_sig.try_into().map_err(Into::into)?,
            out_sig: out_sig.try_into().map_err(Into::into)?,
            handler,
            annotations: Vec::new(),
        });
        Ok(self)
    }

    /// Declare a signal.
    pub fn signal<M, S>(mut self, name: M, sig: S) -> Result<Self>
    where
        M: TryInto<MemberName>,
        S: TryInto<Signature>,
        M::Error: Into<Error>,
        S::Error: Into<Error>,
    {
        let name = name.try_into().map_err(Into::into)?;
        if self.interface.signal(name.as_str()).is_some() {
            return Err(Error::Failure(format!(
                "signal `{name}` declared twice on {}",
                self.interface.name
            )));
        }
        self.interface.signals.push(Signal {
            name,
            sig: sig.try_into().map_err(Into::into)?,
        });
        Ok(self)
    }

    /// Declare a property. The signature must be a single complete type.
    pub fn property<M, S>(
        mut self,
        name: M,
        sig: S,
        access: Access,
        emits_changed: EmitsChanged,
        getter: Option<PropertyGetter>,
        setter: Option<PropertySetter>,
    ) -> Result<Self>
    where
        M: TryInto<MemberName>,
        S: TryInto<Signature>,
        M::Error: Into<Error>,
        S::Error: Into<Error>,
    {
        let name = name.try_into().map_err(Into::into)?;
        let sig: Signature = sig.try_into().map_err(Into::into)?;
        sig.single_type()?;
        if self.interface.property(name.as_str()).is_some() {
            return Err(Error::Failure(format!(
                "property `{name}` declared twice on {}",
                self.interface.name
            )));
        }
        self.interface.properties.push(Property {
            name,
            sig,
            access,
            emits_changed,
            getter,
            setter,
        });
        Ok(self)
    }

    /// Attach an annotation to the most recently declared method.
    pub fn annotate(mut self, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let method = self.interface.methods.last_mut().ok_or_else(|| {
            Error::Failure("annotate called before any method was declared".to_string())
        })?;
        method.annotations.push(Annotation {
            name: name.into(),
            value: value.into(),
        });
        Ok(self)
    }

    pub fn build(self) -> Interface {
        self.interface
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_duplicates() {
        let builder = Interface::builder("org.example.Iface")
            .unwrap()
            .method("Echo", "s", "s", None)
            .unwrap();
        assert!(builder.method("Echo", "s", "s", None).is_err());
    }

    #[test]
    fn property_signature_must_be_single() {
        let builder = Interface::builder("org.example.Iface").unwrap();
        assert!(builder
            .property("Broken", "ss", Access::Read, EmitsChanged::True, None, None)
            .is_err());
    }

    #[test]
    fn lookup_by_name() {
        let iface = Interface::builder("org.example.Iface")
            .unwrap()
            .method("Echo", "s", "s", None)
            .unwrap()
            .signal("Pinged", "u")
            .unwrap()
            .property("Level", "i", Access::ReadWrite, EmitsChanged::False, None, None)
            .unwrap()
            .build();
        assert!(iface.method("Echo").is_some());
        assert!(iface.method("Absent").is_none());
        assert_eq!(iface.signal("Pinged").unwrap().sig(), &"u");
        assert_eq!(iface.property("Level").unwrap().access(), Access::ReadWrite);
    }
}
