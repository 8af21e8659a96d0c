//! Match rules: the filters a connection registers with the broker to
//! subscribe to messages, and the local predicate they compile to.

use std::fmt;

use nvariant::{ObjectPath, Value};

use crate::{
    message::{Message, Type},
    names::{BusName, InterfaceName, MemberName},
    Error, Result,
};

/// The highest argument index a rule may test.
pub const MAX_ARG_INDEX: u8 = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSpec {
    Path(ObjectPath),
    PathNamespace(ObjectPath),
}

/// A parsed match rule.
///
/// Serialized with [`fmt::Display`] into the comma-separated form `AddMatch`
/// takes; evaluated locally against incoming messages with
/// [`MatchRule::matches`].
///
/// A `sender` criterion is compared literally against the `SENDER` header
/// field, which on a message bus is always a unique name; matching on a
/// well-known sender name only works where the broker resolves it for us.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRule {
    msg_type: Option<Type>,
    sender: Option<BusName>,
    interface: Option<InterfaceName>,
    member: Option<MemberName>,
    path_spec: Option<PathSpec>,
    destination: Option<BusName>,
    args: Vec<(u8, String)>,
    arg0namespace: Option<InterfaceName>,
}

impl MatchRule {
    pub fn builder() -> Builder {
        Builder {
            rule: MatchRule::default(),
        }
    }

    pub fn msg_type(&self) -> Option<Type> {
        self.msg_type
    }

    pub fn sender(&self) -> Option<&BusName> {
        self.sender.as_ref()
    }

    pub fn interface(&self) -> Option<&InterfaceName> {
        self.interface.as_ref()
    }

    pub fn member(&self) -> Option<&MemberName> {
        self.member.as_ref()
    }

    pub fn path(&self) -> Option<&ObjectPath> {
        match &self.path_spec {
            Some(PathSpec::Path(path)) => Some(path),
            _ => None,
        }
    }

    pub fn path_namespace(&self) -> Option<&ObjectPath> {
        match &self.path_spec {
            Some(PathSpec::PathNamespace(ns)) => Some(ns),
            _ => None,
        }
    }

    /// Evaluate the rule against a message.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(msg_type) = self.msg_type {
            if msg.message_type() != msg_type {
                return false;
            }
        }
        if let Some(sender) = &self.sender {
            match msg.sender() {
                Some(actual) if actual.as_str() == sender.as_str() => {}
                _ => return false,
            }
        }
        if let Some(interface) = &self.interface {
            if msg.interface() != Some(interface) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if msg.member() != Some(member) {
                return false;
            }
        }
        match &self.path_spec {
            Some(PathSpec::Path(path)) => {
                if msg.path() != Some(path) {
                    return false;
                }
            }
            Some(PathSpec::PathNamespace(ns)) => {
                let Some(path) = msg.path() else {
                    return false;
                };
                if !path_in_namespace(path.as_str(), ns.as_str()) {
                    return false;
                }
            }
            None => {}
        }
        if let Some(destination) = &self.destination {
            match msg.destination() {
                Some(actual) if actual.as_str() == destination.as_str() => {}
                _ => return false,
            }
        }
        for (index, expected) in &self.args {
            // Argument matches only apply to string arguments.
            match msg.body().get(*index as usize) {
                Some(Value::Str(actual)) if actual == expected => {}
                _ => return false,
            }
        }
        if let Some(ns) = &self.arg0namespace {
            match msg.body().first() {
                Some(Value::Str(arg0)) if name_in_namespace(arg0, ns.as_str()) => {}
                _ => return false,
            }
        }

        true
    }
}

fn path_in_namespace(path: &str, ns: &str) -> bool {
    ns == "/" || path == ns || (path.starts_with(ns) && path.as_bytes()[ns.len()] == b'/')
}

fn name_in_namespace(name: &str, ns: &str) -> bool {
    name == ns || (name.starts_with(ns) && name.as_bytes()[ns.len()] == b'.')
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries = Vec::new();

        if let Some(msg_type) = self.msg_type {
            let name = match msg_type {
                Type::MethodCall => "method_call",
                Type::MethodReturn => "method_return",
                Type::Error => "error",
                Type::Signal => "signal",
                Type::Invalid => "invalid",
            };
            entries.push(format!("type='{name}'"));
        }
        if let Some(sender) = &self.sender {
            entries.push(format!("sender='{sender}'"));
        }
        if let Some(interface) = &self.interface {
            entries.push(format!("interface='{interface}'"));
        }
        if let Some(member) = &self.member {
            entries.push(format!("member='{member}'"));
        }
        match &self.path_spec {
            Some(PathSpec::Path(path)) => entries.push(format!("path='{path}'")),
            Some(PathSpec::PathNamespace(ns)) => entries.push(format!("path_namespace='{ns}'")),
            None => {}
        }
        if let Some(destination) = &self.destination {
            entries.push(format!("destination='{destination}'"));
        }
        for (index, value) in &self.args {
            entries.push(format!("arg{index}='{value}'"));
        }
        if let Some(ns) = &self.arg0namespace {
            entries.push(format!("arg0namespace='{ns}'"));
        }

        f.write_str(&entries.join(","))
    }
}

/// Builds a [`MatchRule`].
#[derive(Debug, Clone, Default)]
pub struct Builder {
    rule: MatchRule,
}

impl Builder {
    pub fn msg_type(mut self, msg_type: Type) -> Self {
        self.rule.msg_type = Some(msg_type);
        self
    }

    pub fn sender<S>(mut self, sender: S) -> Result<Self>
    where
        S: TryInto<BusName>,
        S::Error: Into<Error>,
    {
        self.rule.sender = Some(sender.try_into().map_err(Into::into)?);
        Ok(self)
    }

    pub fn interface<I>(mut self, interface: I) -> Result<Self>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        self.rule.interface = Some(interface.try_into().map_err(Into::into)?);
        Ok(self)
    }

    pub fn member<M>(mut self, member: M) -> Result<Self>
    where
        M: TryInto<MemberName>,
        M::Error: Into<Error>,
    {
        self.rule.member = Some(member.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Match an exact object path. Replaces any `path_namespace`.
    pub fn path<P>(mut self, path: P) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        self.rule.path_spec = Some(PathSpec::Path(path.try_into().map_err(Into::into)?));
        Ok(self)
    }

    /// Match a path and everything below it. Replaces any `path`.
    pub fn path_namespace<P>(mut self, ns: P) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        self.rule.path_spec = Some(PathSpec::PathNamespace(ns.try_into().map_err(Into::into)?));
        Ok(self)
    }

    pub fn destination<D>(mut self, destination: D) -> Result<Self>
    where
        D: TryInto<BusName>,
        D::Error: Into<Error>,
    {
        self.rule.destination = Some(destination.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Match a string argument by position.
    pub fn arg(mut self, index: u8, value: impl Into<String>) -> Result<Self> {
        if index > MAX_ARG_INDEX {
            return Err(Error::Failure(format!(
                "argument index {index} out of range"
            )));
        }
        let value = value.into();
        if value.contains('\'') {
            return Err(Error::Failure(
                "apostrophes cannot appear in match values".to_string(),
            ));
        }
        self.rule.args.retain(|(i, _)| *i != index);
        self.rule.args.push((index, value));
        self.rule.args.sort_by_key(|(i, _)| *i);
        Ok(self)
    }

    /// Match the first argument against a dotted-name namespace.
    pub fn arg0namespace<I>(mut self, ns: I) -> Result<Self>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        self.rule.arg0namespace = Some(ns.try_into().map_err(Into::into)?);
        Ok(self)
    }

    pub fn build(self) -> MatchRule {
        self.rule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Builder as MessageBuilder;

    fn signal_rule() -> MatchRule {
        MatchRule::builder()
            .msg_type(Type::Signal)
            .sender(":1.5")
            .unwrap()
            .interface("org.example.Iface")
            .unwrap()
            .member("Changed")
            .unwrap()
            .path("/org/example")
            .unwrap()
            .build()
    }

    fn signal_msg(path: &str, iface: &str, member: &str, body: Vec<Value>) -> Message {
        MessageBuilder::signal(path, iface, member)
            .unwrap()
            .sender(":1.5")
            .unwrap()
            .body(body)
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn serialized_form() {
        assert_eq!(
            signal_rule().to_string(),
            "type='signal',sender=':1.5',interface='org.example.Iface',\
             member='Changed',path='/org/example'"
        );
    }

    #[test]
    fn arg_serialization_and_order() {
        let rule = MatchRule::builder()
            .arg(3, "three")
            .unwrap()
            .arg(0, "zero")
            .unwrap()
            .build();
        assert_eq!(rule.to_string(), "arg0='zero',arg3='three'");
        assert!(MatchRule::builder().arg(64, "x").is_err());
        assert!(MatchRule::builder().arg(0, "it's").is_err());
    }

    #[test]
    fn full_match() {
        let rule = signal_rule();
        let msg = signal_msg("/org/example", "org.example.Iface", "Changed", vec![]);
        assert!(rule.matches(&msg));

        let wrong_member = signal_msg("/org/example", "org.example.Iface", "Other", vec![]);
        assert!(!rule.matches(&wrong_member));

        let wrong_path = signal_msg("/org/other", "org.example.Iface", "Changed", vec![]);
        assert!(!rule.matches(&wrong_path));
    }

    #[test]
    fn path_namespace_match() {
        let rule = MatchRule::builder()
            .path_namespace("/org/example")
            .unwrap()
            .build();
        assert!(rule.matches(&signal_msg("/org/example", "a.b", "S", vec![])));
        assert!(rule.matches(&signal_msg("/org/example/child", "a.b", "S", vec![])));
        assert!(!rule.matches(&signal_msg("/org/examples", "a.b", "S", vec![])));

        let root = MatchRule::builder().path_namespace("/").unwrap().build();
        assert!(root.matches(&signal_msg("/anything", "a.b", "S", vec![])));
    }

    #[test]
    fn arg_matching() {
        let rule = MatchRule::builder().arg(0, "hello").unwrap().build();
        assert!(rule.matches(&signal_msg("/p", "a.b", "S", vec![Value::from("hello")])));
        assert!(!rule.matches(&signal_msg("/p", "a.b", "S", vec![Value::from("other")])));
        // Non-string arguments never match.
        assert!(!rule.matches(&signal_msg("/p", "a.b", "S", vec![Value::from(5u32)])));
        assert!(!rule.matches(&signal_msg("/p", "a.b", "S", vec![])));
    }

    #[test]
    fn arg0namespace_match() {
        let rule = MatchRule::builder()
            .arg0namespace("org.example")
            .unwrap()
            .build();
        assert!(rule.matches(&signal_msg("/p", "a.b", "S", vec![Value::from("org.example")])));
        assert!(rule.matches(&signal_msg(
            "/p",
            "a.b",
            "S",
            vec![Value::from("org.example.Sub")]
        )));
        assert!(!rule.matches(&signal_msg("/p", "a.b", "S", vec![Value::from("org.examples")])));
    }
}
