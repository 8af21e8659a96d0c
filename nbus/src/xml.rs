//! Introspection XML: deterministic generation and parsing.
//!
//! The wire format is the D-Bus introspection document: a `<node>` with
//! `<interface>` children, each declaring methods, signals and properties.

use quick_xml::{events::Event, Reader};

use crate::{
    interface::{Access, Annotation, EmitsChanged, Interface},
    Error, Result,
};

pub(crate) const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \
\"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \
\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

const EMITS_CHANGED_ANNOTATION: &str = "org.freedesktop.DBus.Property.EmitsChangedSignal";

fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

fn attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    escape_attr(value, out);
    out.push('"');
}

/// Generate the introspection document for a node implementing `interfaces`,
/// with `children` as its direct child node names.
///
/// The output is deterministic: interfaces appear in the order given, members
/// in declaration order.
pub(crate) fn emit(interfaces: &[&Interface], children: &[String]) -> String {
    let mut out = String::from(DOCTYPE);
    out.push_str("<node>\n");
    for iface in interfaces {
        out.push_str(" <interface");
        attr(&mut out, "name", iface.name().as_str());
        out.push_str(">\n");

        for method in iface.methods() {
            out.push_str("  <method");
            attr(&mut out, "name", method.name().as_str());
            out.push_str(">\n");
            for arg in method.in_sig().single_types() {
                out.push_str("   <arg");
                attr(&mut out, "type", arg);
                attr(&mut out, "direction", "in");
                out.push_str("/>\n");
            }
            for arg in method.out_sig().single_types() {
                out.push_str("   <arg");
                attr(&mut out, "type", arg);
                attr(&mut out, "direction", "out");
                out.push_str("/>\n");
            }
            for annotation in method.annotations() {
                out.push_str("   <annotation");
                attr(&mut out, "name", &annotation.name);
                attr(&mut out, "value", &annotation.value);
                out.push_str("/>\n");
            }
            out.push_str("  </method>\n");
        }

        for signal in iface.signals() {
            out.push_str("  <signal");
            attr(&mut out, "name", signal.name().as_str());
            out.push_str(">\n");
            for arg in signal.sig().single_types() {
                out.push_str("   <arg");
                attr(&mut out, "type", arg);
                out.push_str("/>\n");
            }
            out.push_str("  </signal>\n");
        }

        for property in iface.properties() {
            out.push_str("  <property");
            attr(&mut out, "name", property.name().as_str());
            attr(&mut out, "type", property.sig().as_str());
            attr(&mut out, "access", property.access().as_str());
            match property.emits_changed() {
                EmitsChanged::True => out.push_str("/>\n"),
                other => {
                    let value = match other {
                        EmitsChanged::Invalidates => "invalidates",
                        _ => "false",
                    };
                    out.push_str(">\n   <annotation");
                    attr(&mut out, "name", EMITS_CHANGED_ANNOTATION);
                    attr(&mut out, "value", value);
                    out.push_str("/>\n  </property>\n");
                }
            }
        }

        out.push_str(" </interface>\n");
    }
    for child in children {
        out.push_str(" <node");
        attr(&mut out, "name", child);
        out.push_str("/>\n");
    }
    out.push_str("</node>\n");
    out
}

#[derive(Debug, Default)]
struct PendingInterface {
    name: String,
    methods: Vec<PendingMethod>,
    signals: Vec<(String, String)>,
    properties: Vec<PendingProperty>,
}

#[derive(Debug, Default)]
struct PendingMethod {
    name: String,
    in_sig: String,
    out_sig: String,
    annotations: Vec<Annotation>,
}

#[derive(Debug)]
struct PendingProperty {
    name: String,
    sig: String,
    access: Access,
    emits_changed: EmitsChanged,
}

#[derive(Debug, PartialEq)]
enum Member {
    None,
    Method,
    Signal,
    Property,
}

/// Parse an introspection document into interface descriptions (with no
/// handlers attached).
pub fn parse(xml: &str) -> Result<Vec<Interface>> {
    let bad = |e: quick_xml::Error| Error::Introspection(e.to_string());

    let mut reader = Reader::from_str(xml);
    let mut interfaces = Vec::new();
    let mut current: Option<PendingInterface> = None;
    let mut member = Member::None;
    let mut node_depth = 0usize;

    loop {
        let event = reader.read_event().map_err(bad)?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                match e.name().as_ref() {
                    b"node" => {
                        if node_depth > 0 && !empty {
                            // A child node: its interfaces belong to another
                            // object.
                            reader.read_to_end(e.name()).map_err(bad)?;
                        } else if !empty {
                            node_depth += 1;
                        }
                    }
                    b"interface" => {
                        let name = attribute(e, "name")?.ok_or_else(|| {
                            Error::Introspection("interface without a name".to_string())
                        })?;
                        current = Some(PendingInterface {
                            name,
                            ..Default::default()
                        });
                        if empty {
                            if let Some(pending) = current.take() {
                                interfaces.push(build_interface(pending)?);
                            }
                        }
                    }
                    b"method" | b"signal" if current.is_some() => {
                        let name = attribute(e, "name")?.ok_or_else(|| {
                            Error::Introspection("member without a name".to_string())
                        })?;
                        let iface = current.as_mut().expect("checked above");
                        if e.name().as_ref() == b"method" {
                            iface.methods.push(PendingMethod {
                                name,
                                ..Default::default()
                            });
                            member = Member::Method;
                        } else {
                            iface.signals.push((name, String::new()));
                            member = Member::Signal;
                        }
                        if empty {
                            member = Member::None;
                        }
                    }
                    b"property" if current.is_some() => {
                        let iface = current.as_mut().expect("checked above");
                        let name = attribute(e, "name")?.ok_or_else(|| {
                            Error::Introspection("property without a name".to_string())
                        })?;
                        let sig = attribute(e, "type")?.ok_or_else(|| {
                            Error::Introspection("property without a type".to_string())
                        })?;
                        let access = match attribute(e, "access")?.as_deref() {
                            Some("write") => Access::Write,
                            Some("readwrite") => Access::ReadWrite,
                            _ => Access::Read,
                        };
                        iface.properties.push(PendingProperty {
                            name,
                            sig,
                            access,
                            emits_changed: EmitsChanged::True,
                        });
                        member = if empty { Member::None } else { Member::Property };
                    }
                    b"arg" if current.is_some() => {
                        let ty = attribute(e, "type")?.unwrap_or_default();
                        let direction = attribute(e, "direction")?;
                        let iface = current.as_mut().expect("checked above");
                        match member {
                            Member::Method => {
                                if let Some(method) = iface.methods.last_mut() {
                                    match direction.as_deref() {
                                        Some("out") => method.out_sig.push_str(&ty),
                                        // Method args default to "in".
                                        _ => method.in_sig.push_str(&ty),
                                    }
                                }
                            }
                            Member::Signal => {
                                if let Some((_, sig)) = iface.signals.last_mut() {
                                    sig.push_str(&ty);
                                }
                            }
                            _ => {}
                        }
                    }
                    b"annotation" if current.is_some() => {
                        let name = attribute(e, "name")?.unwrap_or_default();
                        let value = attribute(e, "value")?.unwrap_or_default();
                        let iface = current.as_mut().expect("checked above");
                        match member {
                            Member::Property => {
                                if name == EMITS_CHANGED_ANNOTATION {
                                    if let Some(property) = iface.properties.last_mut() {
                                        property.emits_changed = match value.as_str() {
                                            "invalidates" => EmitsChanged::Invalidates,
                                            "false" => EmitsChanged::False,
                                            _ => EmitsChanged::True,
                                        };
                                    }
                                }
                            }
                            Member::Method => {
                                if let Some(method) = iface.methods.last_mut() {
                                    method.annotations.push(Annotation { name, value });
                                }
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"interface" => {
                    if let Some(pending) = current.take() {
                        interfaces.push(build_interface(pending)?);
                    }
                }
                b"method" | b"signal" | b"property" => member = Member::None,
                b"node" => node_depth = node_depth.saturating_sub(1),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(interfaces)
}

fn attribute(e: &quick_xml::events::BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::Introspection(e.to_string()))?;
        if attr.key.as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::Introspection(e.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn build_interface(pending: PendingInterface) -> Result<Interface> {
    let mut builder = Interface::builder(pending.name.as_str())
        .map_err(|e| Error::Introspection(e.to_string()))?;
    for method in pending.methods {
        builder = builder
            .method(
                method.name.as_str(),
                method.in_sig.as_str(),
                method.out_sig.as_str(),
                None,
            )
            .map_err(|e| Error::Introspection(e.to_string()))?;
        for annotation in method.annotations {
            builder = builder
                .annotate(annotation.name, annotation.value)
                .map_err(|e| Error::Introspection(e.to_string()))?;
        }
    }
    for (name, sig) in pending.signals {
        builder = builder
            .signal(name.as_str(), sig.as_str())
            .map_err(|e| Error::Introspection(e.to_string()))?;
    }
    for property in pending.properties {
        builder = builder
            .property(
                property.name.as_str(),
                property.sig.as_str(),
                property.access,
                property.emits_changed,
                None,
                None,
            )
            .map_err(|e| Error::Introspection(e.to_string()))?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Interface {
        Interface::builder("org.example.Sample")
            .unwrap()
            .method("Echo", "s", "s", None)
            .unwrap()
            .annotate("org.freedesktop.DBus.Deprecated", "true")
            .unwrap()
            .method("Mix", "ia{sv}", "", None)
            .unwrap()
            .signal("Changed", "sv")
            .unwrap()
            .property(
                "Level",
                "i",
                Access::ReadWrite,
                EmitsChanged::Invalidates,
                None,
                None,
            )
            .unwrap()
            .build()
    }

    #[test]
    fn emit_parse_round_trip() {
        let iface = sample();
        let xml = emit(&[&iface], &["child".to_string()]);
        assert!(xml.starts_with("<!DOCTYPE node"));
        assert!(xml.contains("<node name=\"child\"/>"));

        let parsed = parse(&xml).unwrap();
        assert_eq!(parsed.len(), 1);
        let parsed = &parsed[0];
        assert_eq!(parsed.name().as_str(), "org.example.Sample");

        let echo = parsed.method("Echo").unwrap();
        assert_eq!(echo.in_sig().as_str(), "s");
        assert_eq!(echo.out_sig().as_str(), "s");
        assert_eq!(echo.annotations().len(), 1);

        let mix = parsed.method("Mix").unwrap();
        assert_eq!(mix.in_sig().as_str(), "ia{sv}");
        assert_eq!(mix.out_sig().as_str(), "");

        assert_eq!(parsed.signal("Changed").unwrap().sig().as_str(), "sv");

        let level = parsed.property("Level").unwrap();
        assert_eq!(level.access(), Access::ReadWrite);
        assert_eq!(level.emits_changed(), EmitsChanged::Invalidates);
    }

    #[test]
    fn child_nodes_are_skipped() {
        let xml = r#"
            <node>
              <interface name="org.example.Top">
                <method name="M"/>
              </interface>
              <node name="child">
                <interface name="org.example.Child">
                  <method name="Hidden"/>
                </interface>
              </node>
            </node>
        "#;
        let parsed = parse(xml).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name().as_str(), "org.example.Top");
    }

    #[test]
    fn default_arg_direction_is_in() {
        let xml = r#"
            <node>
              <interface name="org.example.I">
                <method name="M">
                  <arg type="s"/>
                  <arg type="u" direction="out"/>
                </method>
              </interface>
            </node>
        "#;
        let parsed = parse(xml).unwrap();
        let m = parsed[0].method("M").unwrap();
        assert_eq!(m.in_sig().as_str(), "s");
        assert_eq!(m.out_sig().as_str(), "u");
    }

    #[test]
    fn invalid_documents_error() {
        assert!(parse("<node><interface></interface></node>").is_err());
        assert!(parse("<node><interface name=\"org.example.I\"><method name=\"9bad\"/></interface></node>").is_err());
    }
}
