//! Validated D-Bus name types.
//!
//! Every name on the bus follows one of a handful of grammars from the D-Bus
//! specification. Each type here owns its string and can only be constructed
//! through validation, so the rest of the crate can pass names around without
//! re-checking them.

use std::{fmt, ops::Deref};

use crate::{Error, Result};

const MAX_NAME_LEN: usize = 255;

fn valid_member_char(b: u8, first: bool) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || (!first && b.is_ascii_digit())
}

/// Elements separated by `.`, each starting with `[A-Za-z_]`. With
/// `allow_dash`, `-` is also accepted (well-known bus names). With
/// `allow_leading_digit`, elements may start with a digit (unique names).
fn validate_dotted(
    name: &str,
    min_elements: usize,
    allow_dash: bool,
    allow_leading_digit: bool,
) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        let Some(&first) = element.as_bytes().first() else {
            return false;
        };
        let first_ok = valid_member_char(first, !allow_leading_digit)
            || (allow_dash && first == b'-')
            || (allow_leading_digit && first.is_ascii_digit());
        if !first_ok {
            return false;
        }
        if !element[1..]
            .bytes()
            .all(|b| valid_member_char(b, false) || (allow_dash && b == b'-'))
        {
            return false;
        }
        elements += 1;
    }
    elements >= min_elements
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $what:expr, $validate:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Create the name without validation.
            pub fn from_str_unchecked(name: &str) -> Self {
                $name(name.to_string())
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                let validate: fn(&str) -> bool = $validate;
                if validate(value) {
                    Ok($name(value.to_string()))
                } else {
                    Err(Error::InvalidName(format!(
                        concat!("invalid ", $what, ": `{}`"),
                        value
                    )))
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                $name::try_from(value.as_str())
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

name_type!(
    /// An interface name: reverse-DNS style, at least two elements.
    InterfaceName,
    "interface name",
    |name| validate_dotted(name, 2, false, false)
);

name_type!(
    /// A method or signal name: one element, no dots.
    MemberName,
    "member name",
    |name| {
        !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && !name.contains('.')
            && name
                .bytes()
                .enumerate()
                .all(|(i, b)| valid_member_char(b, i == 0))
    }
);

name_type!(
    /// An error name; the same grammar as interface names.
    ErrorName,
    "error name",
    |name| validate_dotted(name, 2, false, false)
);

name_type!(
    /// A unique connection name handed out by the bus, starting with `:`.
    UniqueName,
    "unique name",
    |name| match name.strip_prefix(':') {
        Some(rest) => validate_dotted(rest, 2, true, true),
        None => false,
    }
);

name_type!(
    /// A well-known (requestable) bus name.
    WellKnownName,
    "well-known name",
    |name| !name.starts_with(':') && validate_dotted(name, 2, true, false)
);

/// Either kind of bus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusName {
    Unique(UniqueName),
    WellKnown(WellKnownName),
}

impl BusName {
    pub fn as_str(&self) -> &str {
        match self {
            BusName::Unique(name) => name.as_str(),
            BusName::WellKnown(name) => name.as_str(),
        }
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for BusName {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        if value.starts_with(':') {
            UniqueName::try_from(value).map(BusName::Unique)
        } else {
            WellKnownName::try_from(value).map(BusName::WellKnown)
        }
    }
}

impl TryFrom<String> for BusName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        BusName::try_from(value.as_str())
    }
}

impl From<UniqueName> for BusName {
    fn from(name: UniqueName) -> Self {
        BusName::Unique(name)
    }
}

impl From<WellKnownName> for BusName {
    fn from(name: WellKnownName) -> Self {
        BusName::WellKnown(name)
    }
}

impl PartialEq<str> for BusName {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for BusName {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_names() {
        assert!(InterfaceName::try_from("org.freedesktop.DBus").is_ok());
        assert!(InterfaceName::try_from("a.b_c.D9").is_ok());
        for bad in ["", "org", ".org.x", "org..x", "org.9x", "org.x-y", ":1.2"] {
            assert!(InterfaceName::try_from(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn member_names() {
        assert!(MemberName::try_from("Ping").is_ok());
        assert!(MemberName::try_from("_private9").is_ok());
        for bad in ["", "9start", "a.b", "with-dash", "spa ce"] {
            assert!(MemberName::try_from(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn bus_names() {
        assert!(matches!(
            BusName::try_from(":1.42").unwrap(),
            BusName::Unique(_)
        ));
        assert!(matches!(
            BusName::try_from("org.example.App").unwrap(),
            BusName::WellKnown(_)
        ));
        assert!(BusName::try_from("com.example-corp.App").is_ok());
        for bad in ["", ":", "org", ":1..2", "9org.x"] {
            assert!(BusName::try_from(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn length_limit() {
        let long = format!("a.{}", "b".repeat(300));
        assert!(InterfaceName::try_from(long.as_str()).is_err());
    }
}
