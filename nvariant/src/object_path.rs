use std::{fmt, ops::Deref};

use crate::{Error, Result};

/// A validated D-Bus object path.
///
/// Either the root path `/`, or `/`-separated elements of
/// `[A-Za-z0-9_]`, with no trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// The root path, `/`.
    pub fn root() -> Self {
        ObjectPath("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Create an `ObjectPath` without validating the string.
    pub fn from_str_unchecked(path: &str) -> Self {
        ObjectPath(path.to_string())
    }

    fn validate(path: &str) -> Result<()> {
        let invalid = || Error::InvalidObjectPath(path.to_string());

        if path == "/" {
            return Ok(());
        }
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(invalid());
        }
        for element in path[1..].split('/') {
            if element.is_empty()
                || !element
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(invalid());
            }
        }

        Ok(())
    }
}

impl Deref for ObjectPath {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ObjectPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::validate(value)?;
        Ok(ObjectPath(value.to_string()))
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::validate(&value)?;
        Ok(ObjectPath(value))
    }
}

impl PartialEq<str> for ObjectPath {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for ObjectPath {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::ObjectPath;

    #[test]
    fn valid_paths() {
        for path in ["/", "/a", "/org/freedesktop/DBus", "/a/b_c/D9"] {
            assert!(ObjectPath::try_from(path).is_ok(), "{path:?}");
        }
    }

    #[test]
    fn invalid_paths() {
        for path in ["", "a", "/a/", "//", "/a//b", "/a-b", "/a b", "/é"] {
            assert!(ObjectPath::try_from(path).is_err(), "{path:?}");
        }
    }
}
