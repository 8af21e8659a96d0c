use std::{fmt, ops::Deref};

use crate::{Error, Result};

/// The maximum length of a signature, in bytes.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// The maximum nesting depth of arrays.
pub const MAX_ARRAY_DEPTH: usize = 32;

/// The maximum nesting depth of structs.
pub const MAX_STRUCT_DEPTH: usize = 32;

/// A parsed D-Bus type.
///
/// A value of this type describes one *single complete type*: either a basic
/// type or one fully-closed container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// `y`
    Byte,
    /// `b`
    Bool,
    /// `n`
    Int16,
    /// `q`
    Uint16,
    /// `i`
    Int32,
    /// `u`
    Uint32,
    /// `x`
    Int64,
    /// `t`
    Uint64,
    /// `d`
    Double,
    /// `s`
    String,
    /// `o`
    ObjectPath,
    /// `g`
    Signature,
    /// `h`, an index into the message's file-descriptor array
    UnixFd,
    /// `v`
    Variant,
    /// `a?`
    Array(Box<Type>),
    /// `(...)`
    Struct(Vec<Type>),
    /// `{kv}`, only valid directly inside an array
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Parse a signature string into the sequence of single complete types it
    /// is a concatenation of.
    pub fn parse_signature(signature: &str) -> Result<Vec<Type>> {
        if signature.len() > MAX_SIGNATURE_LEN {
            return Err(Error::TooLarge {
                what: "signature",
                max: MAX_SIGNATURE_LEN,
            });
        }

        let bytes = signature.as_bytes();
        let mut pos = 0;
        let mut types = Vec::new();
        while pos < bytes.len() {
            types.push(parse_one(signature, bytes, &mut pos, Depth::default(), false)?);
        }

        Ok(types)
    }

    /// The alignment of this type on the wire.
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Bool
            | Type::Int32
            | Type::Uint32
            | Type::UnixFd
            | Type::String
            | Type::ObjectPath
            | Type::Array(_) => 4,
            Type::Int64 | Type::Uint64 | Type::Double | Type::Struct(_) | Type::DictEntry(..) => 8,
        }
    }

    /// Whether every value of this type occupies the same number of bytes.
    pub fn is_fixed_size(&self) -> bool {
        match self {
            Type::Byte
            | Type::Bool
            | Type::Int16
            | Type::Uint16
            | Type::Int32
            | Type::Uint32
            | Type::Int64
            | Type::Uint64
            | Type::Double
            | Type::UnixFd => true,
            Type::String | Type::ObjectPath | Type::Signature | Type::Variant | Type::Array(_) => {
                false
            }
            Type::Struct(fields) => fields.iter().all(Type::is_fixed_size),
            Type::DictEntry(key, value) => key.is_fixed_size() && value.is_fixed_size(),
        }
    }

    /// Whether this is a basic (non-container) type. Only basic types may key
    /// a dict entry.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::DictEntry(..)
        )
    }

    /// The signature of this single complete type.
    pub fn signature(&self) -> Signature {
        let mut s = String::new();
        self.write_signature(&mut s);
        Signature(s)
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Type::Byte => out.push('y'),
            Type::Bool => out.push('b'),
            Type::Int16 => out.push('n'),
            Type::Uint16 => out.push('q'),
            Type::Int32 => out.push('i'),
            Type::Uint32 => out.push('u'),
            Type::Int64 => out.push('x'),
            Type::Uint64 => out.push('t'),
            Type::Double => out.push('d'),
            Type::String => out.push('s'),
            Type::ObjectPath => out.push('o'),
            Type::Signature => out.push('g'),
            Type::UnixFd => out.push('h'),
            Type::Variant => out.push('v'),
            Type::Array(elem) => {
                out.push('a');
                elem.write_signature(out);
            }
            Type::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Type::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Depth {
    array: usize,
    strukt: usize,
}

fn parse_one(
    signature: &str,
    bytes: &[u8],
    pos: &mut usize,
    depth: Depth,
    in_array: bool,
) -> Result<Type> {
    let invalid = || Error::InvalidSignature(signature.to_string());

    let code = *bytes.get(*pos).ok_or_else(invalid)?;
    *pos += 1;

    let ty = match code {
        b'y' => Type::Byte,
        b'b' => Type::Bool,
        b'n' => Type::Int16,
        b'q' => Type::Uint16,
        b'i' => Type::Int32,
        b'u' => Type::Uint32,
        b'x' => Type::Int64,
        b't' => Type::Uint64,
        b'd' => Type::Double,
        b's' => Type::String,
        b'o' => Type::ObjectPath,
        b'g' => Type::Signature,
        b'h' => Type::UnixFd,
        b'v' => Type::Variant,
        b'a' => {
            let depth = Depth {
                array: depth.array + 1,
                ..depth
            };
            if depth.array > MAX_ARRAY_DEPTH {
                return Err(Error::DepthExceeded);
            }
            let elem = parse_one(signature, bytes, pos, depth, true)?;
            Type::Array(Box::new(elem))
        }
        b'(' => {
            let depth = Depth {
                strukt: depth.strukt + 1,
                ..depth
            };
            if depth.strukt > MAX_STRUCT_DEPTH {
                return Err(Error::DepthExceeded);
            }
            let mut fields = Vec::new();
            loop {
                match bytes.get(*pos) {
                    Some(b')') => {
                        *pos += 1;
                        break;
                    }
                    Some(_) => fields.push(parse_one(signature, bytes, pos, depth, false)?),
                    None => return Err(invalid()),
                }
            }
            // Empty structs are not valid D-Bus.
            if fields.is_empty() {
                return Err(invalid());
            }
            Type::Struct(fields)
        }
        b'{' => {
            if !in_array {
                return Err(invalid());
            }
            let depth = Depth {
                strukt: depth.strukt + 1,
                ..depth
            };
            if depth.strukt > MAX_STRUCT_DEPTH {
                return Err(Error::DepthExceeded);
            }
            let key = parse_one(signature, bytes, pos, depth, false)?;
            if !key.is_basic() {
                return Err(invalid());
            }
            let value = parse_one(signature, bytes, pos, depth, false)?;
            if bytes.get(*pos) != Some(&b'}') {
                return Err(invalid());
            }
            *pos += 1;
            Type::DictEntry(Box::new(key), Box::new(value))
        }
        _ => return Err(invalid()),
    };

    Ok(ty)
}

/// A validated D-Bus signature: a concatenation of zero or more single
/// complete types, at most 255 bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Signature(String);

impl Signature {
    /// The empty signature.
    pub fn empty() -> Self {
        Signature(String::new())
    }

    /// Create a `Signature` without validating the string.
    ///
    /// Intended for signatures assembled from already-validated parts.
    pub fn from_str_unchecked(signature: &str) -> Self {
        Signature(signature.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse into the sequence of single complete types.
    pub fn types(&self) -> Result<Vec<Type>> {
        Type::parse_signature(&self.0)
    }

    /// Parse as exactly one single complete type.
    pub fn single_type(&self) -> Result<Type> {
        let mut types = self.types()?;
        if types.len() != 1 {
            return Err(Error::InvalidSignature(self.0.clone()));
        }
        Ok(types.remove(0))
    }

    /// Iterate the single complete types of this signature as sub-slices of
    /// its text, for traversing a root signature without building type
    /// trees.
    pub fn single_types(&self) -> SingleTypes<'_> {
        SingleTypes {
            signature: &self.0,
            pos: 0,
        }
    }

    /// Concatenate the signatures of `types`.
    pub fn from_types<'t>(types: impl IntoIterator<Item = &'t Type>) -> Self {
        let mut s = String::new();
        for ty in types {
            ty.write_signature(&mut s);
        }
        Signature(s)
    }
}

/// Iterator over the single complete types of a [`Signature`], yielding each
/// as a sub-slice of the signature text.
#[derive(Debug, Clone)]
pub struct SingleTypes<'s> {
    signature: &'s str,
    pos: usize,
}

impl<'s> Iterator for SingleTypes<'s> {
    type Item = &'s str;

    fn next(&mut self) -> Option<&'s str> {
        if self.pos >= self.signature.len() {
            return None;
        }
        let start = self.pos;
        self.pos = complete_type_end(self.signature.as_bytes(), start);
        Some(&self.signature[start..self.pos])
    }
}

/// The end of the single complete type starting at `start`. The signature is
/// valid by construction, so this only has to find the boundary.
fn complete_type_end(bytes: &[u8], start: usize) -> usize {
    let mut pos = start;
    while bytes.get(pos) == Some(&b'a') {
        pos += 1;
    }
    match bytes.get(pos) {
        Some(b'(') | Some(b'{') => {
            let mut depth = 0usize;
            while let Some(&b) = bytes.get(pos) {
                match b {
                    b'(' | b'{' => depth += 1,
                    b')' | b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            return pos + 1;
                        }
                    }
                    _ => {}
                }
                pos += 1;
            }
            pos
        }
        Some(_) => pos + 1,
        None => pos,
    }
}

impl Deref for Signature {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Signature {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Type::parse_signature(value)?;
        Ok(Signature(value.to_string()))
    }
}

impl TryFrom<String> for Signature {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Type::parse_signature(&value)?;
        Ok(Signature(value))
    }
}

impl PartialEq<str> for Signature {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Signature {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signatures() {
        for sig in [
            "", "y", "b", "nqiuxtd", "s", "o", "g", "h", "v", "as", "a(ii)", "a{sv}", "a{s(ii)}",
            "(yyyyuua(yv))", "aaaai", "(i(i(i)))", "a{yb}v",
        ] {
            assert!(Signature::try_from(sig).is_ok(), "{sig:?} should parse");
        }
    }

    #[test]
    fn invalid_signatures() {
        for sig in [
            "z", "a", "(", "(i", "i)", "()", "{sv}", "a{vs}", "a{s}", "a{sss}", "a{(i)i}", "ai)",
        ] {
            assert!(Signature::try_from(sig).is_err(), "{sig:?} should be rejected");
        }
    }

    #[test]
    fn depth_limits() {
        let deep_array = "a".repeat(33) + "i";
        assert_eq!(
            Type::parse_signature(&deep_array),
            Err(Error::DepthExceeded)
        );
        let ok_array = "a".repeat(32) + "i";
        assert!(Type::parse_signature(&ok_array).is_ok());

        let deep_struct = format!("{}i{}", "(".repeat(33), ")".repeat(33));
        assert_eq!(
            Type::parse_signature(&deep_struct),
            Err(Error::DepthExceeded)
        );

        let long = "i".repeat(256);
        assert!(matches!(
            Type::parse_signature(&long),
            Err(Error::TooLarge { .. })
        ));
    }

    #[test]
    fn alignments() {
        let cases = [
            ("y", 1),
            ("g", 1),
            ("v", 1),
            ("n", 2),
            ("q", 2),
            ("b", 4),
            ("i", 4),
            ("u", 4),
            ("h", 4),
            ("s", 4),
            ("o", 4),
            ("ai", 4),
            ("x", 8),
            ("t", 8),
            ("d", 8),
            ("(y)", 8),
        ];
        for (sig, align) in cases {
            let ty = Signature::try_from(sig).unwrap().single_type().unwrap();
            assert_eq!(ty.alignment(), align, "alignment of {sig:?}");
        }
        let dict = Signature::try_from("a{sv}").unwrap().single_type().unwrap();
        if let Type::Array(entry) = dict {
            assert_eq!(entry.alignment(), 8);
        } else {
            panic!("expected array type");
        }
    }

    #[test]
    fn fixed_size() {
        for (sig, fixed) in [
            ("y", true),
            ("d", true),
            ("(ii)", true),
            ("s", false),
            ("as", false),
            ("(is)", false),
            ("v", false),
        ] {
            let ty = Signature::try_from(sig).unwrap().single_type().unwrap();
            assert_eq!(ty.is_fixed_size(), fixed, "is_fixed_size of {sig:?}");
        }
    }

    #[test]
    fn round_trips_through_type_tree() {
        for sig in ["a{sv}", "(yyyyuua(yv))", "aai", "a{s(iai)}"] {
            let parsed = Type::parse_signature(sig).unwrap();
            assert_eq!(Signature::from_types(&parsed).as_str(), sig);
        }
    }

    #[test]
    fn single_type() {
        assert!(Signature::try_from("ii").unwrap().single_type().is_err());
        assert!(Signature::try_from("").unwrap().single_type().is_err());
        assert_eq!(
            Signature::try_from("ai").unwrap().single_type().unwrap(),
            Type::Array(Box::new(Type::Int32))
        );
    }

    #[test]
    fn single_types_slices() {
        let sig = Signature::try_from("ia{sv}a(i(si))vaayo").unwrap();
        let slices: Vec<&str> = sig.single_types().collect();
        assert_eq!(slices, ["i", "a{sv}", "a(i(si))", "v", "aay", "o"]);

        assert_eq!(Signature::empty().single_types().count(), 0);
        assert_eq!(
            Signature::try_from("aai").unwrap().single_types().collect::<Vec<_>>(),
            ["aai"]
        );

        // Each slice parses back to the matching type of the whole.
        let types = sig.types().unwrap();
        for (slice, ty) in sig.single_types().zip(&types) {
            assert_eq!(ty.signature().as_str(), slice);
        }
    }
}
