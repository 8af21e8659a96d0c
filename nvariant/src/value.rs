use std::{collections::HashMap, fmt};

use crate::{Error, ObjectPath, Result, Signature, Type};

/// A dynamically-typed D-Bus value.
///
/// Every variant corresponds to one single complete type; containers carry
/// enough type information to produce their exact signature even when empty.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// An index into the file-descriptor array travelling with the message.
    Fd(u32),
    Array(Array),
    Dict(Dict),
    Structure(Structure),
    Variant(Box<Value>),
}

impl Value {
    /// The type of this value.
    pub fn ty(&self) -> Type {
        match self {
            Value::U8(_) => Type::Byte,
            Value::Bool(_) => Type::Bool,
            Value::I16(_) => Type::Int16,
            Value::U16(_) => Type::Uint16,
            Value::I32(_) => Type::Int32,
            Value::U32(_) => Type::Uint32,
            Value::I64(_) => Type::Int64,
            Value::U64(_) => Type::Uint64,
            Value::F64(_) => Type::Double,
            Value::Str(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Fd(_) => Type::UnixFd,
            Value::Array(a) => Type::Array(Box::new(a.element_type().clone())),
            Value::Dict(d) => Type::Array(Box::new(Type::DictEntry(
                Box::new(d.key_type().clone()),
                Box::new(d.value_type().clone()),
            ))),
            Value::Structure(s) => Type::Struct(s.fields().iter().map(Value::ty).collect()),
            Value::Variant(_) => Type::Variant,
        }
    }

    /// The signature of this value.
    pub fn signature(&self) -> Signature {
        self.ty().signature()
    }

    /// Whether this value is an instance of `ty`.
    pub fn matches(&self, ty: &Type) -> bool {
        self.ty() == *ty
    }

    /// Box this value into a variant.
    pub fn into_variant(self) -> Value {
        Value::Variant(Box::new(self))
    }

    /// Unbox one level of variant, if any.
    pub fn unbox(self) -> Value {
        match self {
            Value::Variant(inner) => *inner,
            other => other,
        }
    }
}

/// Helper to check a value sequence against a signature.
pub fn check_signature(values: &[Value], signature: &Signature) -> Result<()> {
    let expected = signature.types()?;
    let found: Vec<Type> = values.iter().map(Value::ty).collect();
    if expected != found {
        return Err(Error::TypeMismatch {
            expected: signature.to_string(),
            found: Signature::from_types(&found).to_string(),
        });
    }
    Ok(())
}

/// An array of values of one element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    element: Type,
    items: Vec<Value>,
}

impl Array {
    /// Create an empty array of the given element type.
    pub fn new(element: Type) -> Self {
        Array {
            element,
            items: Vec::new(),
        }
    }

    pub fn element_type(&self) -> &Type {
        &self.element
    }

    /// Append an element, checking it against the element type.
    pub fn push(&mut self, value: Value) -> Result<()> {
        if !value.matches(&self.element) {
            return Err(Error::TypeMismatch {
                expected: self.element.signature().to_string(),
                found: value.signature().to_string(),
            });
        }
        self.items.push(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.items.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }
}

impl<'a> IntoIterator for &'a Array {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// An ordered dictionary, encoded as an array of dict entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Dict {
    key: Type,
    value: Type,
    entries: Vec<(Value, Value)>,
}

impl Dict {
    /// Create an empty dictionary. The key type must be basic.
    pub fn new(key: Type, value: Type) -> Result<Self> {
        if !key.is_basic() {
            return Err(Error::InvalidSignature(
                Type::DictEntry(Box::new(key), Box::new(value))
                    .signature()
                    .to_string(),
            ));
        }
        Ok(Dict {
            key,
            value,
            entries: Vec::new(),
        })
    }

    pub fn key_type(&self) -> &Type {
        &self.key
    }

    pub fn value_type(&self) -> &Type {
        &self.value
    }

    /// Append an entry, checking both halves against the declared types.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<()> {
        if !key.matches(&self.key) || !value.matches(&self.value) {
            return Err(Error::TypeMismatch {
                expected: Type::DictEntry(Box::new(self.key.clone()), Box::new(self.value.clone()))
                    .signature()
                    .to_string(),
                found: Type::DictEntry(Box::new(key.ty()), Box::new(value.ty()))
                    .signature()
                    .to_string(),
            });
        }
        self.entries.push((key, value));
        Ok(())
    }

    /// Look up the value for a string key.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find_map(|(k, v)| match k {
            Value::Str(s) if s == key => Some(v),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Value, Value)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<(Value, Value)> {
        self.entries
    }
}

/// An ordered sequence of fields, encoded as a D-Bus struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure(Vec<Value>);

impl Structure {
    pub fn builder() -> StructureBuilder {
        StructureBuilder(Vec::new())
    }

    /// Build a structure from the shapes a struct argument may take: an
    /// already-ordered sequence, named fields matched against a declared
    /// field order, or a descriptor carrying its own order.
    pub fn from_init(init: StructInit) -> Result<Self> {
        match init {
            StructInit::Ordered(fields) => {
                if fields.is_empty() {
                    return Err(Error::InvalidSignature("()".to_string()));
                }
                Ok(Structure(fields))
            }
            StructInit::Named { order, mut values } => {
                if order.is_empty() {
                    return Err(Error::InvalidSignature("()".to_string()));
                }
                let mut fields = Vec::with_capacity(order.len());
                for name in &order {
                    let value = values.remove(name.as_str()).ok_or(Error::IncorrectType)?;
                    fields.push(value);
                }
                // Leftover names mean the mapping does not describe this struct.
                if !values.is_empty() {
                    return Err(Error::IncorrectType);
                }
                Ok(Structure(fields))
            }
            StructInit::Descriptor(descriptor) => {
                let order = descriptor.field_order();
                if order.is_empty() {
                    return Err(Error::InvalidSignature("()".to_string()));
                }
                let mut fields = Vec::with_capacity(order.len());
                for name in &order {
                    // A descriptor that cannot produce a declared field does
                    // not describe this struct.
                    fields.push(descriptor.field(name).ok_or(Error::IncorrectType)?);
                }
                Ok(Structure(fields))
            }
        }
    }

    pub fn fields(&self) -> &[Value] {
        &self.0
    }

    pub fn into_fields(self) -> Vec<Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An object that knows the wire order of its own fields and can hand out a
/// value per field name. The analogue of types that declare their field
/// order alongside their attributes.
pub trait StructFields: fmt::Debug {
    /// Field names in the order they populate the struct.
    fn field_order(&self) -> Vec<String>;

    /// The value of one named field.
    fn field(&self, name: &str) -> Option<Value>;
}

/// The accepted shapes of a struct argument.
///
/// Mirrors the duck typing of dynamic bindings as an explicit sum type: an
/// ordered field list, a name-to-value mapping resolved against a declared
/// field order, or a [`StructFields`] descriptor carrying both.
#[derive(Debug)]
pub enum StructInit {
    Ordered(Vec<Value>),
    Named {
        order: Vec<String>,
        values: HashMap<String, Value>,
    },
    Descriptor(Box<dyn StructFields>),
}

/// Builds a [`Structure`] field by field.
#[derive(Debug, Default)]
pub struct StructureBuilder(Vec<Value>);

impl StructureBuilder {
    pub fn append(mut self, value: impl Into<Value>) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn build(self) -> Result<Structure> {
        Structure::from_init(StructInit::Ordered(self.0))
    }
}

macro_rules! from_impl {
    ($from:ty, $variant:ident) => {
        impl From<$from> for Value {
            fn from(v: $from) -> Value {
                Value::$variant(v)
            }
        }
    };
}

from_impl!(u8, U8);
from_impl!(bool, Bool);
from_impl!(i16, I16);
from_impl!(u16, U16);
from_impl!(i32, I32);
from_impl!(u32, U32);
from_impl!(i64, I64);
from_impl!(u64, U64);
from_impl!(f64, F64);
from_impl!(String, Str);
from_impl!(ObjectPath, ObjectPath);
from_impl!(Signature, Signature);
from_impl!(Array, Array);
from_impl!(Dict, Dict);
from_impl!(Structure, Structure);

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_string())
    }
}

macro_rules! try_from_impl {
    ($to:ty, $variant:ident) => {
        impl TryFrom<Value> for $to {
            type Error = Error;

            fn try_from(v: Value) -> Result<$to> {
                match v {
                    Value::$variant(v) => Ok(v),
                    _ => Err(Error::IncorrectType),
                }
            }
        }
    };
}

try_from_impl!(u8, U8);
try_from_impl!(bool, Bool);
try_from_impl!(i16, I16);
try_from_impl!(u16, U16);
try_from_impl!(i32, I32);
try_from_impl!(u32, U32);
try_from_impl!(i64, I64);
try_from_impl!(u64, U64);
try_from_impl!(f64, F64);
try_from_impl!(String, Str);
try_from_impl!(ObjectPath, ObjectPath);
try_from_impl!(Array, Array);
try_from_impl!(Dict, Dict);
try_from_impl!(Structure, Structure);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures() {
        assert_eq!(Value::from(7u32).signature(), "u");
        assert_eq!(Value::from("hi").signature(), "s");
        assert_eq!(Value::from(1.5f64).signature(), "d");

        let arr = Array::new(Type::Int32);
        assert_eq!(Value::Array(arr).signature(), "ai");

        let mut dict = Dict::new(Type::String, Type::Variant).unwrap();
        dict.insert(Value::from("k"), Value::from(1u32).into_variant())
            .unwrap();
        assert_eq!(Value::Dict(dict).signature(), "a{sv}");

        let st = Structure::builder().append(1i32).append("x").build().unwrap();
        assert_eq!(Value::Structure(st).signature(), "(is)");
    }

    #[test]
    fn array_type_check() {
        let mut arr = Array::new(Type::String);
        assert!(arr.push(Value::from("ok")).is_ok());
        assert!(arr.push(Value::from(1u32)).is_err());
    }

    #[test]
    fn dict_key_must_be_basic() {
        assert!(Dict::new(Type::Variant, Type::String).is_err());
        assert!(Dict::new(Type::String, Type::Variant).is_ok());
    }

    #[test]
    fn named_struct_init() {
        let mut values = HashMap::new();
        values.insert("b".to_string(), Value::from("two"));
        values.insert("a".to_string(), Value::from(1i32));
        let st = Structure::from_init(StructInit::Named {
            order: vec!["a".to_string(), "b".to_string()],
            values,
        })
        .unwrap();
        assert_eq!(st.fields(), &[Value::from(1i32), Value::from("two")]);

        let mut extra = HashMap::new();
        extra.insert("a".to_string(), Value::from(1i32));
        extra.insert("z".to_string(), Value::from(2i32));
        assert!(Structure::from_init(StructInit::Named {
            order: vec!["a".to_string()],
            values: extra,
        })
        .is_err());
    }

    #[derive(Debug)]
    struct Point {
        x: i32,
        y: i32,
    }

    impl StructFields for Point {
        fn field_order(&self) -> Vec<String> {
            vec!["x".to_string(), "y".to_string()]
        }

        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "x" => Some(Value::from(self.x)),
                "y" => Some(Value::from(self.y)),
                _ => None,
            }
        }
    }

    #[test]
    fn descriptor_struct_init() {
        let st = Structure::from_init(StructInit::Descriptor(Box::new(Point { x: 1, y: 2 })))
            .unwrap();
        assert_eq!(st.fields(), &[Value::from(1i32), Value::from(2i32)]);
        assert_eq!(Value::Structure(st).signature(), "(ii)");
    }

    #[derive(Debug)]
    struct Hollow;

    impl StructFields for Hollow {
        fn field_order(&self) -> Vec<String> {
            vec!["ghost".to_string()]
        }

        fn field(&self, _name: &str) -> Option<Value> {
            None
        }
    }

    #[test]
    fn descriptor_missing_field_rejected() {
        assert!(Structure::from_init(StructInit::Descriptor(Box::new(Hollow))).is_err());
    }

    #[test]
    fn check_signature_matches() {
        let values = vec![Value::from(1u32), Value::from("s")];
        assert!(check_signature(&values, &Signature::try_from("us").unwrap()).is_ok());
        assert!(check_signature(&values, &Signature::try_from("su").unwrap()).is_err());
    }
}
