use nvariant::{Array, ObjectPath, Signature, Structure, Type as ValueType, Value};

use crate::{
    names::{BusName, ErrorName, InterfaceName, MemberName, UniqueName},
    Error, Result,
};

/// The code of a header field.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldCode {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

/// A header field and its value.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// The object to send a call to, or the object a signal is emitted from.
    Path(ObjectPath),
    /// The interface to invoke a method call on, or that a signal is emitted
    /// from.
    Interface(InterfaceName),
    /// The member, either the method name or signal name.
    Member(MemberName),
    /// The name of the error that occurred, for errors.
    ErrorName(ErrorName),
    /// The serial number of the message this message is a reply to.
    ReplySerial(u32),
    /// The name of the connection this message is intended for.
    Destination(BusName),
    /// Unique name of the sending connection.
    Sender(UniqueName),
    /// The signature of the message body.
    Signature(Signature),
    /// The number of Unix file descriptors that accompany the message.
    UnixFds(u32),
}

impl Field {
    pub fn code(&self) -> FieldCode {
        match self {
            Field::Path(_) => FieldCode::Path,
            Field::Interface(_) => FieldCode::Interface,
            Field::Member(_) => FieldCode::Member,
            Field::ErrorName(_) => FieldCode::ErrorName,
            Field::ReplySerial(_) => FieldCode::ReplySerial,
            Field::Destination(_) => FieldCode::Destination,
            Field::Sender(_) => FieldCode::Sender,
            Field::Signature(_) => FieldCode::Signature,
            Field::UnixFds(_) => FieldCode::UnixFds,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Field::Path(p) => Value::ObjectPath(p.clone()),
            Field::Interface(i) => Value::from(i.as_str()),
            Field::Member(m) => Value::from(m.as_str()),
            Field::ErrorName(e) => Value::from(e.as_str()),
            Field::ReplySerial(s) => Value::from(*s),
            Field::Destination(d) => Value::from(d.as_str()),
            Field::Sender(s) => Value::from(s.as_str()),
            Field::Signature(s) => Value::Signature(s.clone()),
            Field::UnixFds(n) => Value::from(*n),
        }
    }

    /// Interpret one decoded `(code, variant)` pair. Unknown codes decode to
    /// `None` and are ignored for forward compatibility.
    fn from_code_value(code: u8, value: Value) -> Result<Option<Field>> {
        let field = match code {
            1 => match value {
                Value::ObjectPath(p) => Field::Path(p),
                _ => return Err(Error::InvalidField),
            },
            2 => match value {
                Value::Str(s) => Field::Interface(InterfaceName::try_from(s)?),
                _ => return Err(Error::InvalidField),
            },
            3 => match value {
                Value::Str(s) => Field::Member(MemberName::try_from(s)?),
                _ => return Err(Error::InvalidField),
            },
            4 => match value {
                Value::Str(s) => Field::ErrorName(ErrorName::try_from(s)?),
                _ => return Err(Error::InvalidField),
            },
            5 => match value {
                Value::U32(s) => Field::ReplySerial(s),
                _ => return Err(Error::InvalidField),
            },
            6 => match value {
                Value::Str(s) => Field::Destination(BusName::try_from(s)?),
                _ => return Err(Error::InvalidField),
            },
            7 => match value {
                Value::Str(s) => Field::Sender(UniqueName::try_from(s)?),
                _ => return Err(Error::InvalidField),
            },
            8 => match value {
                Value::Signature(s) => Field::Signature(s),
                _ => return Err(Error::InvalidField),
            },
            9 => match value {
                Value::U32(n) => Field::UnixFds(n),
                _ => return Err(Error::InvalidField),
            },
            _ => return Ok(None),
        };
        Ok(Some(field))
    }
}

/// The ordered collection of header fields of one message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fields(Vec<Field>);

impl Fields {
    pub fn new() -> Self {
        Fields(Vec::new())
    }

    /// Append a field, replacing any previous field with the same code.
    pub fn replace(&mut self, field: Field) {
        let code = field.code();
        self.0.retain(|f| f.code() != code);
        self.0.push(field);
    }

    pub fn get(&self, code: FieldCode) -> Option<&Field> {
        self.0.iter().find(|f| f.code() == code)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.0.iter()
    }

    /// Encode as the `a(yv)` value the wire format calls for.
    pub(crate) fn to_value(&self) -> Result<Value> {
        let mut array = Array::new(ValueType::Struct(vec![ValueType::Byte, ValueType::Variant]));
        for field in &self.0 {
            let entry = Structure::builder()
                .append(Value::U8(field.code() as u8))
                .append(field.to_value().into_variant())
                .build()?;
            array.push(Value::Structure(entry))?;
        }
        Ok(Value::Array(array))
    }

    /// Interpret a decoded `a(yv)` value, rejecting duplicate field codes.
    pub(crate) fn from_value(value: Value) -> Result<Fields> {
        let array = match value {
            Value::Array(a) => a,
            _ => return Err(Error::InvalidField),
        };

        let mut fields = Fields::new();
        let mut seen = [false; 10];
        for entry in array.into_items() {
            let mut parts = match entry {
                Value::Structure(s) => s.into_fields(),
                _ => return Err(Error::InvalidField),
            };
            if parts.len() != 2 {
                return Err(Error::InvalidField);
            }
            let value = parts.pop().expect("length checked");
            let code = match parts.pop().expect("length checked") {
                Value::U8(code) => code,
                _ => return Err(Error::InvalidField),
            };
            let value = match value {
                Value::Variant(inner) => *inner,
                _ => return Err(Error::InvalidField),
            };
            if let Some(field) = Field::from_code_value(code, value)? {
                if seen[code as usize] {
                    return Err(Error::DuplicateField);
                }
                seen[code as usize] = true;
                fields.0.push(field);
            }
        }

        Ok(fields)
    }
}

impl<'f> IntoIterator for &'f Fields {
    type Item = &'f Field;
    type IntoIter = std::slice::Iter<'f, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_is_idempotent() {
        let mut fields = Fields::new();
        fields.replace(Field::ReplySerial(1));
        fields.replace(Field::ReplySerial(2));
        assert_eq!(fields.get(FieldCode::ReplySerial), Some(&Field::ReplySerial(2)));
        assert_eq!(fields.iter().count(), 1);
    }

    #[test]
    fn wire_value_round_trip() {
        let mut fields = Fields::new();
        fields.replace(Field::Path(ObjectPath::try_from("/org/example").unwrap()));
        fields.replace(Field::Member(MemberName::try_from("Frobnicate").unwrap()));
        fields.replace(Field::Signature(Signature::try_from("sa{sv}").unwrap()));

        let value = fields.to_value().unwrap();
        let back = Fields::from_value(value).unwrap();
        assert_eq!(back, fields);
    }

    #[test]
    fn duplicate_fields_rejected() {
        let mut fields = Fields::new();
        fields.replace(Field::ReplySerial(1));
        let mut value = fields.to_value().unwrap();
        // Duplicate the single entry.
        if let Value::Array(ref mut array) = value {
            let entry = array.get(0).expect("one entry").clone();
            array.push(entry).unwrap();
        }
        assert!(matches!(
            Fields::from_value(value),
            Err(Error::DuplicateField)
        ));
    }

    #[test]
    fn unknown_codes_ignored() {
        let mut array = Array::new(ValueType::Struct(vec![ValueType::Byte, ValueType::Variant]));
        let entry = Structure::builder()
            .append(Value::U8(200))
            .append(Value::from("future").into_variant())
            .build()
            .unwrap();
        array.push(Value::Structure(entry)).unwrap();
        let fields = Fields::from_value(Value::Array(array)).unwrap();
        assert_eq!(fields.iter().count(), 0);
    }
}
