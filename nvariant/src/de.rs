use crate::{
    endian::{padding_for, Endian},
    ser::MAX_ARRAY_BYTES,
    Array, Dict, EncodingContext, Error, ObjectPath, Result, Signature, Structure, Type, Value,
};

/// The maximum nesting depth of containers in a decoded value, counting
/// variants. Matches the total-depth limit of the D-Bus specification.
const MAX_CONTAINER_DEPTH: usize = 64;

/// Decode a sequence of values described by `signature`, consuming the whole
/// input.
pub fn from_slice(ctxt: EncodingContext, signature: &Signature, data: &[u8]) -> Result<Vec<Value>> {
    let mut decoder = Decoder::new(ctxt, data);
    let mut values = Vec::new();
    for ty in signature.types()? {
        values.push(decoder.take_value(&ty)?);
    }
    decoder.finish()?;
    Ok(values)
}

/// Reads values out of a byte slice, enforcing the wire-format invariants:
/// zeroed padding, exact array lengths, valid strings and signatures.
#[derive(Debug)]
pub struct Decoder<'d> {
    data: &'d [u8],
    pos: usize,
    base: usize,
    endian: Endian,
}

impl<'d> Decoder<'d> {
    pub fn new(ctxt: EncodingContext, data: &'d [u8]) -> Self {
        Decoder {
            data,
            pos: 0,
            base: ctxt.position(),
            endian: ctxt.endian(),
        }
    }

    /// The absolute position of the next byte within the message.
    pub fn position(&self) -> usize {
        self.base + self.pos
    }

    /// The number of bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Error if any input remains.
    pub fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::ExcessData(n)),
        }
    }

    /// Consume padding up to `align`, rejecting non-zero bytes.
    pub fn pad(&mut self, align: usize) -> Result<()> {
        let padding = padding_for(self.position(), align);
        let bytes = self.take(padding)?;
        if bytes.iter().any(|&b| b != 0) {
            return Err(Error::NonZeroPadding);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'d [u8]> {
        if self.remaining() < n {
            return Err(Error::OutOfBounds);
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16(&mut self) -> Result<u16> {
        self.pad(2)?;
        Ok(self.endian.get_u16(self.take(2)?))
    }

    pub fn take_u32(&mut self) -> Result<u32> {
        self.pad(4)?;
        Ok(self.endian.get_u32(self.take(4)?))
    }

    pub fn take_u64(&mut self) -> Result<u64> {
        self.pad(8)?;
        Ok(self.endian.get_u64(self.take(8)?))
    }

    /// Decode one value of type `ty`.
    pub fn take_value(&mut self, ty: &Type) -> Result<Value> {
        self.take_value_at_depth(ty, 0)
    }

    fn take_value_at_depth(&mut self, ty: &Type, depth: usize) -> Result<Value> {
        if depth > MAX_CONTAINER_DEPTH {
            return Err(Error::DepthExceeded);
        }

        let value = match ty {
            Type::Byte => Value::U8(self.take_u8()?),
            Type::Bool => match self.take_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(Error::InvalidBool(other)),
            },
            Type::Int16 => Value::I16(self.take_u16()? as i16),
            Type::Uint16 => Value::U16(self.take_u16()?),
            Type::Int32 => Value::I32(self.take_u32()? as i32),
            Type::Uint32 => Value::U32(self.take_u32()?),
            Type::Int64 => Value::I64(self.take_u64()? as i64),
            Type::Uint64 => Value::U64(self.take_u64()?),
            Type::Double => {
                self.pad(8)?;
                Value::F64(self.endian.get_f64(self.take(8)?))
            }
            Type::String => Value::Str(self.take_str()?),
            Type::ObjectPath => {
                let s = self.take_str()?;
                Value::ObjectPath(ObjectPath::try_from(s)?)
            }
            Type::Signature => Value::Signature(self.take_signature()?),
            Type::UnixFd => Value::Fd(self.take_u32()?),
            Type::Array(elem) => self.take_array(elem, depth)?,
            Type::Struct(fields) => {
                self.pad(8)?;
                let mut out = Vec::with_capacity(fields.len());
                for field in fields {
                    out.push(self.take_value_at_depth(field, depth + 1)?);
                }
                Value::Structure(Structure::from_init(crate::StructInit::Ordered(out))?)
            }
            Type::DictEntry(..) => {
                // Dict entries only occur inside arrays; `take_array` handles
                // them without coming through here.
                return Err(Error::InvalidSignature(ty.signature().to_string()));
            }
            Type::Variant => {
                let signature = self.take_signature()?;
                let inner = signature.single_type()?;
                let value = self.take_value_at_depth(&inner, depth + 1)?;
                Value::Variant(Box::new(value))
            }
        };

        Ok(value)
    }

    fn take_array(&mut self, elem: &Type, depth: usize) -> Result<Value> {
        self.pad(4)?;
        let declared = self.endian.get_u32(self.take(4)?) as usize;
        if declared > MAX_ARRAY_BYTES {
            return Err(Error::TooLarge {
                what: "array",
                max: MAX_ARRAY_BYTES,
            });
        }
        // The padding to the element alignment is not part of the declared
        // length, even when the array is empty.
        self.pad(elem.alignment())?;
        let start = self.pos;
        if declared > self.remaining() {
            return Err(Error::OutOfBounds);
        }
        let end = start + declared;

        let value = if let Type::DictEntry(key_ty, value_ty) = elem {
            let mut dict = Dict::new((**key_ty).clone(), (**value_ty).clone())?;
            while self.pos < end {
                self.pad(8)?;
                let key = self.take_value_at_depth(key_ty, depth + 2)?;
                let value = self.take_value_at_depth(value_ty, depth + 2)?;
                dict.insert(key, value)?;
            }
            Value::Dict(dict)
        } else {
            let mut array = Array::new(elem.clone());
            while self.pos < end {
                let item = self.take_value_at_depth(elem, depth + 1)?;
                array.push(item)?;
            }
            Value::Array(array)
        };

        if self.pos != end {
            return Err(Error::ArrayLengthMismatch {
                declared,
                actual: self.pos - start,
            });
        }

        Ok(value)
    }

    fn take_str(&mut self) -> Result<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(Error::EmbeddedNul);
        }
        if bytes.contains(&0) {
            return Err(Error::EmbeddedNul);
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
    }

    pub fn take_signature(&mut self) -> Result<Signature> {
        let len = self.take_u8()? as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(Error::EmbeddedNul);
        }
        let s = std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
        Signature::try_from(s)
    }
}
