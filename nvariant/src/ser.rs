use crate::{
    endian::{padding_for, Endian},
    EncodingContext, Error, Result, Signature, Structure, Value,
};

/// The maximum encoded size of an array, in bytes.
pub const MAX_ARRAY_BYTES: usize = 1 << 26;

/// Encode a sequence of values in the given context.
pub fn to_bytes(ctxt: EncodingContext, values: &[Value]) -> Result<Vec<u8>> {
    let mut encoder = Encoder::new(ctxt);
    for value in values {
        encoder.put_value(value)?;
    }
    Ok(encoder.into_bytes())
}

/// Writes values into a growable buffer, tracking the absolute position in
/// the message so that alignment comes out right.
#[derive(Debug)]
pub struct Encoder {
    buf: Vec<u8>,
    base: usize,
    endian: Endian,
}

impl Encoder {
    pub fn new(ctxt: EncodingContext) -> Self {
        Encoder {
            buf: Vec::new(),
            base: ctxt.position(),
            endian: ctxt.endian(),
        }
    }

    /// The absolute position of the next byte within the message.
    pub fn position(&self) -> usize {
        self.base + self.buf.len()
    }

    /// Write zeroed padding up to `align`.
    pub fn pad(&mut self, align: usize) {
        let padding = padding_for(self.position(), align);
        self.buf.extend(std::iter::repeat(0u8).take(padding));
    }

    /// Encode one value, padded to its own alignment.
    pub fn put_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::U8(v) => self.buf.push(*v),
            Value::Bool(v) => {
                self.pad(4);
                self.endian.put_u32(&mut self.buf, u32::from(*v));
            }
            Value::I16(v) => {
                self.pad(2);
                self.endian.put_u16(&mut self.buf, *v as u16);
            }
            Value::U16(v) => {
                self.pad(2);
                self.endian.put_u16(&mut self.buf, *v);
            }
            Value::I32(v) => {
                self.pad(4);
                self.endian.put_u32(&mut self.buf, *v as u32);
            }
            Value::U32(v) => {
                self.pad(4);
                self.endian.put_u32(&mut self.buf, *v);
            }
            Value::I64(v) => {
                self.pad(8);
                self.endian.put_u64(&mut self.buf, *v as u64);
            }
            Value::U64(v) => {
                self.pad(8);
                self.endian.put_u64(&mut self.buf, *v);
            }
            Value::F64(v) => {
                self.pad(8);
                self.endian.put_f64(&mut self.buf, *v);
            }
            Value::Str(s) => self.put_str(s)?,
            Value::ObjectPath(p) => self.put_str(p.as_str())?,
            Value::Signature(s) => self.put_signature(s),
            Value::Fd(index) => {
                self.pad(4);
                self.endian.put_u32(&mut self.buf, *index);
            }
            Value::Array(array) => {
                let align = array.element_type().alignment();
                self.put_array(align, array.iter(), |enc, item| enc.put_value(item))?;
            }
            Value::Dict(dict) => {
                self.put_array(8, dict.iter(), Self::put_dict_entry)?;
            }
            Value::Structure(structure) => self.put_structure(structure)?,
            Value::Variant(inner) => {
                self.put_signature(&inner.signature());
                self.put_value(inner)?;
            }
        }

        Ok(())
    }

    /// u32 length (excluding the terminator), bytes, NUL.
    fn put_str(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::EmbeddedNul);
        }
        self.pad(4);
        self.endian.put_u32(&mut self.buf, s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// u8 length, bytes, NUL. Signatures are at most 255 bytes by
    /// construction.
    fn put_signature(&mut self, s: &Signature) {
        self.buf.push(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn put_array<T>(
        &mut self,
        elem_align: usize,
        items: impl Iterator<Item = T>,
        mut put: impl FnMut(&mut Self, T) -> Result<()>,
    ) -> Result<()> {
        self.pad(4);
        let len_at = self.buf.len();
        self.endian.put_u32(&mut self.buf, 0);
        // Padding to the element alignment is part of the encoding even for
        // an empty array, but is not counted in the array length.
        self.pad(elem_align);
        let start = self.buf.len();
        for item in items {
            put(self, item)?;
        }
        let len = self.buf.len() - start;
        if len > MAX_ARRAY_BYTES {
            return Err(Error::TooLarge {
                what: "array",
                max: MAX_ARRAY_BYTES,
            });
        }
        self.endian.set_u32(&mut self.buf[len_at..len_at + 4], len as u32);
        Ok(())
    }

    fn put_dict_entry(&mut self, entry: &(Value, Value)) -> Result<()> {
        self.pad(8);
        self.put_value(&entry.0)?;
        self.put_value(&entry.1)
    }

    fn put_structure(&mut self, structure: &Structure) -> Result<()> {
        if structure.is_empty() {
            return Err(Error::InvalidSignature("()".to_string()));
        }
        self.pad(8);
        for field in structure.fields() {
            self.put_value(field)?;
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
