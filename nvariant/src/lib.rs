//! D-Bus type signatures, dynamically-typed values and their wire encoding.
//!
//! This crate implements the [D-Bus marshalling rules]: type signature
//! parsing into a [`Type`] tree, a dynamically-typed [`Value`] model, and a
//! byte-order-parametric codec that encodes and decodes values with the
//! alignment computed relative to the start of the message.
//!
//! The codec enforces the wire invariants of the specification on both
//! directions: zeroed padding, exact array lengths, 0/1 booleans, validated
//! strings, signatures and object paths, and the container depth and size
//! limits.
//!
//! [D-Bus marshalling rules]: https://dbus.freedesktop.org/doc/dbus-specification.html#message-protocol-marshaling

pub mod de;
mod endian;
mod error;
mod object_path;
pub mod ser;
mod signature;
mod value;

pub use de::{from_slice, Decoder};
pub use endian::{padding_for, Endian, EncodingContext, NATIVE_ENDIAN};
pub use error::{Error, Result};
pub use object_path::ObjectPath;
pub use ser::{to_bytes, Encoder, MAX_ARRAY_BYTES};
pub use signature::{
    Signature, SingleTypes, Type, MAX_ARRAY_DEPTH, MAX_SIGNATURE_LEN, MAX_STRUCT_DEPTH,
};
pub use value::{
    check_signature, Array, Dict, StructFields, StructInit, Structure, StructureBuilder, Value,
};

use static_assertions::assert_impl_all;

assert_impl_all!(Value: Send, Sync, Unpin);
assert_impl_all!(Signature: Send, Sync, Unpin);
assert_impl_all!(ObjectPath: Send, Sync, Unpin);

#[cfg(test)]
mod tests {
    use super::*;

    fn ctxt(endian: Endian) -> EncodingContext {
        EncodingContext::new(endian, 0)
    }

    fn round_trip(values: &[Value], signature: &str, endian: Endian) -> Vec<u8> {
        let signature = Signature::try_from(signature).unwrap();
        check_signature(values, &signature).unwrap();
        let bytes = to_bytes(ctxt(endian), values).unwrap();
        let decoded = from_slice(ctxt(endian), &signature, &bytes).unwrap();
        assert_eq!(decoded, values, "decoded form differs");
        let again = to_bytes(ctxt(endian), &decoded).unwrap();
        assert_eq!(again, bytes, "re-encoded bytes differ");
        bytes
    }

    #[test]
    fn string_array_layout() {
        let mut array = Array::new(Type::String);
        array.push(Value::from("foo")).unwrap();
        array.push(Value::from("bar")).unwrap();
        let bytes = round_trip(&[Value::Array(array)], "as", Endian::Little);
        assert_eq!(
            bytes,
            [
                0x14, 0x00, 0x00, 0x00, // array length: 20
                0x03, 0x00, 0x00, 0x00, 0x66, 0x6F, 0x6F, 0x00, // "foo"
                0x03, 0x00, 0x00, 0x00, 0x62, 0x61, 0x72, 0x00, // "bar"
            ]
        );
    }

    #[test]
    fn empty_struct_array_layout() {
        let array = Array::new(Type::Struct(vec![Type::Int32, Type::Int32]));
        let bytes = round_trip(&[Value::Array(array)], "a(ii)", Endian::Little);
        // Length 0, then padding to the 8-byte struct alignment. The padding
        // counts into the offset but not into the length.
        assert_eq!(bytes, [0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn primitives_round_trip_both_endians() {
        let values = vec![
            Value::from(0x12u8),
            Value::from(true),
            Value::from(-2i16),
            Value::from(0xBEEFu16),
            Value::from(-70000i32),
            Value::from(0xDEAD_BEEFu32),
            Value::from(-5_000_000_000i64),
            Value::from(u64::MAX - 1),
            Value::from(1.25f64),
            Value::from("hello"),
            Value::ObjectPath(ObjectPath::try_from("/org/example").unwrap()),
            Value::Signature(Signature::try_from("a{sv}").unwrap()),
            Value::Fd(2),
        ];
        for endian in [Endian::Little, Endian::Big] {
            round_trip(&values, "ybnqiuxtdsogh", endian);
        }
    }

    #[test]
    fn containers_round_trip() {
        let mut dict = Dict::new(Type::String, Type::Variant).unwrap();
        dict.insert(Value::from("speed"), Value::from(88u32).into_variant())
            .unwrap();
        dict.insert(Value::from("label"), Value::from("flux").into_variant())
            .unwrap();

        let structure = Structure::builder()
            .append(1i32)
            .append("two")
            .append(Value::Dict(dict))
            .build()
            .unwrap();

        let mut outer = Array::new(Type::Array(Box::new(Type::Byte)));
        let mut inner = Array::new(Type::Byte);
        inner.push(Value::from(1u8)).unwrap();
        outer.push(Value::Array(inner)).unwrap();

        let values = vec![
            Value::Structure(structure),
            Value::Array(outer),
            Value::from(7u8).into_variant().into_variant(),
        ];
        for endian in [Endian::Little, Endian::Big] {
            round_trip(&values, "(isa{sv})aayv", endian);
        }
    }

    #[test]
    fn nonzero_padding_rejected() {
        // Empty a(ii): length 0 then 4 bytes of struct-alignment padding.
        let bytes = [0, 0, 0, 0, 0, 0, 0xFF, 0];
        let signature = Signature::try_from("a(ii)").unwrap();
        assert_eq!(
            from_slice(ctxt(Endian::Little), &signature, &bytes),
            Err(Error::NonZeroPadding)
        );
    }

    #[test]
    fn bool_out_of_range_rejected() {
        let signature = Signature::try_from("b").unwrap();
        let bytes = [2, 0, 0, 0];
        assert_eq!(
            from_slice(ctxt(Endian::Little), &signature, &bytes),
            Err(Error::InvalidBool(2))
        );
    }

    #[test]
    fn array_length_mismatch_rejected() {
        // Declared length 6 cannot hold a whole number of u32 elements.
        let bytes = [6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0];
        let signature = Signature::try_from("au").unwrap();
        assert!(matches!(
            from_slice(ctxt(Endian::Little), &signature, &bytes),
            Err(Error::ArrayLengthMismatch { declared: 6, .. })
        ));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let bytes = to_bytes(ctxt(Endian::Little), &[Value::from(1u32)]).unwrap();
        let mut with_trailer = bytes.clone();
        with_trailer.push(0);
        let signature = Signature::try_from("u").unwrap();
        assert_eq!(
            from_slice(ctxt(Endian::Little), &signature, &with_trailer),
            Err(Error::ExcessData(1))
        );
    }

    #[test]
    fn alignment_is_relative_to_message_start() {
        // At position 2, a u32 needs 2 bytes of padding.
        let at_two = EncodingContext::new(Endian::Little, 2);
        let bytes = to_bytes(at_two, &[Value::from(9u32)]).unwrap();
        assert_eq!(bytes, [0, 0, 9, 0, 0, 0]);
        let decoded = from_slice(at_two, &Signature::try_from("u").unwrap(), &bytes).unwrap();
        assert_eq!(decoded, vec![Value::from(9u32)]);
    }

    #[test]
    fn variant_signature_must_be_single_type() {
        // A variant whose signature is "ii" is invalid.
        let bytes = [2, b'i', b'i', 0, 1, 0, 0, 0, 2, 0, 0, 0];
        let signature = Signature::try_from("v").unwrap();
        assert!(from_slice(ctxt(Endian::Little), &signature, &bytes).is_err());
    }

    #[test]
    fn decoded_path_and_signature_are_validated() {
        // "o" value holding a non-path string.
        let bad_path = [3, 0, 0, 0, b'a', b'b', b'c', 0];
        let signature = Signature::try_from("o").unwrap();
        assert!(from_slice(ctxt(Endian::Little), &signature, &bad_path).is_err());

        let bad_sig = [1, b'z', 0];
        let signature = Signature::try_from("g").unwrap();
        assert!(from_slice(ctxt(Endian::Little), &signature, &bad_sig).is_err());
    }
}
