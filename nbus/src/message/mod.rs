//! The D-Bus message: fixed header prefix, header-field array and body.

mod field;
mod header;

pub use field::{Field, FieldCode, Fields};
pub use header::{EndianSig, Flags, PrimaryHeader, Type, NATIVE_ENDIAN_SIG};
pub(crate) use header::{MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE, PRIMARY_HEADER_SIZE};

use std::{fmt, os::fd::OwnedFd};

use nvariant::{padding_for, Endian, EncodingContext, ObjectPath, Signature, Value};

use crate::{
    names::{BusName, ErrorName, InterfaceName, MemberName, UniqueName},
    Error, Result,
};

/// A whole D-Bus message.
///
/// A message holds its decoded header fields and body values rather than
/// serialized bytes; [`Message::encode`] produces the exact wire form and
/// [`Message::decode`] is its inverse. Any file descriptors travelling with
/// the message are owned by it and closed when it is dropped.
pub struct Message {
    primary: PrimaryHeader,
    fields: Fields,
    body: Vec<Value>,
    fds: Vec<OwnedFd>,
}

impl Message {
    /// The fixed 12-byte header prefix.
    pub fn primary_header(&self) -> &PrimaryHeader {
        &self.primary
    }

    /// The header fields.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// The message type.
    pub fn message_type(&self) -> Type {
        self.primary.msg_type()
    }

    /// The serial number, or 0 while unassigned.
    pub fn serial(&self) -> u32 {
        self.primary.serial_num()
    }

    pub(crate) fn set_serial(&mut self, serial: u32) {
        self.primary.set_serial_num(serial);
    }

    /// The flags set on this message.
    pub fn flags(&self) -> enumflags2::BitFlags<Flags> {
        self.primary.flags()
    }

    /// The object to send a call to, or the object a signal is emitted from.
    pub fn path(&self) -> Option<&ObjectPath> {
        match self.fields.get(FieldCode::Path) {
            Some(Field::Path(p)) => Some(p),
            _ => None,
        }
    }

    /// The interface to invoke a method call on, or that a signal is emitted
    /// from.
    pub fn interface(&self) -> Option<&InterfaceName> {
        match self.fields.get(FieldCode::Interface) {
            Some(Field::Interface(i)) => Some(i),
            _ => None,
        }
    }

    /// The member, either the method name or signal name.
    pub fn member(&self) -> Option<&MemberName> {
        match self.fields.get(FieldCode::Member) {
            Some(Field::Member(m)) => Some(m),
            _ => None,
        }
    }

    /// The name of the error that occurred, for errors.
    pub fn error_name(&self) -> Option<&ErrorName> {
        match self.fields.get(FieldCode::ErrorName) {
            Some(Field::ErrorName(e)) => Some(e),
            _ => None,
        }
    }

    /// The serial number of the message this message is a reply to.
    pub fn reply_serial(&self) -> Option<u32> {
        match self.fields.get(FieldCode::ReplySerial) {
            Some(Field::ReplySerial(s)) => Some(*s),
            _ => None,
        }
    }

    /// The name of the connection this message is intended for.
    pub fn destination(&self) -> Option<&BusName> {
        match self.fields.get(FieldCode::Destination) {
            Some(Field::Destination(d)) => Some(d),
            _ => None,
        }
    }

    /// Unique name of the sending connection.
    pub fn sender(&self) -> Option<&UniqueName> {
        match self.fields.get(FieldCode::Sender) {
            Some(Field::Sender(s)) => Some(s),
            _ => None,
        }
    }

    /// The signature of the body, empty if the body is empty.
    pub fn body_signature(&self) -> Signature {
        match self.fields.get(FieldCode::Signature) {
            Some(Field::Signature(s)) => s.clone(),
            _ => Signature::empty(),
        }
    }

    /// The number of Unix file descriptors accompanying the message.
    pub fn unix_fds(&self) -> u32 {
        match self.fields.get(FieldCode::UnixFds) {
            Some(Field::UnixFds(n)) => *n,
            _ => 0,
        }
    }

    /// The body values.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// The file descriptors owned by this message. `Value::Fd` body values
    /// hold indexes into this array.
    pub fn fds(&self) -> &[OwnedFd] {
        &self.fds
    }

    /// Take ownership of the file descriptors, leaving the message without
    /// any.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Serialize into a single buffer. The declared body length is updated
    /// to the actual encoded size.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        let endian = Endian::from(self.primary.endian_sig());

        let body = nvariant::to_bytes(EncodingContext::new(endian, 0), &self.body)?;
        let body_len =
            u32::try_from(body.len()).map_err(|_| Error::ExcessData)?;
        self.primary.set_body_len(body_len);

        let mut buf = Vec::with_capacity(MIN_MESSAGE_SIZE + body.len());
        self.primary.write(&mut buf);

        let fields = nvariant::to_bytes(
            EncodingContext::new(endian, PRIMARY_HEADER_SIZE),
            &[self.fields.to_value()?],
        )?;
        buf.extend_from_slice(&fields);

        let padding = padding_for(buf.len(), 8);
        buf.extend(std::iter::repeat(0u8).take(padding));
        buf.extend_from_slice(&body);

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(Error::ExcessData);
        }

        Ok(buf)
    }

    /// Parse a whole message frame. `bytes` must be exactly one message, as
    /// framed by the connection's read loop.
    pub fn decode(bytes: &[u8], fds: Vec<OwnedFd>) -> Result<Message> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(Error::ExcessData);
        }
        let (primary, fields_len) = PrimaryHeader::read(bytes)?;
        let endian = Endian::from(primary.endian_sig());

        let header_len = MIN_MESSAGE_SIZE + fields_len as usize;
        let body_offset = header_len + padding_for(header_len, 8);
        if bytes.len() < body_offset {
            return Err(Error::ExcessData);
        }

        let mut fields_value = nvariant::from_slice(
            EncodingContext::new(endian, PRIMARY_HEADER_SIZE),
            &Signature::from_str_unchecked("a(yv)"),
            &bytes[PRIMARY_HEADER_SIZE..header_len],
        )?;
        let fields = Fields::from_value(fields_value.remove(0))?;

        // Padding between the header and the body must be zeroed like any
        // other padding.
        if bytes[header_len..body_offset].iter().any(|&b| b != 0) {
            return Err(Error::Variant(nvariant::Error::NonZeroPadding));
        }

        let body_bytes = &bytes[body_offset..];
        if body_bytes.len() != primary.body_len() as usize {
            return Err(Error::ExcessData);
        }
        let signature = match fields.get(FieldCode::Signature) {
            Some(Field::Signature(s)) => s.clone(),
            _ if !body_bytes.is_empty() => return Err(Error::MissingField),
            _ => Signature::empty(),
        };
        let body = nvariant::from_slice(
            EncodingContext::new(endian, body_offset),
            &signature,
            body_bytes,
        )?;

        let declared_fds = match fields.get(FieldCode::UnixFds) {
            Some(Field::UnixFds(n)) => *n as usize,
            _ => 0,
        };
        if declared_fds != fds.len() {
            return Err(Error::FdCountMismatch);
        }

        let msg = Message {
            primary,
            fields,
            body,
            fds,
        };
        if msg.message_type() != Type::Invalid {
            if msg.serial() == 0 {
                return Err(Error::MissingField);
            }
            msg.validate()?;
        }

        Ok(msg)
    }

    /// Check the required-field matrix for this message type.
    fn validate(&self) -> Result<()> {
        let required: &[FieldCode] = match self.message_type() {
            Type::MethodCall => &[FieldCode::Path, FieldCode::Member],
            Type::MethodReturn => &[FieldCode::ReplySerial],
            Type::Error => &[FieldCode::ErrorName, FieldCode::ReplySerial],
            Type::Signal => &[FieldCode::Path, FieldCode::Interface, FieldCode::Member],
            Type::Invalid => &[],
        };
        for code in required {
            if self.fields.get(*code).is_none() {
                return Err(Error::MissingField);
            }
        }
        if !self.body.is_empty() && self.fields.get(FieldCode::Signature).is_none() {
            return Err(Error::MissingField);
        }
        Ok(())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        // File descriptors compare by count only; two reads of the same
        // message hold different duplicates.
        self.primary == other.primary
            && self.fields == other.fields
            && self.body == other.body
            && self.fds.len() == other.fds.len()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = f.debug_struct("Msg");
        msg.field("type", &self.message_type());
        msg.field("serial", &self.serial());
        if let Some(sender) = self.sender() {
            msg.field("sender", &sender);
        }
        if let Some(serial) = self.reply_serial() {
            msg.field("reply-serial", &serial);
        }
        if let Some(path) = self.path() {
            msg.field("path", &path);
        }
        if let Some(iface) = self.interface() {
            msg.field("iface", &iface);
        }
        if let Some(member) = self.member() {
            msg.field("member", &member);
        }
        if let Some(error) = self.error_name() {
            msg.field("error", &error);
        }
        let signature = self.body_signature();
        if !signature.is_empty() {
            msg.field("body", &signature.as_str());
        }
        if !self.fds.is_empty() {
            msg.field("fds", &self.fds.len());
        }
        msg.finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_type() {
            Type::MethodCall => {
                write!(f, "Method call")?;
                if let Some(member) = self.member() {
                    write!(f, " {member}")?;
                }
            }
            Type::MethodReturn => write!(f, "Method return")?,
            Type::Error => {
                write!(f, "Error")?;
                if let Some(name) = self.error_name() {
                    write!(f, " {name}")?;
                }
            }
            Type::Signal => {
                write!(f, "Signal")?;
                if let Some(member) = self.member() {
                    write!(f, " {member}")?;
                }
            }
            Type::Invalid => write!(f, "Unknown message")?,
        }
        if let Some(sender) = self.sender() {
            write!(f, " from {sender}")?;
        }
        Ok(())
    }
}

/// A builder for [`Message`].
#[derive(Debug)]
pub struct Builder {
    primary: PrimaryHeader,
    fields: Fields,
    body: Vec<Value>,
    fds: Vec<OwnedFd>,
}

impl Builder {
    fn new(msg_type: Type) -> Self {
        Builder {
            primary: PrimaryHeader::new(msg_type, 0),
            fields: Fields::new(),
            body: Vec::new(),
            fds: Vec::new(),
        }
    }

    /// Create a message of type [`Type::MethodCall`].
    pub fn method_call<P, M>(path: P, method_name: M) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        M: TryInto<MemberName>,
        P::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        Self::new(Type::MethodCall).path(path)?.member(method_name)
    }

    /// Create a message of type [`Type::Signal`].
    pub fn signal<P, I, M>(path: P, interface: I, name: M) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        I: TryInto<InterfaceName>,
        M: TryInto<MemberName>,
        P::Error: Into<Error>,
        I::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        Self::new(Type::Signal)
            .path(path)?
            .interface(interface)?
            .member(name)
    }

    /// Create a message of type [`Type::MethodReturn`] replying to `call`.
    pub fn method_return(call: &Message) -> Result<Self> {
        Self::new(Type::MethodReturn).reply_to(call)
    }

    /// Create a message of type [`Type::Error`] replying to `call`.
    pub fn error<E>(call: &Message, name: E) -> Result<Self>
    where
        E: TryInto<ErrorName>,
        E::Error: Into<Error>,
    {
        Self::new(Type::Error).error_name(name)?.reply_to(call)
    }

    /// Add flags to the message.
    ///
    /// Returns an error when `NoReplyExpected` is requested on anything but a
    /// method call.
    pub fn with_flags(mut self, flag: Flags) -> Result<Self> {
        if self.primary.msg_type() != Type::MethodCall && flag == Flags::NoReplyExpected {
            return Err(Error::InvalidField);
        }
        let flags = self.primary.flags() | flag;
        self.primary.set_flags(flags);
        Ok(self)
    }

    /// Select the byte order to encode with. Defaults to the native order.
    pub fn endian(mut self, sig: EndianSig) -> Self {
        self.primary.set_endian_sig(sig);
        self
    }

    /// Set the unique name of the sending connection.
    pub fn sender<S>(mut self, sender: S) -> Result<Self>
    where
        S: TryInto<UniqueName>,
        S::Error: Into<Error>,
    {
        self.fields
            .replace(Field::Sender(sender.try_into().map_err(Into::into)?));
        Ok(self)
    }

    /// Set the object to send a call to, or the object a signal is emitted
    /// from.
    pub fn path<P>(mut self, path: P) -> Result<Self>
    where
        P: TryInto<ObjectPath>,
        P::Error: Into<Error>,
    {
        self.fields
            .replace(Field::Path(path.try_into().map_err(Into::into)?));
        Ok(self)
    }

    /// Set the interface to invoke a method call on, or that a signal is
    /// emitted from.
    pub fn interface<I>(mut self, interface: I) -> Result<Self>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        self.fields
            .replace(Field::Interface(interface.try_into().map_err(Into::into)?));
        Ok(self)
    }

    /// Set the member, either the method name or signal name.
    pub fn member<M>(mut self, member: M) -> Result<Self>
    where
        M: TryInto<MemberName>,
        M::Error: Into<Error>,
    {
        self.fields
            .replace(Field::Member(member.try_into().map_err(Into::into)?));
        Ok(self)
    }

    fn error_name<E>(mut self, error: E) -> Result<Self>
    where
        E: TryInto<ErrorName>,
        E::Error: Into<Error>,
    {
        self.fields
            .replace(Field::ErrorName(error.try_into().map_err(Into::into)?));
        Ok(self)
    }

    /// Set the name of the connection this message is intended for.
    pub fn destination<D>(mut self, destination: D) -> Result<Self>
    where
        D: TryInto<BusName>,
        D::Error: Into<Error>,
    {
        self.fields
            .replace(Field::Destination(destination.try_into().map_err(Into::into)?));
        Ok(self)
    }

    fn reply_to(mut self, call: &Message) -> Result<Self> {
        let serial = call.serial();
        if serial == 0 {
            return Err(Error::MissingField);
        }
        self.fields.replace(Field::ReplySerial(serial));
        if let Some(sender) = call.sender() {
            self = self.destination(BusName::Unique(sender.clone()))?;
        }
        Ok(self)
    }

    /// Set the body. The `SIGNATURE` header field is derived from the values.
    pub fn body(mut self, body: Vec<Value>) -> Result<Self> {
        let types: Vec<_> = body.iter().map(Value::ty).collect();
        let signature = Signature::from_types(&types);
        if !signature.is_empty() {
            self.fields.replace(Field::Signature(signature));
        }
        self.body = body;
        Ok(self)
    }

    /// Attach file descriptors. `Value::Fd` body values index into this
    /// array; the `UNIX_FDS` header field carries the count.
    pub fn attach_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        if !fds.is_empty() {
            self.fields.replace(Field::UnixFds(fds.len() as u32));
        }
        self.fds = fds;
        self
    }

    /// Validate the header-field matrix and produce the message.
    pub fn build(self) -> Result<Message> {
        let msg = Message {
            primary: self.primary,
            fields: self.fields,
            body: self.body,
            fds: self.fds,
        };
        msg.validate()?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_call_layout() {
        let mut msg = Builder::method_call("/a", "Ping")
            .unwrap()
            .interface("org.freedesktop.DBus.Peer")
            .unwrap()
            .destination("org.example")
            .unwrap()
            .endian(EndianSig::Little)
            .build()
            .unwrap();
        msg.set_serial(1);

        let bytes = msg.encode().unwrap();
        assert_eq!(
            &bytes[..12],
            &[0x6C, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
        );
        assert_eq!(bytes.len() % 8, 0);

        let decoded = Message::decode(&bytes, vec![]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn round_trip_both_endians() {
        for endian in [EndianSig::Little, EndianSig::Big] {
            let mut msg = Builder::signal("/org/example", "org.example.Iface", "Changed")
                .unwrap()
                .sender(":1.9")
                .unwrap()
                .endian(endian)
                .body(vec![Value::from("payload"), Value::from(42u32)])
                .unwrap()
                .build()
                .unwrap();
            msg.set_serial(7);

            let bytes = msg.encode().unwrap();
            let mut decoded = Message::decode(&bytes, vec![]).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn required_fields_enforced() {
        // A signal without an interface.
        let res = Builder::new(Type::Signal)
            .path("/a")
            .unwrap()
            .member("X")
            .unwrap()
            .build();
        assert!(matches!(res, Err(Error::MissingField)));

        // A method return without a reply serial.
        assert!(matches!(
            Builder::new(Type::MethodReturn).build(),
            Err(Error::MissingField)
        ));
    }

    #[test]
    fn no_reply_expected_only_on_calls() {
        let builder = Builder::signal("/a", "a.b", "S").unwrap();
        assert!(builder.with_flags(Flags::NoReplyExpected).is_err());

        let builder = Builder::method_call("/a", "M").unwrap();
        assert!(builder.with_flags(Flags::NoReplyExpected).is_ok());
    }

    #[test]
    fn reply_addresses_the_caller() {
        let mut call = Builder::method_call("/obj", "Frob")
            .unwrap()
            .sender(":1.7")
            .unwrap()
            .build()
            .unwrap();
        call.set_serial(33);

        let reply = Builder::method_return(&call)
            .unwrap()
            .body(vec![Value::from("done")])
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(reply.reply_serial(), Some(33));
        assert_eq!(reply.destination().map(|d| d.as_str()), Some(":1.7"));

        let err = Builder::error(&call, "org.example.Error.Bad")
            .unwrap()
            .body(vec![Value::from("nope")])
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(err.error_name().map(|e| e.as_str()), Some("org.example.Error.Bad"));
        assert_eq!(err.reply_serial(), Some(33));
    }

    #[test]
    fn unassigned_serial_rejected_on_decode() {
        let mut msg = Builder::method_call("/a", "M").unwrap().build().unwrap();
        let bytes = msg.encode().unwrap();
        assert!(Message::decode(&bytes, vec![]).is_err());
    }

    #[test]
    fn declared_body_length_must_match() {
        let mut msg = Builder::method_call("/a", "M")
            .unwrap()
            .body(vec![Value::from(5u32)])
            .unwrap()
            .build()
            .unwrap();
        msg.set_serial(1);
        let mut bytes = msg.encode().unwrap();
        // Truncate the body.
        bytes.truncate(bytes.len() - 4);
        assert!(Message::decode(&bytes, vec![]).is_err());
    }
}
