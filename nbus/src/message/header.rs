use enumflags2::{bitflags, BitFlags};
use nvariant::Endian;

use crate::{Error, Result};

pub(crate) const PRIMARY_HEADER_SIZE: usize = 12;
pub(crate) const MIN_MESSAGE_SIZE: usize = PRIMARY_HEADER_SIZE + 4;
pub(crate) const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024; // 128 MiB

/// D-Bus code for endianness.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndianSig {
    /// The message is in big-endian (network) byte order.
    Big = b'B',

    /// The message is in little-endian byte order.
    Little = b'l',
}

impl TryFrom<u8> for EndianSig {
    type Error = Error;

    fn try_from(val: u8) -> Result<EndianSig> {
        match val {
            b'B' => Ok(EndianSig::Big),
            b'l' => Ok(EndianSig::Little),
            _ => Err(Error::IncorrectEndian),
        }
    }
}

impl From<EndianSig> for Endian {
    fn from(sig: EndianSig) -> Endian {
        match sig {
            EndianSig::Big => Endian::Big,
            EndianSig::Little => Endian::Little,
        }
    }
}

#[cfg(target_endian = "big")]
/// Signature of the target's native endian.
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Big;
#[cfg(target_endian = "little")]
/// Signature of the target's native endian.
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Little;

/// The type of a message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Invalid message type. Unknown types on received messages decode to
    /// this and are ignored.
    Invalid = 0,
    /// Method call. This message type may prompt a reply (and typically does).
    MethodCall = 1,
    /// A reply to a method call.
    MethodReturn = 2,
    /// An error in response to a method call.
    Error = 3,
    /// Signal emission.
    Signal = 4,
}

impl From<u8> for Type {
    fn from(val: u8) -> Type {
        match val {
            1 => Type::MethodCall,
            2 => Type::MethodReturn,
            3 => Type::Error,
            4 => Type::Signal,
            _ => Type::Invalid,
        }
    }
}

/// Pre-defined flags that can be passed in the message header.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flags {
    /// This message does not expect method return replies or error replies,
    /// even if it is of a type that can have a reply; the reply should be
    /// omitted.
    NoReplyExpected = 0x1,
    /// The bus must not launch an owner for the destination name in response
    /// to this message.
    NoAutoStart = 0x2,
    /// The caller is prepared to wait for interactive authorization, which
    /// might take a considerable time to complete.
    AllowInteractiveAuth = 0x4,
}

/// The fixed 12-byte header prefix present in every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    endian_sig: EndianSig,
    msg_type: Type,
    flags: BitFlags<Flags>,
    protocol_version: u8,
    body_len: u32,
    serial_num: u32,
}

impl PrimaryHeader {
    /// Create a new `PrimaryHeader`. The serial is left unassigned (0) for
    /// the connection to fill in at send time.
    pub fn new(msg_type: Type, body_len: u32) -> Self {
        Self {
            endian_sig: NATIVE_ENDIAN_SIG,
            msg_type,
            flags: BitFlags::empty(),
            protocol_version: 1,
            body_len,
            serial_num: 0,
        }
    }

    /// Parse the fixed prefix plus the length of the header-field array that
    /// follows it. `buf` must hold at least [`MIN_MESSAGE_SIZE`] bytes.
    pub(crate) fn read(buf: &[u8]) -> Result<(PrimaryHeader, u32)> {
        if buf.len() < MIN_MESSAGE_SIZE {
            return Err(Error::ExcessData);
        }
        let endian_sig = EndianSig::try_from(buf[0])?;
        let endian = Endian::from(endian_sig);
        let msg_type = Type::from(buf[1]);
        // Unknown flag bits must be ignored.
        let flags = BitFlags::from_bits_truncate(buf[2]);
        let protocol_version = buf[3];
        if protocol_version != 1 {
            return Err(Error::UnsupportedProtocol(protocol_version));
        }
        let body_len = endian.get_u32(&buf[4..8]);
        let serial_num = endian.get_u32(&buf[8..12]);
        let fields_len = endian.get_u32(&buf[12..16]);

        let header = PrimaryHeader {
            endian_sig,
            msg_type,
            flags,
            protocol_version,
            body_len,
            serial_num,
        };
        Ok((header, fields_len))
    }

    /// Write the fixed 12-byte prefix.
    pub(crate) fn write(&self, buf: &mut Vec<u8>) {
        let endian = Endian::from(self.endian_sig);
        buf.push(self.endian_sig as u8);
        buf.push(self.msg_type as u8);
        buf.push(self.flags.bits());
        buf.push(self.protocol_version);
        endian.put_u32(buf, self.body_len);
        endian.put_u32(buf, self.serial_num);
    }

    pub fn endian_sig(&self) -> EndianSig {
        self.endian_sig
    }

    pub fn set_endian_sig(&mut self, sig: EndianSig) {
        self.endian_sig = sig;
    }

    pub fn msg_type(&self) -> Type {
        self.msg_type
    }

    pub fn flags(&self) -> BitFlags<Flags> {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BitFlags<Flags>) {
        self.flags = flags;
    }

    /// The major version of the protocol the message is compliant to.
    ///
    /// Currently only `1` is valid.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    pub fn body_len(&self) -> u32 {
        self.body_len
    }

    pub fn set_body_len(&mut self, len: u32) {
        self.body_len = len;
    }

    /// The serial number of the message, or 0 while unassigned.
    ///
    /// This is set by the connection the message is sent over and used to
    /// match a reply to a method call.
    pub fn serial_num(&self) -> u32 {
        self.serial_num
    }

    pub(crate) fn set_serial_num(&mut self, serial: u32) {
        self.serial_num = serial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trip() {
        let mut header = PrimaryHeader::new(Type::MethodCall, 7);
        header.set_endian_sig(EndianSig::Little);
        header.set_serial_num(42);
        header.set_flags(Flags::NoAutoStart.into());

        let mut buf = Vec::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), PRIMARY_HEADER_SIZE);
        // Field-array length follows the prefix on the wire.
        buf.extend_from_slice(&[0, 0, 0, 0]);

        let (parsed, fields_len) = PrimaryHeader::read(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(fields_len, 0);
    }

    #[test]
    fn bad_prefixes() {
        let mut buf = vec![b'l', 1, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        buf[0] = b'x';
        assert!(matches!(
            PrimaryHeader::read(&buf),
            Err(Error::IncorrectEndian)
        ));

        buf[0] = b'l';
        buf[3] = 2;
        assert!(matches!(
            PrimaryHeader::read(&buf),
            Err(Error::UnsupportedProtocol(2))
        ));
    }

    #[test]
    fn unknown_flags_ignored() {
        let buf = vec![b'l', 4, 0xFF, 1, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        let (parsed, _) = PrimaryHeader::read(&buf).unwrap();
        assert_eq!(
            parsed.flags(),
            Flags::NoReplyExpected | Flags::NoAutoStart | Flags::AllowInteractiveAuth
        );
    }
}
