use std::{error, fmt, io, sync::Arc};

use crate::{fdo, names::ErrorName};

/// The error type for everything that can go wrong on a connection.
#[derive(Debug, Clone)]
pub enum Error {
    /// A bus address string could not be parsed or used.
    Address(String),
    /// The SASL handshake failed; the transport has been closed.
    Handshake(String),
    /// An I/O error on the transport.
    InputOutput(Arc<io::Error>),
    /// Marshalling or unmarshalling failed. On the decode path this is fatal
    /// for the connection.
    Variant(nvariant::Error),
    /// A name failed validation.
    InvalidName(String),
    /// A header field held a value of the wrong type.
    InvalidField,
    /// A header field required for the message type is missing.
    MissingField,
    /// A header field appeared twice.
    DuplicateField,
    /// The endianness flag was neither `l` nor `B`.
    IncorrectEndian,
    /// The peer speaks a protocol version other than 1.
    UnsupportedProtocol(u8),
    /// A message exceeded the maximum message size.
    ExcessData,
    /// The number of file descriptors received did not match the
    /// `UNIX_FDS` header field.
    FdCountMismatch,
    /// The remote peer replied with an error message.
    MethodError(ErrorName, Option<String>),
    /// A call to a standard interface failed.
    Fdo(Box<fdo::Error>),
    /// No reply arrived within the requested deadline.
    Timeout,
    /// The connection is closed; all outstanding and future calls fail.
    Disconnected,
    /// The outgoing queue exceeded its byte limit; the connection has been
    /// closed.
    QueueFull,
    /// Introspection data could not be parsed.
    Introspection(String),
    /// The operation is not supported on this connection (for example fd
    /// passing over TCP).
    Unsupported,
    /// An operation specific failure.
    Failure(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Address(e) => write!(f, "address error: {e}"),
            Error::Handshake(e) => write!(f, "handshake failed: {e}"),
            Error::InputOutput(e) => write!(f, "I/O error: {e}"),
            Error::Variant(e) => write!(f, "{e}"),
            Error::InvalidName(e) => write!(f, "{e}"),
            Error::InvalidField => write!(f, "invalid header field"),
            Error::MissingField => write!(f, "required header field missing"),
            Error::DuplicateField => write!(f, "duplicate header field"),
            Error::IncorrectEndian => write!(f, "invalid endianness flag"),
            Error::UnsupportedProtocol(v) => write!(f, "unsupported protocol version: {v}"),
            Error::ExcessData => write!(f, "message too large"),
            Error::FdCountMismatch => {
                write!(f, "file descriptor count does not match UNIX_FDS field")
            }
            Error::MethodError(name, detail) => write!(
                f,
                "{name}: {}",
                detail.as_deref().unwrap_or("no description")
            ),
            Error::Fdo(e) => write!(f, "{e}"),
            Error::Timeout => write!(f, "call timed out"),
            Error::Disconnected => write!(f, "connection closed"),
            Error::QueueFull => write!(f, "outgoing message queue limit exceeded"),
            Error::Introspection(e) => write!(f, "introspection error: {e}"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::Failure(e) => write!(f, "{e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::InputOutput(e) => Some(&**e),
            Error::Variant(e) => Some(e),
            Error::Fdo(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(i: std::convert::Infallible) -> Self {
        match i {}
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::InputOutput(Arc::new(e))
    }
}

impl From<nvariant::Error> for Error {
    fn from(e: nvariant::Error) -> Self {
        Error::Variant(e)
    }
}

impl From<fdo::Error> for Error {
    fn from(e: fdo::Error) -> Self {
        Error::Fdo(Box::new(e))
    }
}

/// Alias for a `Result` with the error type [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
