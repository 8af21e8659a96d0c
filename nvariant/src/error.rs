use std::{error, fmt};

/// Error type used by the whole crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The signature string does not follow the D-Bus type grammar.
    InvalidSignature(String),
    /// The object path does not follow the D-Bus object path rules.
    InvalidObjectPath(String),
    /// A value did not match the type the signature called for.
    TypeMismatch {
        /// The signature of the expected type.
        expected: String,
        /// The signature of the value that was provided.
        found: String,
    },
    /// Ran out of input before the value was complete.
    OutOfBounds,
    /// A padding byte on the wire was not zero.
    NonZeroPadding,
    /// A boolean was encoded as something other than 0 or 1.
    InvalidBool(u32),
    /// A string on the wire was not valid UTF-8.
    InvalidUtf8,
    /// A string contained an interior NUL byte, or the wire terminator was missing.
    EmbeddedNul,
    /// The declared byte length of an array did not match the encoded elements.
    ArrayLengthMismatch {
        declared: usize,
        actual: usize,
    },
    /// Input remained after the complete value was decoded.
    ExcessData(usize),
    /// A size limit from the D-Bus specification was exceeded.
    TooLarge {
        what: &'static str,
        max: usize,
    },
    /// Container nesting exceeded the limits from the D-Bus specification.
    DepthExceeded,
    /// A value could not be converted to the requested Rust type.
    IncorrectType,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidSignature(s) => write!(f, "invalid signature: {s}"),
            Error::InvalidObjectPath(p) => write!(f, "invalid object path: {p}"),
            Error::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected `{expected}`, found `{found}`")
            }
            Error::OutOfBounds => write!(f, "unexpected end of input"),
            Error::NonZeroPadding => write!(f, "non-zero padding byte"),
            Error::InvalidBool(v) => write!(f, "invalid boolean value: {v}"),
            Error::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Error::EmbeddedNul => write!(f, "string is missing its NUL terminator or contains one"),
            Error::ArrayLengthMismatch { declared, actual } => {
                write!(f, "array length mismatch: declared {declared} bytes, found {actual}")
            }
            Error::ExcessData(n) => write!(f, "{n} trailing bytes after complete value"),
            Error::TooLarge { what, max } => write!(f, "{what} exceeds the maximum of {max}"),
            Error::DepthExceeded => write!(f, "maximum container depth exceeded"),
            Error::IncorrectType => write!(f, "value cannot be converted to the requested type"),
        }
    }
}

impl error::Error for Error {}

/// Alias for a `Result` with the error type [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
