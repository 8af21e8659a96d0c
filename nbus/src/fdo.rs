//! Standard `org.freedesktop.DBus` interfaces and error taxonomy.
//!
//! The D-Bus specification defines a set of well-known error names and the
//! message-bus interface every broker implements. This module provides the
//! error type handlers and callers exchange with the bus, plus a thin typed
//! client for the bus peer itself.

use std::{error, fmt};

use enumflags2::{bitflags, BitFlags};
use nvariant::Value;

use crate::{
    names::{BusName, ErrorName, UniqueName, WellKnownName},
    Connection,
};

use crate::Result as BusResult;

/// The bus itself, as a destination.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// The object path of the bus peer.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
/// The interface of the bus peer.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

const ERROR_PREFIX: &str = "org.freedesktop.DBus.Error.";

macro_rules! fdo_errors {
    ($($(#[$doc:meta])* $variant:ident => $suffix:literal),+ $(,)?) => {
        /// Errors from the standard `org.freedesktop.DBus.Error` namespace,
        /// plus [`Error::Custom`] for implementation-chosen names.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Error {
            $($(#[$doc])* $variant(String),)+
            /// An error outside the standard namespace. The first field is
            /// the full D-Bus error name, the second the message.
            Custom(String, String),
        }

        impl Error {
            /// The D-Bus error name carried on the wire.
            pub fn name(&self) -> ErrorName {
                match self {
                    $(Error::$variant(_) => {
                        ErrorName::from_str_unchecked(concat!("org.freedesktop.DBus.Error.", $suffix))
                    })+
                    Error::Custom(name, _) => ErrorName::from_str_unchecked(name),
                }
            }

            /// The human-readable message.
            pub fn message(&self) -> &str {
                match self {
                    $(Error::$variant(msg) => msg,)+
                    Error::Custom(_, msg) => msg,
                }
            }

            /// Reconstruct from a wire error name and message.
            pub fn from_name(name: &str, message: String) -> Error {
                match name.strip_prefix(ERROR_PREFIX) {
                    $(Some($suffix) => Error::$variant(message),)+
                    _ => Error::Custom(name.to_string(), message),
                }
            }
        }
    };
}

fdo_errors! {
    /// A generic failure; see the message for details.
    Failed => "Failed",
    /// Not enough memory to complete the operation.
    NoMemory => "NoMemory",
    /// The bus does not know how to launch a service for this name.
    ServiceUnknown => "ServiceUnknown",
    /// The referenced bus name has no owner.
    NameHasNoOwner => "NameHasNoOwner",
    /// No reply arrived; usually a timeout.
    NoReply => "NoReply",
    /// Reading or writing a socket failed.
    IOError => "IOError",
    /// A bus address was malformed.
    BadAddress => "BadAddress",
    /// The operation is not supported.
    NotSupported => "NotSupported",
    /// A limited resource is exhausted.
    LimitsExceeded => "LimitsExceeded",
    /// Security restrictions forbid the operation.
    AccessDenied => "AccessDenied",
    /// Authentication did not work.
    AuthFailed => "AuthFailed",
    /// A timeout occurred.
    Timeout => "Timeout",
    /// The connection is disconnected.
    Disconnected => "Disconnected",
    /// Invalid arguments were passed to a method call.
    InvalidArgs => "InvalidArgs",
    /// The invoked method is not known on this object.
    UnknownMethod => "UnknownMethod",
    /// No object is exported at the requested path.
    UnknownObject => "UnknownObject",
    /// The object does not implement the requested interface.
    UnknownInterface => "UnknownInterface",
    /// The object has no such property.
    UnknownProperty => "UnknownProperty",
    /// The property cannot be written.
    PropertyReadOnly => "PropertyReadOnly",
    /// The match rule is not syntactically valid.
    MatchRuleInvalid => "MatchRuleInvalid",
    /// No match rule of that form is registered.
    MatchRuleNotFound => "MatchRuleNotFound",
    /// The caller's Unix process id could not be determined.
    UnixProcessIdUnknown => "UnixProcessIdUnknown",
    /// A type signature is not valid.
    InvalidSignature => "InvalidSignature",
    /// The message metadata does not match its payload.
    InconsistentMessage => "InconsistentMessage",
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

impl error::Error for Error {}

impl From<crate::Error> for Error {
    fn from(e: crate::Error) -> Self {
        match e {
            crate::Error::MethodError(name, message) => {
                Error::from_name(name.as_str(), message.unwrap_or_default())
            }
            crate::Error::Fdo(e) => *e,
            crate::Error::Timeout => Error::NoReply("call timed out".to_string()),
            crate::Error::Disconnected => Error::Disconnected("connection closed".to_string()),
            other => Error::Failed(other.to_string()),
        }
    }
}

impl From<nvariant::Error> for Error {
    fn from(e: nvariant::Error) -> Self {
        Error::InvalidArgs(e.to_string())
    }
}

/// Alias for a `Result` with the error type [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Flags for [`DBusProxy::request_name`].
#[bitflags]
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestNameFlags {
    /// Allow another peer to take the name over.
    AllowReplacement = 0x1,
    /// Take the name over if it is already owned.
    ReplaceExisting = 0x2,
    /// Fail instead of queueing if the name is taken.
    DoNotQueue = 0x4,
}

/// Reply of [`DBusProxy::request_name`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

/// Reply of [`DBusProxy::release_name`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
}

/// Typed access to the message bus peer, `org.freedesktop.DBus`.
#[derive(Debug, Clone)]
pub struct DBusProxy {
    conn: Connection,
}

impl DBusProxy {
    pub fn new(conn: &Connection) -> Self {
        DBusProxy { conn: conn.clone() }
    }

    async fn call(&self, member: &str, body: Vec<Value>) -> BusResult<Vec<Value>> {
        let reply = self
            .conn
            .call_method(Some(BUS_NAME), BUS_PATH, Some(BUS_INTERFACE), member, body)
            .await?;
        Ok(reply.body().to_vec())
    }

    fn single<T>(mut body: Vec<Value>) -> BusResult<T>
    where
        T: TryFrom<Value, Error = nvariant::Error>,
    {
        if body.len() != 1 {
            return Err(crate::Error::Failure(
                "unexpected reply signature from bus".to_string(),
            ));
        }
        T::try_from(body.remove(0)).map_err(Into::into)
    }

    /// Register with the bus. The reply is this connection's unique name.
    ///
    /// The connection does this itself right after the handshake; calling it
    /// twice is a protocol violation.
    pub async fn hello(&self) -> BusResult<UniqueName> {
        let name: String = Self::single(self.call("Hello", vec![]).await?)?;
        UniqueName::try_from(name)
    }

    /// Ask the bus for ownership of a well-known name.
    pub async fn request_name(
        &self,
        name: &WellKnownName,
        flags: BitFlags<RequestNameFlags>,
    ) -> BusResult<RequestNameReply> {
        let body = vec![
            Value::from(name.as_str()),
            Value::from(flags.bits()),
        ];
        let reply: u32 = Self::single(self.call("RequestName", body).await?)?;
        match reply {
            1 => Ok(RequestNameReply::PrimaryOwner),
            2 => Ok(RequestNameReply::InQueue),
            3 => Ok(RequestNameReply::Exists),
            4 => Ok(RequestNameReply::AlreadyOwner),
            other => Err(crate::Error::Failure(format!(
                "unexpected RequestName reply: {other}"
            ))),
        }
    }

    /// Give a well-known name back to the bus.
    pub async fn release_name(&self, name: &WellKnownName) -> BusResult<ReleaseNameReply> {
        let body = vec![Value::from(name.as_str())];
        let reply: u32 = Self::single(self.call("ReleaseName", body).await?)?;
        match reply {
            1 => Ok(ReleaseNameReply::Released),
            2 => Ok(ReleaseNameReply::NonExistent),
            3 => Ok(ReleaseNameReply::NotOwner),
            other => Err(crate::Error::Failure(format!(
                "unexpected ReleaseName reply: {other}"
            ))),
        }
    }

    /// Subscribe this connection to messages matching `rule`.
    pub async fn add_match(&self, rule: &str) -> BusResult<()> {
        self.call("AddMatch", vec![Value::from(rule)]).await?;
        Ok(())
    }

    /// Remove a previously added match rule.
    pub async fn remove_match(&self, rule: &str) -> BusResult<()> {
        self.call("RemoveMatch", vec![Value::from(rule)]).await?;
        Ok(())
    }

    /// The Unix user id of the connection owning `name`.
    pub async fn get_connection_unix_user(&self, name: &BusName) -> BusResult<u32> {
        Self::single(
            self.call("GetConnectionUnixUser", vec![Value::from(name.as_str())])
                .await?,
        )
    }

    /// Whether `name` currently has an owner.
    pub async fn name_has_owner(&self, name: &BusName) -> BusResult<bool> {
        Self::single(self.call("NameHasOwner", vec![Value::from(name.as_str())]).await?)
    }

    /// The unique name owning `name`.
    pub async fn get_name_owner(&self, name: &BusName) -> BusResult<UniqueName> {
        let owner: String =
            Self::single(self.call("GetNameOwner", vec![Value::from(name.as_str())]).await?)?;
        UniqueName::try_from(owner)
    }

    /// All names currently on the bus.
    pub async fn list_names(&self) -> BusResult<Vec<String>> {
        let body = self.call("ListNames", vec![]).await?;
        let array: nvariant::Array = Self::single(body)?;
        array
            .into_items()
            .into_iter()
            .map(|v| String::try_from(v).map_err(Into::into))
            .collect()
    }
}

/// Credentials of the process on the other end of a socket.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionCredentials {
    pub unix_user_id: Option<u32>,
    pub process_id: Option<u32>,
}
