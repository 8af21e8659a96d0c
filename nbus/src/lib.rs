//! A native D-Bus client and server library for tokio.
//!
//! nbus speaks the [D-Bus wire protocol] directly over a Unix or TCP stream:
//! it drives the SASL handshake, frames and routes binary messages, exports
//! local objects with the standard `Peer`, `Introspectable` and `Properties`
//! interfaces, and offers introspection-driven proxies for remote objects.
//!
//! The library is Unix-focused; TCP transports work anywhere but file
//! descriptor passing and `EXTERNAL` authentication rely on Unix sockets.
//!
//! Quick tour:
//!
//! * [`Connection`] — a connection to a bus (or a direct peer), built via
//!   [`connection::Builder`]. Method calls correlate replies by serial;
//!   signals dispatch through [`MatchRule`] registrations.
//! * [`ObjectServer`] — the registry of exported [`Object`]s, each a list of
//!   declarative [`interface::Interface`] descriptions.
//! * [`Proxy`] — typed calls and signal subscriptions against one remote
//!   object.
//! * [`nvariant`] — signatures, values and the wire codec, re-exported here.
//!
//! [D-Bus wire protocol]: https://dbus.freedesktop.org/doc/dbus-specification.html

pub mod address;
pub mod connection;
mod error;
pub mod fdo;
pub mod handshake;
pub mod interface;
pub mod match_rule;
pub mod message;
pub mod names;
pub mod object_server;
pub mod proxy;
pub mod xml;

pub use connection::{
    Builder as ConnectionBuilder, CallOptions, Connection, SignalHandler, SignalSubscription,
    DEFAULT_MAX_QUEUED_BYTES,
};
pub use error::{Error, Result};
pub use match_rule::MatchRule;
pub use message::Message;
pub use object_server::{Object, ObjectServer};
pub use proxy::{Proxy, Reply};

pub(crate) use connection::WeakConnection;

pub use nvariant;

use static_assertions::assert_impl_all;

assert_impl_all!(Connection: Send, Sync, Unpin);
assert_impl_all!(Message: Send, Sync, Unpin);
assert_impl_all!(Proxy: Send, Sync, Unpin);
assert_impl_all!(Error: Send, Sync, Unpin);
