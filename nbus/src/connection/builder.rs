use std::collections::VecDeque;

use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::{
    address::Address,
    connection::{
        socket::{self, BoxedSplit, Socket},
        Connection, DEFAULT_MAX_QUEUED_BYTES,
    },
    fdo,
    handshake::{ClientHandshake, Guid, Mechanism, ServerHandshake},
    Error, Result,
};

#[derive(Debug)]
enum Target {
    Addresses(Vec<Address>),
    UnixStream(UnixStream),
    TcpStream(TcpStream),
}

/// Builds a [`Connection`].
///
/// A connection built from a bus address registers with the bus by sending
/// `Hello` and holds the returned unique name; [`Builder::p2p`] skips that
/// for direct peer-to-peer links. [`Builder::server`] answers the handshake
/// instead of initiating it.
#[derive(Debug)]
pub struct Builder {
    target: Target,
    p2p: bool,
    server_guid: Option<Guid>,
    mechanisms: Option<VecDeque<Mechanism>>,
    max_queued_bytes: usize,
}

impl Builder {
    fn with_target(target: Target) -> Self {
        Builder {
            target,
            p2p: false,
            server_guid: None,
            mechanisms: None,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
        }
    }

    /// Connect to the session bus.
    pub fn session() -> Result<Self> {
        Ok(Self::with_target(Target::Addresses(Address::session()?)))
    }

    /// Connect to the system bus.
    pub fn system() -> Result<Self> {
        Ok(Self::with_target(Target::Addresses(Address::system()?)))
    }

    /// Connect to an explicit bus address (possibly a `;`-separated list,
    /// tried in order).
    pub fn address(address: &str) -> Result<Self> {
        Ok(Self::with_target(Target::Addresses(Address::parse(
            address,
        )?)))
    }

    /// Use an already-connected Unix stream.
    pub fn unix_stream(stream: UnixStream) -> Self {
        Self::with_target(Target::UnixStream(stream))
    }

    /// Use an already-connected TCP stream.
    pub fn tcp_stream(stream: TcpStream) -> Self {
        Self::with_target(Target::TcpStream(stream))
    }

    /// Answer the handshake on `stream` as a server, identifying with
    /// `guid`. Server connections are always peer-to-peer.
    pub fn server(stream: UnixStream, guid: Guid) -> Self {
        let mut builder = Self::with_target(Target::UnixStream(stream));
        builder.server_guid = Some(guid);
        builder.p2p = true;
        builder
    }

    /// Do not register with a bus: no `Hello`, no unique name.
    pub fn p2p(mut self) -> Self {
        self.p2p = true;
        self
    }

    /// Restrict or reorder the authentication mechanisms to attempt.
    pub fn auth_mechanisms(mut self, mechanisms: &[Mechanism]) -> Self {
        self.mechanisms = Some(mechanisms.iter().copied().collect());
        self
    }

    /// Cap the bytes queued for writing. Exceeding the cap closes the
    /// connection with [`Error::QueueFull`].
    pub fn max_queued_bytes(mut self, limit: usize) -> Self {
        self.max_queued_bytes = limit;
        self
    }

    /// Open the transport, run the SASL handshake and start the connection
    /// tasks. On a bus connection, also send `Hello` and store the unique
    /// name.
    pub async fn build(self) -> Result<Connection> {
        let mut split = match self.target {
            Target::Addresses(addresses) => connect_first(&addresses).await?,
            Target::UnixStream(stream) => stream.split().boxed(),
            Target::TcpStream(stream) => stream.split().boxed(),
        };

        let authenticated = match self.server_guid {
            Some(guid) => ServerHandshake::new(split, guid).perform().await?,
            None => {
                // The credential NUL byte opens every client connection.
                socket::write_all(&mut split.write, &[0]).await?;
                ClientHandshake::new(split, self.mechanisms).perform().await?
            }
        };

        let bus_connection = !self.p2p;
        let conn = Connection::new(authenticated, bus_connection, self.max_queued_bytes);

        if bus_connection {
            let name = fdo::DBusProxy::new(&conn).hello().await?;
            debug!("registered with the bus as {name}");
            conn.set_unique_name(name)?;
        }

        Ok(conn)
    }
}

async fn connect_first(addresses: &[Address]) -> Result<BoxedSplit> {
    let mut last_err = None;
    for address in addresses {
        match address.connect().await {
            Ok(split) => return Ok(split),
            Err(e) => {
                debug!("connecting to {address} failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Address("no addresses to try".to_string())))
}
