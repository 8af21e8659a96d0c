//! The connection engine: framed message I/O, serial allocation, reply
//! correlation, match-rule dispatch and the method-call demultiplexer.

mod builder;
pub mod socket;

pub use builder::Builder;

use std::{
    collections::HashMap,
    fmt,
    os::fd::AsFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock, Weak,
    },
    time::Duration,
};

use enumflags2::BitFlags;
use nvariant::{padding_for, ObjectPath, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    fdo::{self, RequestNameFlags, RequestNameReply},
    handshake::{Authenticated, Guid},
    match_rule::MatchRule,
    message::{
        Builder as MessageBuilder, Flags, Message, PrimaryHeader, Type, MAX_MESSAGE_SIZE,
        MIN_MESSAGE_SIZE,
    },
    names::{BusName, InterfaceName, MemberName, UniqueName, WellKnownName},
    object_server::ObjectServer,
    Error, Result,
};

use socket::{ReadHalf, WriteHalf};

/// The default cap on bytes queued for writing, 128 MiB.
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 128 * 1024 * 1024;

type ReplySender = oneshot::Sender<Result<Arc<Message>>>;

/// A handler invoked for every incoming message matching a rule.
///
/// Errors are logged and swallowed; other handlers still run.
pub type SignalHandler = Box<dyn FnMut(&Message) -> Result<()> + Send>;

/// Options for a method call.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Whether a reply is expected. When `false` the `NO_REPLY_EXPECTED`
    /// flag is set, nothing is registered in the reply table and the call
    /// resolves immediately.
    pub expect_reply: bool,
    /// When `false`, sets `NO_AUTO_START` so the bus will not launch an
    /// owner for the destination.
    pub auto_start: bool,
    /// Sets `ALLOW_INTERACTIVE_AUTHORIZATION`.
    pub allow_interactive_auth: bool,
    /// Fail the call with [`Error::Timeout`] if no reply arrives in time. A
    /// reply arriving after the deadline is dropped.
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        CallOptions {
            expect_reply: true,
            auto_start: true,
            allow_interactive_auth: false,
            timeout: None,
        }
    }
}

struct OutMsg {
    serial: u32,
    bytes: Vec<u8>,
    fds: Vec<std::os::fd::OwnedFd>,
}

struct SendState {
    next_serial: u32,
    tx: Option<mpsc::UnboundedSender<OutMsg>>,
}

impl SendState {
    /// Monotonic serials from 1, skipping 0 on wrap.
    fn alloc_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = match serial.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        serial
    }
}

struct MatchEntry {
    id: u64,
    rule: MatchRule,
    handler: Arc<Mutex<SignalHandler>>,
}

struct MatchRegistry {
    next_id: u64,
    entries: Vec<MatchEntry>,
    /// Identical rules are refcounted so `RemoveMatch` only goes to the
    /// broker on the last release.
    rule_refs: HashMap<String, usize>,
}

pub(crate) struct ConnectionInner {
    server_guid: Guid,
    cap_unix_fd: bool,
    bus_connection: bool,
    unique_name: OnceLock<UniqueName>,
    send: Mutex<SendState>,
    queued_bytes: AtomicUsize,
    max_queued_bytes: usize,
    replies: Mutex<HashMap<u32, ReplySender>>,
    matches: Mutex<MatchRegistry>,
    object_server: ObjectServer,
    closed: Mutex<Option<Error>>,
}

/// A weak handle, for back-references that must not keep the connection
/// alive.
pub(crate) struct WeakConnection {
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakConnection")
    }
}

/// A D-Bus connection.
///
/// Cloning is cheap and all clones share the same underlying connection.
/// Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("server_guid", &self.inner.server_guid.as_str())
            .field("unique_name", &self.inner.unique_name.get())
            .field("bus", &self.inner.bus_connection)
            .finish()
    }
}

impl Connection {
    /// Connect to the session bus.
    pub async fn session() -> Result<Self> {
        Builder::session()?.build().await
    }

    /// Connect to the system bus.
    pub async fn system() -> Result<Self> {
        Builder::system()?.build().await
    }

    pub(crate) fn new(auth: Authenticated, bus_connection: bool, max_queued_bytes: usize) -> Self {
        let Authenticated {
            socket,
            server_guid,
            cap_unix_fd,
            already_received,
        } = auth;

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            server_guid,
            cap_unix_fd,
            bus_connection,
            unique_name: OnceLock::new(),
            send: Mutex::new(SendState {
                next_serial: 1,
                tx: Some(tx),
            }),
            queued_bytes: AtomicUsize::new(0),
            max_queued_bytes,
            replies: Mutex::new(HashMap::new()),
            matches: Mutex::new(MatchRegistry {
                next_id: 0,
                entries: Vec::new(),
                rule_refs: HashMap::new(),
            }),
            object_server: ObjectServer::new(),
            closed: Mutex::new(None),
        });
        inner.object_server.set_connection(WeakConnection {
            inner: Arc::downgrade(&inner),
        });

        tokio::spawn(write_task(socket.write, rx, Arc::downgrade(&inner)));
        tokio::spawn(read_task(
            socket.read,
            already_received,
            Arc::downgrade(&inner),
        ));

        Connection { inner }
    }

    /// The GUID the server identified itself with during the handshake.
    pub fn server_guid(&self) -> &str {
        self.inner.server_guid.as_str()
    }

    /// Whether the peer agreed to Unix fd passing.
    pub fn supports_unix_fd(&self) -> bool {
        self.inner.cap_unix_fd
    }

    /// Whether this is a connection to a message bus (as opposed to a direct
    /// peer).
    pub fn is_bus(&self) -> bool {
        self.inner.bus_connection
    }

    /// The unique name the bus assigned to this connection.
    pub fn unique_name(&self) -> Option<&UniqueName> {
        self.inner.unique_name.get()
    }

    pub(crate) fn set_unique_name(&self, name: UniqueName) -> Result<()> {
        self.inner
            .unique_name
            .set(name)
            .map_err(|_| Error::Failure("unique name already set".to_string()))
    }

    /// The registry of locally exported objects.
    pub fn object_server(&self) -> &ObjectServer {
        &self.inner.object_server
    }

    /// Whether the connection has been closed (by request or by failure).
    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().expect("lock poisoned").is_some()
    }

    /// Close the connection. All outstanding reply futures fail with
    /// [`Error::Disconnected`].
    pub fn close(&self) {
        self.close_with(Error::Disconnected);
    }

    fn close_with(&self, cause: Error) {
        {
            let mut closed = self.inner.closed.lock().expect("lock poisoned");
            if closed.is_some() {
                return;
            }
            *closed = Some(cause.clone());
        }
        debug!("connection closed: {cause}");
        // Dropping the sender lets the writer drain and shut the socket
        // down, which in turn unblocks the reader.
        self.inner.send.lock().expect("lock poisoned").tx = None;
        let pending: Vec<ReplySender> = {
            let mut replies = self.inner.replies.lock().expect("lock poisoned");
            replies.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(cause.clone()));
        }
    }

    /// Queue a message for sending, assigning its serial. Returns the serial.
    ///
    /// The wire sees messages in exactly the order their serials were
    /// assigned.
    pub fn send(&self, msg: Message) -> Result<u32> {
        self.send_with_reply(msg, None)
    }

    fn send_with_reply(&self, mut msg: Message, reply: Option<ReplySender>) -> Result<u32> {
        if let Some(cause) = self.inner.closed.lock().expect("lock poisoned").clone() {
            return Err(cause);
        }
        if !msg.fds().is_empty() && !self.inner.cap_unix_fd {
            return Err(Error::Unsupported);
        }

        let mut send = self.inner.send.lock().expect("lock poisoned");
        let tx = send.tx.clone().ok_or(Error::Disconnected)?;
        let serial = send.alloc_serial();
        msg.set_serial(serial);
        let bytes = msg.encode()?;

        let total = self
            .inner
            .queued_bytes
            .fetch_add(bytes.len(), Ordering::AcqRel)
            + bytes.len();
        if total > self.inner.max_queued_bytes {
            self.inner
                .queued_bytes
                .fetch_sub(bytes.len(), Ordering::AcqRel);
            drop(send);
            self.close_with(Error::QueueFull);
            return Err(Error::QueueFull);
        }

        if let Some(reply) = reply {
            self.inner
                .replies
                .lock()
                .expect("lock poisoned")
                .insert(serial, reply);
        }
        let fds = msg.take_fds();
        if tx
            .send(OutMsg {
                serial,
                bytes,
                fds,
            })
            .is_err()
        {
            self.inner
                .replies
                .lock()
                .expect("lock poisoned")
                .remove(&serial);
            return Err(Error::Disconnected);
        }
        trace!("queued message with serial {serial}");
        Ok(serial)
    }

    /// Call a method and wait for its reply.
    pub async fn call_method<D, P, I, M>(
        &self,
        destination: Option<D>,
        path: P,
        interface: Option<I>,
        member: M,
        body: Vec<Value>,
    ) -> Result<Arc<Message>>
    where
        D: TryInto<BusName>,
        P: TryInto<ObjectPath>,
        I: TryInto<InterfaceName>,
        M: TryInto<MemberName>,
        D::Error: Into<Error>,
        P::Error: Into<Error>,
        I::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        self.call_with(destination, path, interface, member, body, CallOptions::default())
            .await?
            .ok_or(Error::Disconnected)
    }

    /// Call a method with explicit [`CallOptions`]. Resolves to `None` when
    /// no reply was requested.
    pub async fn call_with<D, P, I, M>(
        &self,
        destination: Option<D>,
        path: P,
        interface: Option<I>,
        member: M,
        body: Vec<Value>,
        options: CallOptions,
    ) -> Result<Option<Arc<Message>>>
    where
        D: TryInto<BusName>,
        P: TryInto<ObjectPath>,
        I: TryInto<InterfaceName>,
        M: TryInto<MemberName>,
        D::Error: Into<Error>,
        P::Error: Into<Error>,
        I::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        let mut builder = MessageBuilder::method_call(path, member)?;
        if let Some(destination) = destination {
            builder = builder.destination(destination)?;
        }
        if let Some(interface) = interface {
            builder = builder.interface(interface)?;
        }
        if let Some(name) = self.unique_name() {
            builder = builder.sender(name.clone())?;
        }
        if !options.auto_start {
            builder = builder.with_flags(Flags::NoAutoStart)?;
        }
        if options.allow_interactive_auth {
            builder = builder.with_flags(Flags::AllowInteractiveAuth)?;
        }
        if !options.expect_reply {
            builder = builder.with_flags(Flags::NoReplyExpected)?;
        }
        let msg = builder.body(body)?.build()?;

        if !options.expect_reply {
            self.send(msg)?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let serial = self.send_with_reply(msg, Some(tx))?;

        let reply = match options.timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(received) => received.map_err(|_| Error::Disconnected)?,
                Err(_) => {
                    // Drop the table entry so a late reply is discarded.
                    self.inner
                        .replies
                        .lock()
                        .expect("lock poisoned")
                        .remove(&serial);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await.map_err(|_| Error::Disconnected)?,
        }?;

        if reply.message_type() == Type::Error {
            let name = reply
                .error_name()
                .cloned()
                .unwrap_or_else(|| crate::names::ErrorName::from_str_unchecked("org.freedesktop.DBus.Error.Failed"));
            let detail = match reply.body().first() {
                Some(Value::Str(s)) => Some(s.clone()),
                _ => None,
            };
            return Err(Error::MethodError(name, detail));
        }
        Ok(Some(reply))
    }

    /// Emit a signal.
    pub fn emit_signal<D, P, I, M>(
        &self,
        destination: Option<D>,
        path: P,
        interface: I,
        member: M,
        body: Vec<Value>,
    ) -> Result<()>
    where
        D: TryInto<BusName>,
        P: TryInto<ObjectPath>,
        I: TryInto<InterfaceName>,
        M: TryInto<MemberName>,
        D::Error: Into<Error>,
        P::Error: Into<Error>,
        I::Error: Into<Error>,
        M::Error: Into<Error>,
    {
        let mut builder = MessageBuilder::signal(path, interface, member)?;
        if let Some(destination) = destination {
            builder = builder.destination(destination)?;
        }
        if let Some(name) = self.unique_name() {
            builder = builder.sender(name.clone())?;
        }
        let msg = builder.body(body)?.build()?;
        self.send(msg)?;
        Ok(())
    }

    /// Register `handler` for messages matching `rule`.
    ///
    /// On a bus connection the rule is forwarded to the broker with
    /// `AddMatch` (once per distinct rule). Handlers run on the read task in
    /// registration order; all matching handlers see each message.
    pub async fn add_match(&self, rule: MatchRule, handler: SignalHandler) -> Result<SignalSubscription> {
        let rule_str = rule.to_string();
        let (id, newly_subscribed) = {
            let mut matches = self.inner.matches.lock().expect("lock poisoned");
            let id = matches.next_id;
            matches.next_id += 1;
            matches.entries.push(MatchEntry {
                id,
                rule,
                handler: Arc::new(Mutex::new(handler)),
            });
            let refs = matches.rule_refs.entry(rule_str.clone()).or_insert(0);
            *refs += 1;
            (id, *refs == 1)
        };

        if newly_subscribed && self.inner.bus_connection {
            if let Err(e) = fdo::DBusProxy::new(self).add_match(&rule_str).await {
                let mut matches = self.inner.matches.lock().expect("lock poisoned");
                matches.entries.retain(|entry| entry.id != id);
                if let Some(refs) = matches.rule_refs.get_mut(&rule_str) {
                    *refs -= 1;
                    if *refs == 0 {
                        matches.rule_refs.remove(&rule_str);
                    }
                }
                return Err(e);
            }
        }
        debug!("registered match rule `{rule_str}`");

        Ok(SignalSubscription {
            conn: WeakConnection {
                inner: Arc::downgrade(&self.inner),
            },
            id,
            rule: rule_str,
            released: false,
        })
    }

    /// Remove a registry entry; returns whether the broker should be told.
    fn remove_match_entry(&self, id: u64, rule: &str) -> bool {
        let mut matches = self.inner.matches.lock().expect("lock poisoned");
        let before = matches.entries.len();
        matches.entries.retain(|entry| entry.id != id);
        if matches.entries.len() == before {
            return false;
        }
        match matches.rule_refs.get_mut(rule) {
            Some(refs) => {
                *refs -= 1;
                if *refs == 0 {
                    matches.rule_refs.remove(rule);
                    self.inner.bus_connection
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Ask the bus for a well-known name.
    pub async fn request_name<N>(
        &self,
        name: N,
        flags: BitFlags<RequestNameFlags>,
    ) -> Result<RequestNameReply>
    where
        N: TryInto<WellKnownName>,
        N::Error: Into<Error>,
    {
        let name = name.try_into().map_err(Into::into)?;
        fdo::DBusProxy::new(self).request_name(&name, flags).await
    }

    /// Invoke every matching handler, in registration order.
    fn run_matches(&self, msg: &Message) {
        let matching: Vec<Arc<Mutex<SignalHandler>>> = {
            let matches = self.inner.matches.lock().expect("lock poisoned");
            matches
                .entries
                .iter()
                .filter(|entry| entry.rule.matches(msg))
                .map(|entry| entry.handler.clone())
                .collect()
        };
        for handler in matching {
            let mut handler = handler.lock().expect("lock poisoned");
            if let Err(e) = (*handler)(msg) {
                warn!("signal handler failed: {e}");
            }
        }
    }
}

/// A live match registration. Releasing it (or dropping the handle)
/// removes the handler; the broker-side rule goes away with the last
/// registration of the same rule string.
#[derive(Debug)]
pub struct SignalSubscription {
    conn: WeakConnection,
    id: u64,
    rule: String,
    released: bool,
}

impl SignalSubscription {
    /// The serialized rule this subscription holds.
    pub fn rule(&self) -> &str {
        &self.rule
    }

    /// Remove the handler, telling the broker when this was the last
    /// registration of the rule.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let Some(conn) = self.conn.upgrade() else {
            return Ok(());
        };
        if conn.remove_match_entry(self.id, &self.rule) {
            fdo::DBusProxy::new(&conn).remove_match(&self.rule).await?;
        }
        Ok(())
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        if conn.remove_match_entry(self.id, &self.rule) {
            let rule = std::mem::take(&mut self.rule);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = fdo::DBusProxy::new(&conn).remove_match(&rule).await {
                        warn!("RemoveMatch for dropped subscription failed: {e}");
                    }
                });
            }
        }
    }
}

/// Read exactly one message frame, buffering read-ahead in `pending`.
async fn receive_message(
    read: &mut Box<dyn ReadHalf>,
    pending: &mut Vec<u8>,
) -> Result<Message> {
    let mut bytes = std::mem::take(pending);
    let mut fds = Vec::new();

    while bytes.len() < MIN_MESSAGE_SIZE {
        fill(read, &mut bytes, &mut fds).await?;
    }

    let (primary, fields_len) = PrimaryHeader::read(&bytes)?;
    let header_len = MIN_MESSAGE_SIZE + fields_len as usize;
    let total = header_len + padding_for(header_len, 8) + primary.body_len() as usize;
    if total > MAX_MESSAGE_SIZE {
        return Err(Error::ExcessData);
    }

    while bytes.len() < total {
        fill(read, &mut bytes, &mut fds).await?;
    }

    *pending = bytes.split_off(total);
    Message::decode(&bytes, fds)
}

async fn fill(
    read: &mut Box<dyn ReadHalf>,
    bytes: &mut Vec<u8>,
    fds: &mut Vec<std::os::fd::OwnedFd>,
) -> Result<()> {
    let mut chunk = [0u8; 4096];
    let (n, received) = read.recvmsg(&mut chunk).await?;
    if n == 0 {
        return Err(Error::Disconnected);
    }
    bytes.extend_from_slice(&chunk[..n]);
    fds.extend(received);
    Ok(())
}

async fn read_task(
    mut read: Box<dyn ReadHalf>,
    mut pending: Vec<u8>,
    inner: Weak<ConnectionInner>,
) {
    loop {
        let result = receive_message(&mut read, &mut pending).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let conn = Connection { inner };
        match result {
            Ok(msg) => {
                let msg = Arc::new(msg);
                trace!("received {msg:?}");
                dispatch_message(&conn, msg);
            }
            Err(e) => {
                // Wire-level failures are unrecoverable for the framing.
                conn.close_with(e);
                return;
            }
        }
        if conn.is_closed() {
            return;
        }
    }
}

/// Route one inbound message: replies to the reply table, everything through
/// the match registry, method calls to the object server.
fn dispatch_message(conn: &Connection, msg: Arc<Message>) {
    match msg.message_type() {
        Type::MethodReturn | Type::Error => {
            if let Some(serial) = msg.reply_serial() {
                let reply_tx = conn
                    .inner
                    .replies
                    .lock()
                    .expect("lock poisoned")
                    .remove(&serial);
                match reply_tx {
                    Some(tx) => {
                        let _ = tx.send(Ok(msg.clone()));
                    }
                    None => {
                        trace!("dropping late or unsolicited reply to serial {serial}");
                    }
                }
            }
            conn.run_matches(&msg);
        }
        Type::Signal => conn.run_matches(&msg),
        Type::MethodCall => {
            conn.run_matches(&msg);
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.inner.object_server.dispatch(&conn, msg).await;
            });
        }
        Type::Invalid => {
            warn!("ignoring message of unknown type");
        }
    }
}

async fn write_task(
    mut write: Box<dyn WriteHalf>,
    mut rx: mpsc::UnboundedReceiver<OutMsg>,
    inner: Weak<ConnectionInner>,
) {
    while let Some(out) = rx.recv().await {
        let len = out.bytes.len();
        let fds: Vec<_> = out.fds.iter().map(AsFd::as_fd).collect();
        let result = socket::write_all_with_fds(&mut write, &out.bytes, &fds).await;
        drop(fds);

        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.queued_bytes.fetch_sub(len, Ordering::AcqRel);
        match result {
            Ok(()) => trace!("wrote message with serial {}", out.serial),
            Err(e) => {
                Connection { inner }.close_with(e.into());
                break;
            }
        }
    }
    let _ = write.close().await;
}

#[cfg(test)]
mod tests {
    use super::SendState;

    #[test]
    fn serial_allocation_skips_zero_on_wrap() {
        let mut state = SendState {
            next_serial: 1,
            tx: None,
        };
        assert_eq!(state.alloc_serial(), 1);
        assert_eq!(state.alloc_serial(), 2);

        state.next_serial = u32::MAX - 1;
        assert_eq!(state.alloc_serial(), u32::MAX - 1);
        assert_eq!(state.alloc_serial(), u32::MAX);
        // Wrap: 0 is never handed out.
        assert_eq!(state.alloc_serial(), 1);
        assert_eq!(state.alloc_serial(), 2);
    }
}
