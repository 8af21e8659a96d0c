//! The SASL authentication handshake that precedes binary D-Bus framing.
//!
//! The handshake is a `\r\n`-terminated ASCII command dialog. The client
//! walks its mechanism list (`EXTERNAL`, `DBUS_COOKIE_SHA1`, `ANONYMOUS`)
//! until the server answers `OK`, optionally negotiates Unix fd passing, and
//! finishes with `BEGIN`; everything after that is binary frames. A minimal
//! server side supports peer-to-peer connections.

use std::{collections::VecDeque, fmt, str::FromStr};

use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::{
    connection::socket::{write_all, BoxedSplit},
    Error, Result,
};

/// Defensive cap on one handshake line.
const MAX_LINE_LEN: usize = 16 * 1024;

/// A SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// Credentials passed out of band over the transport.
    External,
    /// SHA-1 challenge/response against the `~/.dbus-keyrings` keyring.
    Cookie,
    /// No authentication.
    Anonymous,
}

impl Mechanism {
    /// The order mechanisms are attempted in by default.
    pub fn default_order() -> VecDeque<Mechanism> {
        [Mechanism::External, Mechanism::Cookie, Mechanism::Anonymous]
            .into_iter()
            .collect()
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mechanism::External => f.write_str("EXTERNAL"),
            Mechanism::Cookie => f.write_str("DBUS_COOKIE_SHA1"),
            Mechanism::Anonymous => f.write_str("ANONYMOUS"),
        }
    }
}

impl FromStr for Mechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL" => Ok(Mechanism::External),
            "DBUS_COOKIE_SHA1" => Ok(Mechanism::Cookie),
            "ANONYMOUS" => Ok(Mechanism::Anonymous),
            _ => Err(Error::Handshake(format!("unknown mechanism `{s}`"))),
        }
    }
}

/// The GUID a server identifies itself with: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guid(String);

impl Guid {
    /// Generate a random GUID for a server.
    pub fn generate() -> Self {
        Guid(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Guid {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        if value.len() != 32 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Handshake(format!("invalid GUID `{value}`")));
        }
        Ok(Guid(value.to_ascii_lowercase()))
    }
}

/// One line of the handshake dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Auth(Option<Mechanism>, Option<Vec<u8>>),
    Cancel,
    Begin,
    Data(Option<Vec<u8>>),
    Error(String),
    NegotiateUnixFD,
    Rejected(Vec<Mechanism>),
    Ok(Guid),
    AgreeUnixFD,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Auth(mech, data) => {
                f.write_str("AUTH")?;
                if let Some(mech) = mech {
                    write!(f, " {mech}")?;
                }
                if let Some(data) = data {
                    write!(f, " {}", hex::encode(data))?;
                }
                Ok(())
            }
            Command::Cancel => f.write_str("CANCEL"),
            Command::Begin => f.write_str("BEGIN"),
            Command::Data(data) => match data {
                Some(data) => write!(f, "DATA {}", hex::encode(data)),
                None => f.write_str("DATA"),
            },
            Command::Error(msg) => write!(f, "ERROR {msg}"),
            Command::NegotiateUnixFD => f.write_str("NEGOTIATE_UNIX_FD"),
            Command::Rejected(mechs) => {
                f.write_str("REJECTED")?;
                for mech in mechs {
                    write!(f, " {mech}")?;
                }
                Ok(())
            }
            Command::Ok(guid) => write!(f, "OK {guid}"),
            Command::AgreeUnixFD => f.write_str("AGREE_UNIX_FD"),
        }
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_ascii_whitespace();
        let command = words
            .next()
            .ok_or_else(|| Error::Handshake("empty command line".to_string()))?;
        let cmd = match command {
            "AUTH" => {
                let mech = words.next().map(Mechanism::from_str).transpose()?;
                let data = words.next().map(decode_hex).transpose()?;
                Command::Auth(mech, data)
            }
            "CANCEL" => Command::Cancel,
            "BEGIN" => Command::Begin,
            "DATA" => Command::Data(words.next().map(decode_hex).transpose()?),
            "ERROR" => {
                let rest = line.strip_prefix("ERROR").unwrap_or("").trim();
                Command::Error(rest.to_string())
            }
            "NEGOTIATE_UNIX_FD" => Command::NegotiateUnixFD,
            "REJECTED" => {
                // Unknown mechanisms offered by the server are not an error;
                // we just cannot use them.
                let mechs = words.filter_map(|w| Mechanism::from_str(w).ok()).collect();
                Command::Rejected(mechs)
            }
            "OK" => {
                let guid = words
                    .next()
                    .ok_or_else(|| Error::Handshake("OK without GUID".to_string()))?;
                Command::Ok(Guid::try_from(guid)?)
            }
            "AGREE_UNIX_FD" => Command::AgreeUnixFD,
            other => return Err(Error::Handshake(format!("unknown command `{other}`"))),
        };
        Ok(cmd)
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|_| Error::Handshake(format!("invalid hex payload `{s}`")))
}

/// The output of a successful handshake.
#[derive(Debug)]
pub struct Authenticated {
    pub(crate) socket: BoxedSplit,
    pub(crate) server_guid: Guid,
    pub(crate) cap_unix_fd: bool,
    /// Bytes past `BEGIN` that were read together with handshake lines; they
    /// belong to the binary stream.
    pub(crate) already_received: Vec<u8>,
}

/// IO shared between the client and server sides: line-based commands over
/// the socket halves, with read-ahead buffering.
#[derive(Debug)]
struct HandshakeCommon {
    socket: BoxedSplit,
    recv_buf: Vec<u8>,
}

impl HandshakeCommon {
    fn new(socket: BoxedSplit) -> Self {
        HandshakeCommon {
            socket,
            recv_buf: Vec::new(),
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; 1024];
        let (n, fds) = self.socket.read.recvmsg(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Handshake("connection closed".to_string()));
        }
        // Credential bytes may arrive with ancillary data; no fds are valid
        // during the handshake and dropping them closes them.
        drop(fds);
        self.recv_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn read_command(&mut self) -> Result<Command> {
        loop {
            if let Some(pos) = self
                .recv_buf
                .windows(2)
                .position(|window| window == b"\r\n")
            {
                let rest = self.recv_buf.split_off(pos + 2);
                let mut line = std::mem::replace(&mut self.recv_buf, rest);
                line.truncate(pos);
                let line = String::from_utf8(line)
                    .map_err(|_| Error::Handshake("command line is not ASCII".to_string()))?;
                trace!("S: {line}");
                return line.parse();
            }
            if self.recv_buf.len() > MAX_LINE_LEN {
                return Err(Error::Handshake("command line too long".to_string()));
            }
            self.fill().await?;
        }
    }

    async fn write_command(&mut self, command: Command) -> Result<()> {
        let line = command.to_string();
        trace!("C: {line}");
        let mut bytes = line.into_bytes();
        bytes.extend_from_slice(b"\r\n");
        write_all(&mut self.socket.write, &bytes).await?;
        Ok(())
    }

    /// Consume the single NUL credential byte a client leads with.
    async fn read_nul_byte(&mut self) -> Result<()> {
        while self.recv_buf.is_empty() {
            self.fill().await?;
        }
        if self.recv_buf.remove(0) != 0 {
            return Err(Error::Handshake(
                "expected NUL credential byte".to_string(),
            ));
        }
        Ok(())
    }
}

/// The client side of the handshake.
#[derive(Debug)]
pub struct ClientHandshake {
    common: HandshakeCommon,
    mechanisms: VecDeque<Mechanism>,
}

impl ClientHandshake {
    /// Prepare a handshake on a freshly-connected socket. The NUL credential
    /// byte must already have been sent.
    pub fn new(socket: BoxedSplit, mechanisms: Option<VecDeque<Mechanism>>) -> Self {
        ClientHandshake {
            common: HandshakeCommon::new(socket),
            mechanisms: mechanisms.unwrap_or_else(Mechanism::default_order),
        }
    }

    /// Drive the handshake to completion.
    pub async fn perform(mut self) -> Result<Authenticated> {
        let guid = 'mechanisms: loop {
            let mech = self.mechanisms.pop_front().ok_or_else(|| {
                Error::Handshake("exhausted all authentication mechanisms".to_string())
            })?;
            debug!("attempting authentication via {mech}");
            let initial = match mech {
                Mechanism::External => Some(sasl_auth_id()?.into_bytes()),
                Mechanism::Cookie => Some(sasl_user_name()?.into_bytes()),
                Mechanism::Anonymous => None,
            };
            self.common.write_command(Command::Auth(Some(mech), initial)).await?;

            loop {
                match self.common.read_command().await? {
                    Command::Ok(guid) => break 'mechanisms guid,
                    Command::Rejected(_) => {
                        debug!("{mech} rejected by the server");
                        continue 'mechanisms;
                    }
                    Command::Data(Some(data)) if mech == Mechanism::Cookie => {
                        let response = cookie_response(&data).await?;
                        self.common
                            .write_command(Command::Data(Some(response)))
                            .await?;
                    }
                    Command::Data(_) => {
                        self.common.write_command(Command::Cancel).await?;
                    }
                    Command::Error(e) => {
                        debug!("server error during {mech}: {e}");
                        self.common.write_command(Command::Cancel).await?;
                    }
                    other => {
                        return Err(Error::Handshake(format!(
                            "unexpected command during authentication: {other}"
                        )));
                    }
                }
            }
        };

        let mut cap_unix_fd = false;
        if self.common.socket.write.can_pass_unix_fd() {
            self.common.write_command(Command::NegotiateUnixFD).await?;
            match self.common.read_command().await? {
                Command::AgreeUnixFD => cap_unix_fd = true,
                Command::Error(_) => cap_unix_fd = false,
                other => {
                    return Err(Error::Handshake(format!(
                        "unexpected reply to fd negotiation: {other}"
                    )));
                }
            }
        }

        self.common.write_command(Command::Begin).await?;
        debug!("authenticated; server GUID {guid}");

        Ok(Authenticated {
            already_received: std::mem::take(&mut self.common.recv_buf),
            socket: self.common.socket,
            server_guid: guid,
            cap_unix_fd,
        })
    }
}

/// A minimal server side: accepts `EXTERNAL` (matching the peer's uid where
/// the transport exposes it) and `ANONYMOUS`. Enough for peer-to-peer
/// connections.
#[derive(Debug)]
pub struct ServerHandshake {
    common: HandshakeCommon,
    guid: Guid,
}

impl ServerHandshake {
    pub fn new(socket: BoxedSplit, guid: Guid) -> Self {
        ServerHandshake {
            common: HandshakeCommon::new(socket),
            guid,
        }
    }

    pub async fn perform(mut self) -> Result<Authenticated> {
        self.common.read_nul_byte().await?;
        let peer_uid = self
            .common
            .socket
            .read
            .peer_credentials()
            .await
            .ok()
            .and_then(|c| c.unix_user_id);

        loop {
            match self.common.read_command().await? {
                Command::Auth(Some(Mechanism::External), Some(data)) => {
                    let claimed = String::from_utf8(data)
                        .ok()
                        .and_then(|s| s.parse::<u32>().ok());
                    match (claimed, peer_uid) {
                        (Some(claimed), Some(actual)) if claimed != actual => {
                            self.common
                                .write_command(Command::Rejected(vec![Mechanism::Anonymous]))
                                .await?;
                        }
                        (Some(_), _) => break,
                        (None, _) => {
                            self.common
                                .write_command(Command::Error("bad uid".to_string()))
                                .await?;
                        }
                    }
                }
                Command::Auth(Some(Mechanism::Anonymous), _) => break,
                Command::Auth(..) | Command::Cancel | Command::Error(_) => {
                    self.common
                        .write_command(Command::Rejected(vec![
                            Mechanism::External,
                            Mechanism::Anonymous,
                        ]))
                        .await?;
                }
                Command::Begin => {
                    return Err(Error::Handshake(
                        "BEGIN before authentication completed".to_string(),
                    ));
                }
                other => {
                    self.common
                        .write_command(Command::Error(format!("unexpected command {other}")))
                        .await?;
                }
            }
        }
        self.common.write_command(Command::Ok(self.guid.clone())).await?;

        let mut cap_unix_fd = false;
        loop {
            match self.common.read_command().await? {
                Command::NegotiateUnixFD => {
                    if self.common.socket.write.can_pass_unix_fd() {
                        cap_unix_fd = true;
                        self.common.write_command(Command::AgreeUnixFD).await?;
                    } else {
                        self.common
                            .write_command(Command::Error(
                                "fd passing not supported".to_string(),
                            ))
                            .await?;
                    }
                }
                Command::Begin => break,
                other => {
                    return Err(Error::Handshake(format!(
                        "unexpected command after OK: {other}"
                    )));
                }
            }
        }

        Ok(Authenticated {
            already_received: std::mem::take(&mut self.common.recv_buf),
            socket: self.common.socket,
            server_guid: self.guid,
            cap_unix_fd,
        })
    }
}

/// The `EXTERNAL` authorization identity: the effective uid in decimal.
fn sasl_auth_id() -> Result<String> {
    Ok(nix::unistd::Uid::effective().as_raw().to_string())
}

/// The user name `DBUS_COOKIE_SHA1` presents to select a keyring.
fn sasl_user_name() -> Result<String> {
    let uid = nix::unistd::Uid::effective();
    let user = nix::unistd::User::from_uid(uid)
        .map_err(|e| Error::Handshake(format!("cannot resolve user: {e}")))?
        .ok_or_else(|| Error::Handshake(format!("no user record for uid {uid}")))?;
    Ok(user.name)
}

/// Answer a `DBUS_COOKIE_SHA1` challenge: `context id server-challenge` in,
/// `client-challenge digest` out.
async fn cookie_response(challenge: &[u8]) -> Result<Vec<u8>> {
    let challenge = std::str::from_utf8(challenge)
        .map_err(|_| Error::Handshake("cookie challenge is not ASCII".to_string()))?;
    let mut words = challenge.split_ascii_whitespace();
    let (context, id, server_challenge) = match (words.next(), words.next(), words.next()) {
        (Some(c), Some(i), Some(s)) => (c, i, s),
        _ => {
            return Err(Error::Handshake(format!(
                "malformed cookie challenge `{challenge}`"
            )));
        }
    };

    let cookie = lookup_cookie(context, id).await?;
    let client_challenge = hex::encode(rand::random::<[u8; 16]>());
    let digest = cookie_sha1(server_challenge, &client_challenge, &cookie);
    Ok(format!("{client_challenge} {digest}").into_bytes())
}

fn cookie_sha1(server_challenge: &str, client_challenge: &str, cookie: &str) -> String {
    let composite = format!("{server_challenge}:{client_challenge}:{cookie}");
    let mut hasher = Sha1::new();
    hasher.update(composite.as_bytes());
    hex::encode(hasher.finalize())
}

/// Find the cookie `id` in the `~/.dbus-keyrings/<context>` keyring file.
async fn lookup_cookie(context: &str, id: &str) -> Result<String> {
    if context.is_empty() || context.contains(['/', '\\']) || context.contains('.') {
        return Err(Error::Handshake(format!(
            "invalid cookie context `{context}`"
        )));
    }
    let home = xdg_home::home_dir()
        .ok_or_else(|| Error::Handshake("cannot determine home directory".to_string()))?;
    let keyring = home.join(".dbus-keyrings").join(context);
    let contents = tokio::fs::read_to_string(&keyring).await.map_err(|e| {
        Error::Handshake(format!("cannot read keyring {}: {e}", keyring.display()))
    })?;

    for line in contents.lines() {
        let mut words = line.split_ascii_whitespace();
        if let (Some(cookie_id), Some(_created), Some(cookie)) =
            (words.next(), words.next(), words.next())
        {
            if cookie_id == id {
                return Ok(cookie.to_string());
            }
        }
    }
    Err(Error::Handshake(format!(
        "cookie {id} not found in context {context}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips() {
        for line in [
            "AUTH EXTERNAL 31303030",
            "AUTH DBUS_COOKIE_SHA1 757365726e616d65",
            "AUTH ANONYMOUS",
            "AUTH",
            "CANCEL",
            "BEGIN",
            "DATA 00ff",
            "DATA",
            "NEGOTIATE_UNIX_FD",
            "AGREE_UNIX_FD",
            "REJECTED EXTERNAL ANONYMOUS",
            "OK 0123456789abcdef0123456789abcdef",
            "ERROR something went wrong",
        ] {
            let command: Command = line.parse().unwrap();
            assert_eq!(command.to_string(), line, "round trip of {line:?}");
        }
    }

    #[test]
    fn auth_external_payload() {
        let command: Command = "AUTH EXTERNAL 31303030".parse().unwrap();
        assert_eq!(
            command,
            Command::Auth(Some(Mechanism::External), Some(b"1000".to_vec()))
        );
    }

    #[test]
    fn rejected_skips_unknown_mechanisms() {
        let command: Command = "REJECTED KERBEROS_V4 EXTERNAL".parse().unwrap();
        assert_eq!(command, Command::Rejected(vec![Mechanism::External]));
    }

    #[test]
    fn bad_commands() {
        assert!("".parse::<Command>().is_err());
        assert!("HELLO".parse::<Command>().is_err());
        assert!("OK".parse::<Command>().is_err());
        assert!("OK nothex".parse::<Command>().is_err());
        assert!("DATA xyz".parse::<Command>().is_err());
    }

    #[test]
    fn guid_validation() {
        assert!(Guid::try_from("0123456789abcdef0123456789abcdef").is_ok());
        assert!(Guid::try_from("short").is_err());
        assert!(Guid::try_from("zz23456789abcdef0123456789abcdef").is_err());
        let generated = Guid::generate();
        assert!(Guid::try_from(generated.as_str()).is_ok());
    }

    #[test]
    fn cookie_digest() {
        // Composite string: server-challenge:client-challenge:cookie.
        let digest = cookie_sha1(
            "8c216f52556dbf92",
            "5a3d4e7f10203040",
            "736563726574636f6f6b6965",
        );
        assert_eq!(digest, "fddf99e9e29bd38ae6c95575f20d3d6df22131f8");
    }
}
