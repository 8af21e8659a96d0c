//! Bus address parsing and connecting.
//!
//! A D-Bus address is one or more `transport:key=value,...` records
//! separated by `;`, tried in order until one connects. See the
//! [address specification].
//!
//! [address specification]: https://dbus.freedesktop.org/doc/dbus-specification.html#addresses

use std::{collections::HashMap, fmt, path::PathBuf};

use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::{
    connection::socket::{BoxedSplit, Socket},
    Error, Result,
};

/// Characters that may appear unescaped in an address value.
fn is_optionally_escaped(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'\\' | b'*' | b'.')
}

fn unescape(value: &str) -> Result<Vec<u8>> {
    let err = || Error::Address(format!("invalid escape in `{value}`"));
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next().ok_or_else(err)?;
            let lo = bytes.next().ok_or_else(err)?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).map_err(|_| err())?;
            out.push(u8::from_str_radix(hex, 16).map_err(|_| err())?);
        } else if is_optionally_escaped(b) {
            out.push(b);
        } else {
            return Err(err());
        }
    }
    Ok(out)
}

fn escape(value: &[u8], out: &mut String) {
    for &b in value {
        if is_optionally_escaped(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
}

/// The path flavor of a `unix:` transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixPath {
    /// `path=`: a filesystem socket path.
    File(PathBuf),
    /// `abstract=`: a Linux abstract socket name.
    Abstract(Vec<u8>),
    /// `tmpdir=`: a server-side listen address; cannot be connected to.
    TmpDir(PathBuf),
}

/// Host and port of a `tcp:`/`nonce-tcp:` transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    pub host: String,
    pub port: u16,
    pub family: Option<TcpFamily>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFamily {
    Ipv4,
    Ipv6,
}

/// One parsed address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Unix(UnixPath),
    Tcp(TcpAddress),
    NonceTcp {
        addr: TcpAddress,
        noncefile: PathBuf,
    },
}

/// A single bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    transport: Transport,
}

impl Address {
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Parse a (possibly `;`-separated) address string into the list of
    /// addresses to try. Records with an unknown transport are skipped as
    /// long as a known one remains.
    pub fn parse(address: &str) -> Result<Vec<Address>> {
        let mut out = Vec::new();
        let mut skipped = None;
        for record in address.split(';') {
            if record.is_empty() {
                continue;
            }
            match Self::parse_record(record) {
                Ok(address) => out.push(address),
                Err(e @ Error::Address(_)) => {
                    debug!("skipping address record `{record}`: {e}");
                    skipped = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        match (out.is_empty(), skipped) {
            (true, Some(e)) => Err(e),
            (true, None) => Err(Error::Address("empty address".to_string())),
            (false, _) => Ok(out),
        }
    }

    fn parse_record(record: &str) -> Result<Address> {
        let (transport, options) = record
            .split_once(':')
            .ok_or_else(|| Error::Address(format!("missing `:` in `{record}`")))?;

        let mut opts = HashMap::new();
        for pair in options.split(',') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Address(format!("missing `=` in `{pair}`")))?;
            opts.insert(key, value);
        }

        let transport = match transport {
            "unix" => Transport::Unix(Self::unix_path(&opts)?),
            "tcp" => Transport::Tcp(Self::tcp_address(&opts)?),
            "nonce-tcp" => {
                let noncefile = opts
                    .get("noncefile")
                    .ok_or_else(|| Error::Address("nonce-tcp: missing noncefile".to_string()))?;
                let noncefile = String::from_utf8(unescape(noncefile)?)
                    .map_err(|_| Error::Address("noncefile is not UTF-8".to_string()))?;
                Transport::NonceTcp {
                    addr: Self::tcp_address(&opts)?,
                    noncefile: PathBuf::from(noncefile),
                }
            }
            other => {
                return Err(Error::Address(format!("unsupported transport `{other}`")));
            }
        };

        Ok(Address { transport })
    }

    /// The `unix:` keys, tried in order.
    fn unix_path(opts: &HashMap<&str, &str>) -> Result<UnixPath> {
        if let Some(path) = opts.get("path") {
            let path = String::from_utf8(unescape(path)?)
                .map_err(|_| Error::Address("unix path is not UTF-8".to_string()))?;
            return Ok(UnixPath::File(PathBuf::from(path)));
        }
        if let Some(name) = opts.get("abstract") {
            return Ok(UnixPath::Abstract(unescape(name)?));
        }
        if let Some(dir) = opts.get("tmpdir") {
            let dir = String::from_utf8(unescape(dir)?)
                .map_err(|_| Error::Address("unix tmpdir is not UTF-8".to_string()))?;
            return Ok(UnixPath::TmpDir(PathBuf::from(dir)));
        }
        Err(Error::Address(
            "unix: requires path, abstract or tmpdir".to_string(),
        ))
    }

    fn tcp_address(opts: &HashMap<&str, &str>) -> Result<TcpAddress> {
        let host = opts
            .get("host")
            .ok_or_else(|| Error::Address("tcp: missing host".to_string()))?;
        let host = String::from_utf8(unescape(host)?)
            .map_err(|_| Error::Address("tcp host is not UTF-8".to_string()))?;
        let port = opts
            .get("port")
            .ok_or_else(|| Error::Address("tcp: missing port".to_string()))?
            .parse::<u16>()
            .map_err(|_| Error::Address("tcp: invalid port".to_string()))?;
        let family = match opts.get("family") {
            Some(&"ipv4") => Some(TcpFamily::Ipv4),
            Some(&"ipv6") => Some(TcpFamily::Ipv6),
            Some(other) => {
                return Err(Error::Address(format!("tcp: unknown family `{other}`")));
            }
            None => None,
        };
        Ok(TcpAddress { host, port, family })
    }

    /// The session bus: `DBUS_SESSION_BUS_ADDRESS`, falling back to
    /// `$XDG_RUNTIME_DIR/bus`.
    pub fn session() -> Result<Vec<Address>> {
        if let Ok(address) = std::env::var("DBUS_SESSION_BUS_ADDRESS") {
            return Self::parse(&address);
        }
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .map_err(|_| Error::Address("no session bus address".to_string()))?;
        Ok(vec![Address {
            transport: Transport::Unix(UnixPath::File(PathBuf::from(runtime_dir).join("bus"))),
        }])
    }

    /// The system bus: `DBUS_SYSTEM_BUS_ADDRESS`, falling back to the
    /// well-known socket path.
    pub fn system() -> Result<Vec<Address>> {
        if let Ok(address) = std::env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            return Self::parse(&address);
        }
        Ok(vec![Address {
            transport: Transport::Unix(UnixPath::File(PathBuf::from(
                "/var/run/dbus/system_bus_socket",
            ))),
        }])
    }

    /// The bus that started this process, per `DBUS_STARTER_ADDRESS` /
    /// `DBUS_STARTER_BUS_TYPE`.
    pub fn starter() -> Result<Vec<Address>> {
        if let Ok(address) = std::env::var("DBUS_STARTER_ADDRESS") {
            return Self::parse(&address);
        }
        match std::env::var("DBUS_STARTER_BUS_TYPE").as_deref() {
            Ok("system") => Self::system(),
            Ok("session") | Err(_) => Self::session(),
            Ok(other) => Err(Error::Address(format!("unknown starter bus `{other}`"))),
        }
    }

    /// Open a stream to this address. For `nonce-tcp` the nonce is written
    /// before anything else, as the protocol requires.
    pub(crate) async fn connect(&self) -> Result<BoxedSplit> {
        match &self.transport {
            Transport::Unix(UnixPath::File(path)) => {
                debug!("connecting to unix socket {}", path.display());
                Ok(UnixStream::connect(path).await?.split().boxed())
            }
            #[cfg(target_os = "linux")]
            Transport::Unix(UnixPath::Abstract(name)) => {
                use std::os::linux::net::SocketAddrExt;

                debug!("connecting to abstract unix socket");
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name)?;
                let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                stream.set_nonblocking(true)?;
                Ok(UnixStream::from_std(stream)?.split().boxed())
            }
            #[cfg(not(target_os = "linux"))]
            Transport::Unix(UnixPath::Abstract(_)) => Err(Error::Address(
                "abstract sockets are Linux-only".to_string(),
            )),
            Transport::Unix(UnixPath::TmpDir(_)) => Err(Error::Address(
                "tmpdir addresses are only meaningful for servers".to_string(),
            )),
            Transport::Tcp(addr) => Ok(Self::connect_tcp(addr).await?.split().boxed()),
            Transport::NonceTcp { addr, noncefile } => {
                let stream = Self::connect_tcp(addr).await?;
                let nonce = tokio::fs::read(noncefile).await?;
                let nonce = nonce.get(..16).ok_or_else(|| {
                    Error::Address("nonce file is shorter than 16 bytes".to_string())
                })?;
                let mut split = stream.split().boxed();
                crate::connection::socket::write_all(&mut split.write, nonce).await?;
                Ok(split)
            }
        }
    }

    async fn connect_tcp(addr: &TcpAddress) -> Result<TcpStream> {
        debug!("connecting to tcp host {}:{}", addr.host, addr.port);
        let candidates = tokio::net::lookup_host((addr.host.as_str(), addr.port)).await?;
        let mut last_err = None;
        for candidate in candidates {
            let family_ok = match addr.family {
                Some(TcpFamily::Ipv4) => candidate.is_ipv4(),
                Some(TcpFamily::Ipv6) => candidate.is_ipv6(),
                None => true,
            };
            if !family_ok {
                continue;
            }
            match TcpStream::connect(candidate).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => e.into(),
            None => Error::Address(format!("no usable address for {}", addr.host)),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.transport {
            Transport::Unix(UnixPath::File(path)) => {
                write!(f, "unix:path=")?;
                let mut out = String::new();
                escape(path.to_string_lossy().as_bytes(), &mut out);
                f.write_str(&out)
            }
            Transport::Unix(UnixPath::Abstract(name)) => {
                write!(f, "unix:abstract=")?;
                let mut out = String::new();
                escape(name, &mut out);
                f.write_str(&out)
            }
            Transport::Unix(UnixPath::TmpDir(dir)) => {
                write!(f, "unix:tmpdir=")?;
                let mut out = String::new();
                escape(dir.to_string_lossy().as_bytes(), &mut out);
                f.write_str(&out)
            }
            Transport::Tcp(addr) => {
                write!(f, "tcp:host={},port={}", addr.host, addr.port)?;
                match addr.family {
                    Some(TcpFamily::Ipv4) => write!(f, ",family=ipv4"),
                    Some(TcpFamily::Ipv6) => write!(f, ",family=ipv6"),
                    None => Ok(()),
                }
            }
            Transport::NonceTcp { addr, noncefile } => {
                write!(f, "nonce-tcp:host={},port={}", addr.host, addr.port)?;
                write!(f, ",noncefile=")?;
                let mut out = String::new();
                escape(noncefile.to_string_lossy().as_bytes(), &mut out);
                f.write_str(&out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_record() {
        let parsed = Address::parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0].transport(),
            &Transport::Unix(UnixPath::File(PathBuf::from("/run/user/1000/bus")))
        );
    }

    #[test]
    fn escapes_decoded() {
        let parsed = Address::parse("unix:path=/tmp/with%20space").unwrap();
        assert_eq!(
            parsed[0].transport(),
            &Transport::Unix(UnixPath::File(PathBuf::from("/tmp/with space")))
        );
        assert!(Address::parse("unix:path=/tmp/bad%2").is_err());
        assert!(Address::parse("unix:path=/tmp/literal space").is_err());
    }

    #[test]
    fn multiple_records() {
        let parsed =
            Address::parse("unix:path=/one;tcp:host=localhost,port=7000,family=ipv4").unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(matches!(parsed[1].transport(), Transport::Tcp(_)));
    }

    #[test]
    fn unknown_transport_skipped() {
        let parsed = Address::parse("launchd:env=FOO;unix:path=/fallback").unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(Address::parse("launchd:env=FOO").is_err());
    }

    #[test]
    fn unix_keys_tried_in_order() {
        let parsed = Address::parse("unix:path=/a,abstract=b").unwrap();
        assert!(matches!(
            parsed[0].transport(),
            Transport::Unix(UnixPath::File(_))
        ));
        let parsed = Address::parse("unix:abstract=b,tmpdir=/t").unwrap();
        assert!(matches!(
            parsed[0].transport(),
            Transport::Unix(UnixPath::Abstract(_))
        ));
    }

    #[test]
    fn nonce_tcp_requires_noncefile() {
        assert!(Address::parse("nonce-tcp:host=h,port=1").is_err());
        let parsed = Address::parse("nonce-tcp:host=h,port=1,noncefile=/tmp/nonce").unwrap();
        assert!(matches!(parsed[0].transport(), Transport::NonceTcp { .. }));
    }

    #[test]
    fn display_round_trip() {
        for addr in [
            "unix:path=/run/bus",
            "unix:abstract=name",
            "tcp:host=localhost,port=111,family=ipv6",
        ] {
            let parsed = Address::parse(addr).unwrap();
            assert_eq!(parsed[0].to_string(), addr);
        }
    }

    #[test]
    fn bad_records() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("unix").is_err());
        assert!(Address::parse("unix:").is_err());
        assert!(Address::parse("tcp:host=h").is_err());
        assert!(Address::parse("tcp:host=h,port=abc").is_err());
        assert!(Address::parse("tcp:host=h,port=1,family=ipx").is_err());
    }
}
