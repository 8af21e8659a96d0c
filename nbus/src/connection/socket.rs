//! Transport abstraction for the connection.
//!
//! A [`Socket`] splits into a [`ReadHalf`] and a [`WriteHalf`] so reading and
//! writing can proceed concurrently. The Unix implementations carry file
//! descriptors as `SCM_RIGHTS` ancillary data; TCP carries bytes only.

use std::{
    fmt, io,
    io::{IoSlice, IoSliceMut},
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    sync::Arc,
};

use async_trait::async_trait;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown, UnixAddr,
};
use tokio::{
    io::Interest,
    net::{TcpStream, UnixStream},
};

use crate::fdo::ConnectionCredentials;

/// Ancillary buffer space reserved per `recvmsg` call.
const FDS_PER_RECVMSG: usize = 64;

/// The read half of a socket.
#[async_trait]
pub trait ReadHalf: fmt::Debug + Send + Sync + 'static {
    /// Receive bytes, plus any file descriptors that arrived with them.
    async fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)>;

    /// Supports passing file descriptors.
    fn can_pass_unix_fd(&self) -> bool {
        false
    }

    /// The peer credentials, where the transport exposes them.
    async fn peer_credentials(&mut self) -> io::Result<ConnectionCredentials> {
        Ok(ConnectionCredentials::default())
    }
}

/// The write half of a socket.
#[async_trait]
pub trait WriteHalf: fmt::Debug + Send + Sync + 'static {
    /// Attempt to send bytes, with the given file descriptors as ancillary
    /// data.
    ///
    /// On success, returns the number of bytes written. There may be a
    /// partial write, in which case the caller is responsible for sending the
    /// remaining data by calling this method again until everything is
    /// written. If at least one byte was written, the file descriptors went
    /// with it and must not be provided again.
    async fn sendmsg(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;

    /// Close the socket. After this, reads and writes may fail.
    async fn close(&mut self) -> io::Result<()>;

    /// Supports passing file descriptors.
    fn can_pass_unix_fd(&self) -> bool {
        false
    }
}

#[async_trait]
impl ReadHalf for Box<dyn ReadHalf> {
    async fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        (**self).recvmsg(buf).await
    }

    fn can_pass_unix_fd(&self) -> bool {
        (**self).can_pass_unix_fd()
    }

    async fn peer_credentials(&mut self) -> io::Result<ConnectionCredentials> {
        (**self).peer_credentials().await
    }
}

#[async_trait]
impl WriteHalf for Box<dyn WriteHalf> {
    async fn sendmsg(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        (**self).sendmsg(buf, fds).await
    }

    async fn close(&mut self) -> io::Result<()> {
        (**self).close().await
    }

    fn can_pass_unix_fd(&self) -> bool {
        (**self).can_pass_unix_fd()
    }
}

/// A transport that can carry the D-Bus protocol.
pub trait Socket {
    type ReadHalf: ReadHalf;
    type WriteHalf: WriteHalf;

    /// Split into a read half and a write half.
    fn split(self) -> Split<Self::ReadHalf, Self::WriteHalf>
    where
        Self: Sized;
}

/// The two halves of a split socket.
#[derive(Debug)]
pub struct Split<R, W> {
    pub(crate) read: R,
    pub(crate) write: W,
}

impl<R: ReadHalf, W: WriteHalf> Split<R, W> {
    pub fn boxed(self) -> BoxedSplit {
        Split {
            read: Box::new(self.read),
            write: Box::new(self.write),
        }
    }
}

/// A type-erased split socket.
pub type BoxedSplit = Split<Box<dyn ReadHalf>, Box<dyn WriteHalf>>;

/// Drive `sendmsg` until all of `buf` is written.
pub(crate) async fn write_all(write: &mut Box<dyn WriteHalf>, buf: &[u8]) -> io::Result<()> {
    write_all_with_fds(write, buf, &[]).await
}

/// Like [`write_all`], with file descriptors on the first chunk.
pub(crate) async fn write_all_with_fds(
    write: &mut Box<dyn WriteHalf>,
    buf: &[u8],
    fds: &[BorrowedFd<'_>],
) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let chunk_fds = if pos == 0 { fds } else { &[] };
        let n = write.sendmsg(&buf[pos..], chunk_fds).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket write returned 0",
            ));
        }
        pos += n;
    }
    Ok(())
}

impl Socket for UnixStream {
    type ReadHalf = Arc<UnixStream>;
    type WriteHalf = Arc<UnixStream>;

    fn split(self) -> Split<Self::ReadHalf, Self::WriteHalf> {
        let arc = Arc::new(self);
        Split {
            read: arc.clone(),
            write: arc,
        }
    }
}

impl Socket for TcpStream {
    type ReadHalf = Arc<TcpStream>;
    type WriteHalf = Arc<TcpStream>;

    fn split(self) -> Split<Self::ReadHalf, Self::WriteHalf> {
        let arc = Arc::new(self);
        Split {
            read: arc.clone(),
            write: arc,
        }
    }
}

fn fd_recvmsg(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; FDS_PER_RECVMSG]);
    let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg), MsgFlags::empty())
        .map_err(io::Error::from)?;
    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel just handed us these descriptors; nothing
            // else owns them yet.
            fds.extend(
                received
                    .into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }
    Ok((msg.bytes, fds))
}

fn fd_sendmsg(fd: RawFd, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let iov = [IoSlice::new(buf)];
    let cmsgs = if raw.is_empty() {
        vec![]
    } else {
        vec![ControlMessage::ScmRights(&raw)]
    };
    sendmsg::<UnixAddr>(fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
}

#[async_trait]
impl ReadHalf for Arc<UnixStream> {
    async fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let fd = self.as_raw_fd();
        loop {
            self.readable().await?;
            match self.try_io(Interest::READABLE, || fd_recvmsg(fd, &mut *buf)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    fn can_pass_unix_fd(&self) -> bool {
        true
    }

    async fn peer_credentials(&mut self) -> io::Result<ConnectionCredentials> {
        let creds = nix::sys::socket::getsockopt(
            &**self,
            nix::sys::socket::sockopt::PeerCredentials,
        )?;
        Ok(ConnectionCredentials {
            unix_user_id: Some(creds.uid()),
            process_id: u32::try_from(creds.pid()).ok(),
        })
    }
}

#[async_trait]
impl WriteHalf for Arc<UnixStream> {
    async fn sendmsg(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        loop {
            self.writable().await?;
            match self.try_io(Interest::WRITABLE, || fd_sendmsg(fd, buf, fds)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        nix::sys::socket::shutdown(self.as_raw_fd(), Shutdown::Both).map_err(io::Error::from)
    }

    fn can_pass_unix_fd(&self) -> bool {
        true
    }
}

#[async_trait]
impl ReadHalf for Arc<TcpStream> {
    async fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        loop {
            self.readable().await?;
            match self.try_read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res.map(|n| (n, vec![])),
            }
        }
    }
}

#[async_trait]
impl WriteHalf for Arc<TcpStream> {
    async fn sendmsg(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        if !fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file descriptor passing is not supported over TCP",
            ));
        }
        loop {
            self.writable().await?;
            match self.try_write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                res => return res,
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        nix::sys::socket::shutdown(self.as_raw_fd(), Shutdown::Both).map_err(io::Error::from)
    }
}
