//! Unix-domain-socket transport, including Linux abstract-namespace
//! sockets and SCM_RIGHTS file descriptor passing via `nix`.

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::Path;

use mio::net::{UnixListener as MioUnixListener, UnixStream as MioUnixStream};
use nix::cmsg_space;
use nix::sys::socket::{
    bind, connect, recvmsg, sendmsg, socket, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};

use super::{Listener, Transport, MAX_FDS_PER_MESSAGE};
use crate::error::Error;

fn would_block(e: &nix::Error) -> bool {
    matches!(e, nix::Error::EAGAIN)
}

fn nix_to_error(e: nix::Error) -> Error {
    if would_block(&e) {
        Error::TransportIo(io::Error::from(io::ErrorKind::WouldBlock))
    } else {
        Error::TransportIo(io::Error::from_raw_os_error(e as i32))
    }
}

pub struct UnixTransport {
    stream: MioUnixStream,
}

impl UnixTransport {
    pub fn connect(path: &Path) -> Result<Self, Error> {
        let stream = MioUnixStream::connect(path)?;
        Ok(UnixTransport { stream })
    }

    /// Connects to a Linux abstract-namespace socket (name has an implicit
    /// leading NUL on the wire, and no filesystem entry). `mio` has no
    /// direct constructor for this, so the socket is created with `nix`
    /// and handed to `mio::net::UnixStream::from_std`.
    pub fn connect_abstract(name: &str) -> Result<Self, Error> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(nix_to_error)?;
        let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(nix_to_error)?;
        match connect(fd, &addr) {
            Ok(()) => {}
            Err(nix::Error::EINPROGRESS) => {}
            Err(e) => return Err(nix_to_error(e)),
        }
        let std_stream = unsafe { StdUnixStream::from_raw_fd(fd) };
        let stream = MioUnixStream::from_std(std_stream);
        Ok(UnixTransport { stream })
    }

    pub(crate) fn from_mio(stream: MioUnixStream) -> Self {
        UnixTransport { stream }
    }
}

impl mio::event::Source for UnixTransport {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

impl Transport for UnixTransport {
    fn send(&mut self, data: &[u8], fds: &[RawFd]) -> Result<usize, Error> {
        if fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(Error::TooManyFds);
        }
        let fd = self.stream.as_raw_fd();
        let iov = [io::IoSlice::new(data)];
        let cmsgs = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), None::<&UnixAddr>).map_err(nix_to_error)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, Vec<RawFd>), Error> {
        let fd = self.stream.as_raw_fd();
        let mut iov = [io::IoSliceMut::new(buf)];
        let mut cmsg_buffer = cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
        let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
            .map_err(nix_to_error)?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                if fds.len() + received.len() > MAX_FDS_PER_MESSAGE {
                    return Err(Error::TooManyFds);
                }
                fds.extend(received);
            }
        }
        Ok((msg.bytes, fds))
    }

    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn supports_fd_passing(&self) -> bool {
        true
    }

    fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        &mut self.stream
    }
}

pub struct UnixListenerTransport {
    listener: MioUnixListener,
}

impl UnixListenerTransport {
    pub fn bind(path: &Path) -> Result<Self, Error> {
        let _ = std::fs::remove_file(path);
        let listener = MioUnixListener::bind(path)?;
        Ok(UnixListenerTransport { listener })
    }

    pub fn bind_abstract(name: &str) -> Result<Self, Error> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(nix_to_error)?;
        let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(nix_to_error)?;
        bind(fd, &addr).map_err(nix_to_error)?;
        nix::sys::socket::listen(fd, 128).map_err(nix_to_error)?;
        let std_listener = unsafe { StdUnixListener::from_raw_fd(fd) };
        let listener = MioUnixListener::from_std(std_listener);
        Ok(UnixListenerTransport { listener })
    }
}

impl mio::event::Source for UnixListenerTransport {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.listener.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.listener.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.listener.deregister(registry)
    }
}

impl Listener for UnixListenerTransport {
    fn accept(&mut self) -> Result<Option<Box<dyn Transport>>, Error> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(Box::new(UnixTransport::from_mio(stream)))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        &mut self.listener
    }
}
