//! TCP transport. No SCM_RIGHTS support: attempting to attach file
//! descriptors over this transport is rejected by the connection layer
//! before it ever reaches here (per §3, UNIX_FD is only usable on a
//! transport that negotiated `NEGOTIATE_UNIX_FD`, which TCP never does).

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};

use super::{Listener, Transport};
use crate::error::Error;

pub struct TcpTransport {
    stream: MioTcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}")))?;
        let stream = MioTcpStream::connect(addr)?;
        Ok(TcpTransport { stream })
    }

    pub(crate) fn from_mio(stream: MioTcpStream) -> Self {
        TcpTransport { stream }
    }
}

impl mio::event::Source for TcpTransport {
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

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8], fds: &[RawFd]) -> Result<usize, Error> {
        if !fds.is_empty() {
            return Err(Error::TooManyFds);
        }
        Ok(self.stream.write(data)?)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, Vec<RawFd>), Error> {
        let n = self.stream.read(buf)?;
        Ok((n, Vec::new()))
    }

    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn supports_fd_passing(&self) -> bool {
        false
    }

    fn source_mut(&mut self) -> &mut dyn mio::event::Source {
        &mut self.stream
    }
}

pub struct TcpListenerTransport {
    listener: MioTcpListener,
}

impl TcpListenerTransport {
    pub fn bind(host: &str, port: u16) -> Result<Self, Error> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}")))?;
        let listener = MioTcpListener::bind(addr)?;
        Ok(TcpListenerTransport { listener })
    }
}

impl mio::event::Source for TcpListenerTransport {
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

impl Listener for TcpListenerTransport {
    fn accept(&mut self) -> Result<Option<Box<dyn Transport>>, Error> {
        match self.listener.accept() {
            Ok((stream, _addr)) => Ok(Some(Box::new(TcpTransport::from_mio(stream)))),
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
