//! Non-blocking byte transports, plus the server-role counterpart that
//! accepts incoming peer connections.
//!
//! Grounded on `address.rs` of the teacher crate for the unix/tcp split,
//! and on `original_source/transport/ivalidator.h`/`transport/*` for the
//! separation between a `Transport` (one connected byte stream) and the
//! listening side that produces them. File-descriptor passing is new: the
//! teacher never touched it, it's lifted from the `nix` usage pattern in
//! `redhat-performance-rusty-comms`'s IPC layer (SCM_RIGHTS via `nix`
//! rather than hand-rolled `libc` calls).

pub mod tcp;
pub mod unix;

pub use tcp::{TcpListenerTransport, TcpTransport};
pub use unix::{UnixListenerTransport, UnixTransport};

use std::os::unix::io::RawFd;

use mio::event::Source;

use crate::address::ConnectAddress;
use crate::error::Error;

/// The maximum number of file descriptors this crate will pass (or
/// accept) on a single message, per §3/§8.
pub const MAX_FDS_PER_MESSAGE: usize = 16;

/// A connected, non-blocking, message-framing-agnostic byte stream with
/// optional SCM_RIGHTS support. Implementors register with a `mio::Poll`
/// via the blanket `Source` impl they provide.
pub trait Transport: Source + Send {
    /// Non-blocking write. Returns `Error::TransportIo` wrapping a
    /// `WouldBlock` io::Error when the socket buffer is full.
    fn send(&mut self, data: &[u8], fds: &[RawFd]) -> Result<usize, Error>;

    /// Non-blocking read. Returns the bytes read and any file descriptors
    /// that rode along as ancillary data. A `Ok((0, _))` result means the
    /// peer performed an orderly shutdown.
    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, Vec<RawFd>), Error>;

    fn as_raw_fd(&self) -> RawFd;

    /// Whether this transport supports SCM_RIGHTS fd passing (true for
    /// unix-domain sockets, false for TCP).
    fn supports_fd_passing(&self) -> bool;

    /// Gives the dispatcher a `Source` to register, without relying on
    /// `dyn Transport` to `dyn Source` upcasting.
    fn source_mut(&mut self) -> &mut dyn Source;
}

/// The server-role counterpart of `Transport`: a listening socket that
/// produces connected transports as peers connect.
pub trait Listener: Source + Send {
    /// Non-blocking accept; returns `Ok(None)` when no connection is
    /// pending.
    fn accept(&mut self) -> Result<Option<Box<dyn Transport>>, Error>;

    fn as_raw_fd(&self) -> RawFd;

    fn source_mut(&mut self) -> &mut dyn Source;
}

/// Connects to `addr`, trying each entry in order as `Connection::connect`
/// does with a full address list.
pub fn connect(addr: &ConnectAddress) -> Result<Box<dyn Transport>, Error> {
    match addr {
        ConnectAddress::Unix { path } => Ok(Box::new(UnixTransport::connect(path)?)),
        ConnectAddress::UnixAbstract { name } => Ok(Box::new(UnixTransport::connect_abstract(name)?)),
        ConnectAddress::Tcp { host, port } => Ok(Box::new(TcpTransport::connect(host, *port)?)),
    }
}

/// Binds a listening socket at `addr` for the server role.
pub fn listen(addr: &ConnectAddress) -> Result<Box<dyn Listener>, Error> {
    match addr {
        ConnectAddress::Unix { path } => Ok(Box::new(UnixListenerTransport::bind(path)?)),
        ConnectAddress::UnixAbstract { name } => Ok(Box::new(UnixListenerTransport::bind_abstract(name)?)),
        ConnectAddress::Tcp { host, port } => Ok(Box::new(TcpListenerTransport::bind(host, *port)?)),
    }
}
