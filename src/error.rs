use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy surfaced to applications.
///
/// Every fallible public entry point in this crate returns one of these
/// variants rather than a raw `io::Error`, so that callers can match on
/// cause instead of parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer closed its end of the transport.
    #[error("remote end closed the connection")]
    RemoteDisconnect,

    /// This side tore down the connection (explicit close, or a main
    /// connection going away under a secondary).
    #[error("connection was closed locally")]
    LocalDisconnect,

    /// A read or write on the transport failed for a reason other than
    /// orderly shutdown.
    #[error("transport I/O error: {0}")]
    TransportIo(#[source] io::Error),

    /// The AUTH handshake did not reach `AuthenticatedState`.
    #[error("authentication failed")]
    AuthFailed,

    /// A message could not be parsed off the wire.
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// A signature exceeded the 255-byte limit.
    #[error("signature exceeds 255 bytes")]
    SignatureTooLong,

    /// Container or struct-paren nesting exceeded the depth limit.
    #[error("signature nesting too deep")]
    NestingTooDeep,

    /// A string argument was not valid (no interior NUL, etc).
    #[error("invalid string argument")]
    InvalidString,

    /// An object path failed the grammar in §8.
    #[error("invalid object path: {0:?}")]
    InvalidObjectPath(String),

    /// A pending method call did not receive a reply within its timeout.
    #[error("method call timed out")]
    Timeout,

    /// A `PendingReply` was dropped (by the application or by a broken
    /// `CommLink`) before it completed.
    #[error("pending reply was detached before completion")]
    DetachedPendingReply,

    /// Enqueuing or transmitting an outbound message failed.
    #[error("failed to send message: {0}")]
    SendFailed(Box<Error>),

    /// The peer replied with a message of type Error.
    #[error("remote error {name}")]
    RemoteError {
        name: String,
        body: Vec<u8>,
    },

    /// More than 16 file descriptors were attached to one message.
    #[error("too many file descriptors attached to one message (max 16)")]
    TooManyFds,

    /// An address string (`unix:path=...`) did not parse.
    #[error("invalid bus address: {0}")]
    InvalidAddress(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
                Error::RemoteDisconnect
            }
            _ => Error::TransportIo(e),
        }
    }
}
