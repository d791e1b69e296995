//! `busway`: a client-side connection runtime and wire marshaller for a
//! local-IPC message bus in the D-Bus style.
//!
//! The pieces compose bottom-up: [`marshal`] encodes/decodes argument
//! lists against the type-signature grammar in [`types`]; [`message`]
//! wraps a marshalled body in the header envelope that travels over a
//! [`transport`]; [`event_loop`] drives that transport (plus timers and
//! cross-thread wakeups) without blocking; [`auth`] runs the line-based
//! handshake every connection starts with; and [`connection`] ties all
//! of it into the state machine applications actually talk to.

pub mod address;
pub mod auth;
pub mod comm_link;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod marshal;
pub mod message;
pub mod pending_reply;
pub mod transport;
pub mod types;

pub use connection::{CommRef, Connection, ConnectionBuilder, ConnectionState, LocalServer};
pub use error::{Error, Result};
pub use marshal::{Arguments, Reader, Writer};
pub use message::{Message, MessageType};
pub use pending_reply::{PendingReply, ReplyOutcome};
pub use types::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath, Serial, Signature};
