//! Session multiplexing engine.
//!
//! Bridges a framed JSON pipe (stdin/stdout of a native messaging host) to any number of
//! serial devices. A single dispatch task ([`EventHub`]) owns the session registry; each
//! open device runs as a [`Session`] with its own reader and writer tasks; every outbound
//! event funnels through one bounded queue into one pipe writer.

pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod hub;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod session;

pub use config::{DataEncoding, HostConfig};
pub use error::{HostError, Result};
pub use event::{Event, NO_SESSION};
pub use host::Host;
pub use hub::EventHub;
pub use outbound::{Outbound, OutboundQueue};
pub use protocol::{parse_command, Command, ProtocolError};
pub use registry::{RegistryError, SessionId, SessionRegistry};
pub use session::{
    CloseReason, PendingSession, Session, SessionClosing, SessionOptions, SessionState,
};
