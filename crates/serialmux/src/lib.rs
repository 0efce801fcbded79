//! Serial port multiplexer for browser native messaging.
//!
//! A `serialmux` process is launched by the browser as a native messaging host. It reads
//! length-prefixed JSON commands on stdin and answers with length-prefixed JSON events on
//! stdout, exposing any number of serial devices as numbered sessions.
//!
//! # Crate Structure
//!
//! - [`frame`]: length-prefixed message framing
//! - [`device`]: serial port enumeration and I/O behind a swappable backend
//! - [`host`]: the session multiplexing engine

/// Re-export frame types.
pub mod frame {
    pub use serialmux_frame::*;
}

/// Re-export device types.
pub mod device {
    pub use serialmux_device::*;
}

/// Re-export host types.
pub mod host {
    pub use serialmux_host::*;
}

pub use serialmux_host::{Host, HostConfig};
