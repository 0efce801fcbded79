//! Serial device collaborators.
//!
//! The host never talks to the OS directly. It goes through a [`DeviceBackend`] that can
//! enumerate ports and open them as [`SerialDevice`] handles:
//! - [`SerialportBackend`] drives real hardware through the `serialport` crate
//! - `MockBackend` (feature `mock`) is an in-memory stand-in for tests

pub mod error;
#[cfg(feature = "mock")]
pub mod mock;
pub mod serial;
pub mod traits;

pub use error::{DeviceError, Result};
#[cfg(feature = "mock")]
pub use mock::{MockBackend, MockPort};
pub use serial::SerialportBackend;
pub use traits::{
    DataBits, DeviceBackend, Parity, PortDescriptor, PortKind, PortSettings, SerialDevice,
    StopBits, DEFAULT_BAUD_RATE,
};
