use std::io;
use std::time::Duration;

use serde::Serialize;

use crate::error::Result;

/// Baud rate used when the client does not ask for one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// An open serial device handle.
///
/// A handle is used by one task at a time. The session splits a device into a reader
/// half and a writer half with [`SerialDevice::try_clone_device`]; both halves refer to
/// the same port and the port is released once every half has been closed.
pub trait SerialDevice: Send {
    /// Read available bytes into `buf`.
    ///
    /// `Ok(0)` means end of stream. An error of kind `TimedOut` means no data arrived
    /// within the configured read timeout; callers treat that as idle, not as a failure.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer to the device.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Create a second handle to the same device.
    fn try_clone_device(&self) -> Result<Box<dyn SerialDevice>>;

    /// Release this handle.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Enumerates and opens serial devices.
pub trait DeviceBackend: Send + Sync + 'static {
    /// List the serial ports currently present on the host.
    fn enumerate(&self) -> Result<Vec<PortDescriptor>>;

    /// Open `path` with the given line settings.
    fn open(&self, path: &str, settings: &PortSettings) -> Result<Box<dyn SerialDevice>>;
}

/// Line settings used when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Upper bound on a single blocking read, so readers can observe close requests.
    pub read_timeout: Duration,
}

impl PortSettings {
    /// 8 data bits, no parity, 1 stop bit at `baud_rate`.
    pub fn eight_n_one(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

impl Default for PortSettings {
    fn default() -> Self {
        Self::eight_n_one(DEFAULT_BAUD_RATE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Bus a port is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Usb,
    Pci,
    Bluetooth,
    Unknown,
}

/// One entry of a port listing, serialized as the client sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDescriptor {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: PortKind,
    #[serde(rename = "isUSB")]
    pub is_usb: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl PortDescriptor {
    /// A descriptor carrying only a path.
    pub fn bare(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: PortKind::Unknown,
            is_usb: false,
            vendor_id: None,
            product_id: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }
}
