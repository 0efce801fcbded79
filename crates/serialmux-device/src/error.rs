/// Errors that can occur in device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    /// Listing the host's serial ports failed.
    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(std::io::Error),

    /// A second handle to an open device could not be created.
    #[error("failed to clone device handle: {0}")]
    Clone(std::io::Error),

    /// An I/O error occurred on an open device.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
