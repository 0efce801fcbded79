use std::fmt;
use std::io;

use serialmux_device::DeviceError;
use serialmux_frame::FrameError;
use serialmux_host::HostError;

// sysexits-style exit codes.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const DEVICE_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const PIPE_ERROR: i32 = 74;
pub const CONFIG_ERROR: i32 = 78;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => PIPE_ERROR,
        io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(PIPE_ERROR, format!("{context}: {err}")),
    }
}

pub fn device_error(context: &str, err: DeviceError) -> CliError {
    match err {
        DeviceError::Open { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
            CliError::new(PERMISSION_DENIED, format!("{context}: {source}"))
        }
        other => CliError::new(DEVICE_ERROR, format!("{context}: {other}")),
    }
}

pub fn host_error(context: &str, err: HostError) -> CliError {
    match err {
        HostError::PipeRead(source) => {
            CliError::new(PIPE_ERROR, format!("{context}: input pipe: {source}"))
        }
        HostError::PipeWrite(FrameError::Io(source)) => {
            CliError::new(PIPE_ERROR, format!("{context}: output pipe: {source}"))
        }
        HostError::PipeWrite(other) => frame_error(context, other),
        HostError::PipeClosed => CliError::new(PIPE_ERROR, format!("{context}: {err}")),
        HostError::InvalidConfig(_) => CliError::new(CONFIG_ERROR, format!("{context}: {err}")),
        HostError::Task(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}
