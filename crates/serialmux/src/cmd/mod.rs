use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use serialmux_device::DEFAULT_BAUD_RATE;
use serialmux_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};
use serialmux_host::{DataEncoding, HostConfig};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod list;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve framed commands on stdin/stdout (the default).
    Serve(ServeArgs),
    /// List serial ports present on this machine.
    List(ListArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::List(args) => list::run(args),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EncodingArg {
    Base64,
    Array,
}

impl From<EncodingArg> for DataEncoding {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Base64 => DataEncoding::Base64,
            EncodingArg::Array => DataEncoding::Array,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Caller origin and manifest arguments added by the browser. Ignored.
    #[arg(value_name = "ORIGIN", hide = true)]
    pub origin: Vec<String>,

    /// Parent window handle added by the browser on Windows. Ignored.
    #[arg(long, value_name = "HANDLE", hide = true)]
    pub parent_window: Option<String>,

    /// Baud rate for `open` commands without a usable `baudRate`.
    #[arg(long, value_name = "BAUD", default_value_t = DEFAULT_BAUD_RATE, env = "SERIALMUX_DEFAULT_BAUD")]
    pub default_baud: u32,

    /// How `data` event payloads are encoded.
    #[arg(long, value_name = "ENCODING", default_value = "base64", env = "SERIALMUX_DATA_ENCODING")]
    pub data_encoding: EncodingArg,

    /// Largest frame payload accepted or produced, in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_PAYLOAD, env = "SERIALMUX_MAX_FRAME_SIZE")]
    pub max_frame_size: usize,

    /// Events buffered for the output pipe before producers wait.
    #[arg(long, value_name = "EVENTS", default_value_t = 100, env = "SERIALMUX_OUTBOUND_CAPACITY")]
    pub outbound_capacity: usize,

    /// Pending writes per port before the dispatcher waits.
    #[arg(long, value_name = "WRITES", default_value_t = 5, env = "SERIALMUX_WRITE_QUEUE")]
    pub write_queue: usize,

    /// Largest single device read forwarded as one event, in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = 2048, env = "SERIALMUX_READ_BUFFER")]
    pub read_buffer: usize,

    /// Longest a device read blocks before checking for close (e.g. 100ms).
    #[arg(long, value_name = "DURATION", default_value = "100ms", value_parser = parse_duration, env = "SERIALMUX_READ_POLL")]
    pub read_poll: Duration,

    /// How long shutdown waits for ports to close (e.g. 5s).
    #[arg(long, value_name = "DURATION", default_value = "5s", value_parser = parse_duration, env = "SERIALMUX_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: Duration,

    /// Do not send `debug` notices to the client.
    #[arg(long, env = "SERIALMUX_NO_DEBUG_EVENTS")]
    pub no_debug_events: bool,
}

impl ServeArgs {
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            frame: FrameConfig {
                max_payload_size: self.max_frame_size,
            },
            outbound_capacity: self.outbound_capacity,
            write_queue_capacity: self.write_queue,
            read_buffer_size: self.read_buffer,
            read_poll_interval: self.read_poll,
            default_baud_rate: self.default_baud,
            data_encoding: self.data_encoding.into(),
            debug_events: !self.no_debug_events,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output format. Defaults to a table on a terminal and JSON otherwise.
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `150ms`, `5s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, CliError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
