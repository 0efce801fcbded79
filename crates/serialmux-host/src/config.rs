use std::time::Duration;

use serialmux_device::DEFAULT_BAUD_RATE;
use serialmux_frame::FrameConfig;

use crate::error::{HostError, Result};

/// How byte payloads of `data` events are written to the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataEncoding {
    /// Standard base64 string, which browser clients decode with `atob`.
    #[default]
    Base64,
    /// JSON array of byte values.
    Array,
}

/// Tunables for one host run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Frame limits for the inbound and outbound pipe.
    pub frame: FrameConfig,
    /// Events that may wait for the pipe writer before producers block. Default: 100.
    pub outbound_capacity: usize,
    /// Pending writes per session before the dispatcher blocks. Default: 5.
    pub write_queue_capacity: usize,
    /// Largest single device read forwarded as one `data` event. Default: 2048.
    pub read_buffer_size: usize,
    /// Longest a device read blocks before the reader re-checks for a close request.
    pub read_poll_interval: Duration,
    /// Baud rate for `open` commands without a usable `baudRate`. Default: 9600.
    pub default_baud_rate: u32,
    pub data_encoding: DataEncoding,
    /// Send `{"debug": ...}` notices to the client.
    pub debug_events: bool,
    /// How long shutdown waits for open sessions to finish their close handshake.
    pub shutdown_timeout: Duration,
}

impl HostConfig {
    /// Reject settings that would stall or panic at runtime.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.outbound_capacity == 0, "outbound capacity must be at least 1"),
            (self.write_queue_capacity == 0, "write queue capacity must be at least 1"),
            (self.read_buffer_size == 0, "read buffer size must be at least 1"),
            (self.read_poll_interval.is_zero(), "read poll interval must be non-zero"),
            (self.default_baud_rate == 0, "default baud rate must be positive"),
            (self.frame.max_payload_size == 0, "max frame size must be at least 1"),
        ];
        match checks.into_iter().find(|(bad, _)| *bad) {
            Some((_, reason)) => Err(HostError::InvalidConfig(reason.to_string())),
            None => Ok(()),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            outbound_capacity: 100,
            write_queue_capacity: 5,
            read_buffer_size: 2048,
            read_poll_interval: Duration::from_millis(100),
            default_baud_rate: DEFAULT_BAUD_RATE,
            data_encoding: DataEncoding::Base64,
            debug_events: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.outbound_capacity, 100);
        assert_eq!(config.write_queue_capacity, 5);
        assert_eq!(config.default_baud_rate, 9600);
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = HostConfig {
            outbound_capacity: 0,
            ..HostConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, HostError::InvalidConfig(msg) if msg.contains("outbound")));
    }
}
