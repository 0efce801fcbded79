//! Inbound command decoding.
//!
//! Commands are JSON objects selected by their `command` field. Decoding is deliberately
//! lenient about extra fields and strict about the ones each command needs; every failure
//! maps to a client-facing message that is sent back in an `Error` event.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};

use crate::event::NO_SESSION;

pub const NOT_JSON: &str = "Command not valid JSON";
pub const NOT_RECOGNIZED: &str = "Command not recognized";
pub const MISSING_DEVICE_PATH: &str = "Missing devicePath!";
pub const INVALID_DEVICE_PATH: &str = "Invalid devicePath";
pub const MISSING_CLOSE_ID: &str = "Missing id in close command";
pub const MALFORMED_WRITE: &str = "Malformed write command";
pub const NO_OPEN_PORT: &str = "No open port with that id";
pub const PORT_CLOSING: &str = "Port is closing";
pub const OPEN_FAILED: &str = "Could not open serial port";
pub const TOO_MANY_PORTS: &str = "Too many open ports";
pub const LIST_FAILED: &str = "Could not list serial ports";
pub const FRAME_TOO_LARGE: &str = "Frame too large";

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open a device. `baud_rate` is `None` when absent or unusable.
    Open {
        device_path: String,
        baud_rate: Option<u32>,
    },
    /// Close a session. The id is kept raw so unknown values can be echoed back.
    Close { id: i64 },
    Write { id: i64, data: Vec<u8> },
    ListPorts,
}

/// Why a payload could not be turned into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProtocolError {
    pub message: &'static str,
    /// Session the error refers to, or [`NO_SESSION`].
    pub id: i64,
}

impl ProtocolError {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
            id: NO_SESSION,
        }
    }
}

/// Decode one frame payload.
pub fn parse_command(payload: &[u8]) -> Result<Command, ProtocolError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|_| ProtocolError::new(NOT_JSON))?;
    let Value::Object(fields) = value else {
        return Err(ProtocolError::new(NOT_RECOGNIZED));
    };

    match fields.get("command").and_then(Value::as_str) {
        Some("open") => parse_open(&fields),
        Some("close") => parse_close(&fields),
        Some("write") => parse_write(&fields),
        Some("listPorts") => Ok(Command::ListPorts),
        _ => Err(ProtocolError::new(NOT_RECOGNIZED)),
    }
}

fn parse_open(fields: &Map<String, Value>) -> Result<Command, ProtocolError> {
    let device_path = fields
        .get("devicePath")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::new(MISSING_DEVICE_PATH))?;

    let baud_rate = fields
        .get("baudRate")
        .and_then(Value::as_f64)
        .filter(|baud| baud.is_finite() && *baud >= 1.0 && *baud <= f64::from(u32::MAX))
        .map(|baud| baud as u32);

    Ok(Command::Open {
        device_path: device_path.to_string(),
        baud_rate,
    })
}

fn parse_close(fields: &Map<String, Value>) -> Result<Command, ProtocolError> {
    let id = integer_id(fields).ok_or_else(|| ProtocolError::new(MISSING_CLOSE_ID))?;
    Ok(Command::Close { id })
}

fn parse_write(fields: &Map<String, Value>) -> Result<Command, ProtocolError> {
    let malformed = || ProtocolError::new(MALFORMED_WRITE);
    let id = integer_id(fields).ok_or_else(malformed)?;
    let data = fields
        .get("data")
        .and_then(decode_bytes)
        .ok_or_else(malformed)?;
    Ok(Command::Write { id, data })
}

fn integer_id(fields: &Map<String, Value>) -> Option<i64> {
    let id = fields.get("id")?;
    id.as_i64().or_else(|| {
        // Clients built on JavaScript numbers may send `3.0`.
        id.as_f64()
            .filter(|raw| raw.fract() == 0.0 && raw.abs() <= i64::MAX as f64)
            .map(|raw| raw as i64)
    })
}

/// Accept a base64 string or an array of byte values.
fn decode_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(text) => STANDARD.decode(text).ok(),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|byte| u8::try_from(byte).ok()))
            .collect(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Command, ProtocolError> {
        parse_command(text.as_bytes())
    }

    #[test]
    fn parses_open_with_baud_rate() {
        assert_eq!(
            parse(r#"{"command":"open","devicePath":"/dev/ttyUSB0","baudRate":57600}"#),
            Ok(Command::Open {
                device_path: "/dev/ttyUSB0".to_string(),
                baud_rate: Some(57600),
            })
        );
    }

    #[test]
    fn unusable_baud_rates_fall_back_to_none() {
        for baud in ["", r#","baudRate":0"#, r#","baudRate":-5"#, r#","baudRate":"fast""#] {
            let text = format!(r#"{{"command":"open","devicePath":"COM3"{baud}}}"#);
            assert_eq!(
                parse(&text),
                Ok(Command::Open {
                    device_path: "COM3".to_string(),
                    baud_rate: None,
                }),
                "{text}"
            );
        }
    }

    #[test]
    fn open_requires_string_device_path() {
        let err = parse(r#"{"command":"open","baudRate":9600}"#).unwrap_err();
        assert_eq!(err, ProtocolError::new(MISSING_DEVICE_PATH));

        let err = parse(r#"{"command":"open","devicePath":7}"#).unwrap_err();
        assert_eq!(err.message, MISSING_DEVICE_PATH);
    }

    #[test]
    fn empty_device_path_is_left_to_the_dispatcher() {
        assert_eq!(
            parse(r#"{"command":"open","devicePath":""}"#),
            Ok(Command::Open {
                device_path: String::new(),
                baud_rate: None,
            })
        );
    }

    #[test]
    fn parses_close() {
        assert_eq!(
            parse(r#"{"command":"close","id":4}"#),
            Ok(Command::Close { id: 4 })
        );
        assert_eq!(
            parse(r#"{"command":"close","id":4.0}"#),
            Ok(Command::Close { id: 4 })
        );
        assert_eq!(
            parse(r#"{"command":"close"}"#).unwrap_err().message,
            MISSING_CLOSE_ID
        );
        assert_eq!(
            parse(r#"{"command":"close","id":"4"}"#).unwrap_err().message,
            MISSING_CLOSE_ID
        );
    }

    #[test]
    fn parses_write_with_base64_or_array() {
        assert_eq!(
            parse(r#"{"command":"write","id":1,"data":"aGk="}"#),
            Ok(Command::Write {
                id: 1,
                data: b"hi".to_vec(),
            })
        );
        assert_eq!(
            parse(r#"{"command":"write","id":1,"data":[104,105]}"#),
            Ok(Command::Write {
                id: 1,
                data: b"hi".to_vec(),
            })
        );
    }

    #[test]
    fn malformed_writes_rejected() {
        for text in [
            r#"{"command":"write","data":"aGk="}"#,
            r#"{"command":"write","id":1}"#,
            r#"{"command":"write","id":1,"data":"not base64!"}"#,
            r#"{"command":"write","id":1,"data":[1,256]}"#,
            r#"{"command":"write","id":1,"data":{"x":1}}"#,
        ] {
            assert_eq!(parse(text).unwrap_err().message, MALFORMED_WRITE, "{text}");
        }
    }

    #[test]
    fn unknown_and_invalid_payloads() {
        assert_eq!(parse("not json").unwrap_err(), ProtocolError::new(NOT_JSON));
        assert_eq!(parse("").unwrap_err().message, NOT_JSON);
        assert_eq!(parse("[1,2]").unwrap_err().message, NOT_RECOGNIZED);
        assert_eq!(parse(r#"{"command":"reboot"}"#).unwrap_err().message, NOT_RECOGNIZED);
        assert_eq!(parse(r#"{"id":1}"#).unwrap_err().message, NOT_RECOGNIZED);
        assert_eq!(parse(r#"{"command":"listPorts"}"#), Ok(Command::ListPorts));
    }
}
