//! Outbound events and their wire shapes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::Serialize;
use serialmux_device::PortDescriptor;

use crate::config::DataEncoding;
use crate::registry::SessionId;

/// `id` value of errors that do not belong to a session.
pub const NO_SESSION: i64 = -1;

/// Encoded form of a debug notice that could not be built from its event.
pub(crate) const INTERNAL_ERROR_PAYLOAD: &[u8] = br#"{"debug":"Internal error"}"#;

/// Something the host tells the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PortList(Vec<PortDescriptor>),
    Data {
        id: SessionId,
        bytes: Bytes,
    },
    PortOpen {
        id: SessionId,
        device_path: String,
    },
    PortClosed {
        id: SessionId,
    },
    Error {
        /// Raw payload of the command that failed, empty for session faults.
        in_response_to: String,
        id: i64,
        message: String,
    },
    Debug(String),
}

impl Event {
    /// Error answering a client command.
    pub fn error(in_response_to: &[u8], id: i64, message: impl Into<String>) -> Self {
        Self::Error {
            in_response_to: String::from_utf8_lossy(in_response_to).into_owned(),
            id,
            message: message.into(),
        }
    }

    /// Error raised by a session on its own.
    pub fn session_error(id: SessionId, message: impl Into<String>) -> Self {
        Self::Error {
            in_response_to: String::new(),
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, Self::Debug(_))
    }

    /// Session this event belongs to, if any.
    pub fn session(&self) -> Option<i64> {
        match self {
            Self::Data { id, .. } | Self::PortOpen { id, .. } | Self::PortClosed { id } => {
                Some((*id).into())
            }
            Self::Error { id, .. } if *id != NO_SESSION => Some(*id),
            _ => None,
        }
    }

    /// Serialize to the JSON payload of one frame.
    pub fn to_json(&self, encoding: DataEncoding) -> serde_json::Result<Vec<u8>> {
        match self {
            Self::PortList(ports) => serde_json::to_vec(&Tagged {
                event: "SerialPorts",
                body: PortListBody { data: ports },
            }),
            Self::Data { id, bytes } => {
                let data = match encoding {
                    DataEncoding::Base64 => DataBody::Base64(STANDARD.encode(bytes)),
                    DataEncoding::Array => DataBody::Array(bytes.as_ref()),
                };
                serde_json::to_vec(&Tagged {
                    event: "data",
                    body: DataEventBody { id: *id, data },
                })
            }
            Self::PortOpen { id, device_path } => serde_json::to_vec(&Tagged {
                event: "PortOpen",
                body: PortOpenBody {
                    id: *id,
                    device_path,
                },
            }),
            Self::PortClosed { id } => serde_json::to_vec(&Tagged {
                event: "PortClosed",
                body: PortClosedBody { id: *id },
            }),
            Self::Error {
                in_response_to,
                id,
                message,
            } => serde_json::to_vec(&Tagged {
                event: "Error",
                body: ErrorBody {
                    in_response_to,
                    id: *id,
                    error: message,
                },
            }),
            Self::Debug(message) => serde_json::to_vec(&DebugBody { debug: message }),
        }
    }
}

#[derive(Serialize)]
struct Tagged<B> {
    event: &'static str,
    #[serde(flatten)]
    body: B,
}

#[derive(Serialize)]
struct PortListBody<'a> {
    data: &'a [PortDescriptor],
}

#[derive(Serialize)]
#[serde(untagged)]
enum DataBody<'a> {
    Base64(String),
    Array(&'a [u8]),
}

#[derive(Serialize)]
struct DataEventBody<'a> {
    id: SessionId,
    data: DataBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PortOpenBody<'a> {
    id: SessionId,
    device_path: &'a str,
}

#[derive(Serialize)]
struct PortClosedBody {
    id: SessionId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    in_response_to: &'a str,
    id: i64,
    error: &'a str,
}

#[derive(Serialize)]
struct DebugBody<'a> {
    debug: &'a str,
}
