use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: payload length (4, little-endian).
pub const HEADER_SIZE: usize = 4;

/// Default maximum payload size: 64 MiB.
///
/// This matches the largest message a browser will hand to a native messaging host.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The message payload (UTF-8 JSON on a well-behaved pipe).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }
}

/// Encode a payload into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────────┐
/// │ Length       │ Payload          │
/// │ (4B LE)      │ (Length bytes)   │
/// └──────────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. An oversized length is
/// reported without consuming anything; see [`FrameDecoder`] for a decoder that
/// skips past it.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(payload_len) = peek_len(src) else {
        return Ok(None); // Need more data
    };

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame { payload }))
}

fn peek_len(src: &BytesMut) -> Option<usize> {
    let header: [u8; HEADER_SIZE] = src.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(header) as usize)
}

/// Stateful decoder that survives oversized frames.
///
/// The pipe has no sync marker, so once a frame is rejected for size the only way back
/// to a frame boundary is to drop exactly the declared number of payload bytes. The
/// decoder reports [`FrameError::PayloadTooLarge`] once and then silently discards the
/// body, across as many input chunks as it takes.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_payload: usize,
    discarding: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            discarding: 0,
        }
    }

    /// Decode the next frame, if one is complete.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        self.skip_discarded(src);
        if self.discarding > 0 {
            return Ok(None);
        }

        match decode_frame(src, self.max_payload) {
            Err(FrameError::PayloadTooLarge { size, max }) => {
                src.advance(HEADER_SIZE);
                self.discarding = size;
                self.skip_discarded(src);
                tracing::warn!(size, max, "discarding oversized frame");
                Err(FrameError::PayloadTooLarge { size, max })
            }
            other => other,
        }
    }

    /// Bytes of an oversized payload still waiting to be dropped.
    pub fn pending_discard(&self) -> usize {
        self.discarding
    }

    fn skip_discarded(&mut self, src: &mut BytesMut) {
        let n = self.discarding.min(src.len());
        src.advance(n);
        self.discarding -= n;
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 64 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
