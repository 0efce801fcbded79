//! `tokio_util::codec` adapter for the length-prefixed wire format.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{encode_frame, FrameConfig, FrameDecoder};
use crate::error::{FrameError, Result};

/// Codec yielding raw frame payloads.
///
/// Used with `FramedWrite` on the host's stdout and `FramedRead` by pipe clients.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    decoder: FrameDecoder,
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            decoder: FrameDecoder::new(config.max_payload_size),
            max_payload_size: config.max_payload_size,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        Ok(self.decoder.decode(src)?.map(|frame| frame.payload))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: item.len(),
                max: self.max_payload_size,
            });
        }
        encode_frame(&item, dst)
    }
}
