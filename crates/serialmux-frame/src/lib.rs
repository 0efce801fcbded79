//! Length-prefixed message framing for native messaging pipes.
//!
//! Every message on the pipe, in either direction, is framed as:
//! - A 4-byte little-endian payload length
//! - Exactly that many bytes of UTF-8 JSON payload
//!
//! Decoding is re-entrant over partial reads: callers append whatever chunk the pipe
//! produced and pull out zero or more complete frames.

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod error;
pub mod pipe;

#[cfg(feature = "async")]
pub use async_codec::FrameCodec;
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, FrameDecoder, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use pipe::{FrameReader, FrameWriter};
