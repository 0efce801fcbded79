//! Blocking ends of a native messaging pipe.
//!
//! These are for the process on the other side of the host: a browser stand-in, a test
//! harness, or a small tool that drives the host over its stdin/stdout.

use std::io::{self, Read, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, Frame, FrameDecoder, DEFAULT_MAX_PAYLOAD};
use crate::error::{FrameError, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Reads frames from a blocking pipe.
///
/// An oversized frame is reported once as [`FrameError::PayloadTooLarge`]; the next call
/// resumes at the following frame boundary.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    buf: BytesMut,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(inner: R, max_payload: usize) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(max_payload),
            buf: BytesMut::new(),
        }
    }

    /// Next complete frame, or `Ok(None)` once the pipe closes between frames.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if n == 0 {
                if self.buf.is_empty() && self.decoder.pending_discard() == 0 {
                    return Ok(None);
                }
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Writes frames to a blocking pipe, one flush per message.
pub struct FrameWriter<W> {
    inner: W,
    max_payload: usize,
    buf: BytesMut,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_max_payload(inner, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(inner: W, max_payload: usize) -> Self {
        Self {
            inner,
            max_payload,
            buf: BytesMut::new(),
        }
    }

    /// Frame and flush one message. Nothing is written when it is over the limit.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        self.buf.clear();
        encode_frame(payload, &mut self.buf)?;
        self.inner.write_all(&self.buf)?;
        self.inner.flush()?;
        Ok(())
    }
}
