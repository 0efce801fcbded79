//! The outbound event queue and its single consumer.
//!
//! Every task that produces client-visible events holds an [`Outbound`]. Producers wait
//! when the queue is full, so a client that stops reading slows device ingestion down
//! instead of growing memory. Only [`run_pipe_writer`] touches the output pipe.

use bytes::Bytes;
use futures_util::SinkExt;
use serialmux_frame::{FrameCodec, FrameConfig, FrameError};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;

use crate::config::DataEncoding;
use crate::error::{HostError, Result};
use crate::event::{Event, INTERNAL_ERROR_PAYLOAD};

/// Create a queue holding at most `capacity` events.
pub fn channel(capacity: usize, debug_events: bool) -> (Outbound, OutboundQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbound { tx, debug_events }, OutboundQueue { rx })
}

/// Producer side of the outbound queue.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Event>,
    debug_events: bool,
}

impl Outbound {
    /// Queue an event, waiting for room.
    pub async fn emit(&self, event: Event) -> Result<()> {
        if self.suppressed(&event) {
            return Ok(());
        }
        self.tx.send(event).await.map_err(|_| HostError::PipeClosed)
    }

    /// Queue an event from a blocking thread.
    ///
    /// Must not be called from inside the async runtime.
    pub fn blocking_emit(&self, event: Event) -> Result<()> {
        if self.suppressed(&event) {
            return Ok(());
        }
        self.tx.blocking_send(event).map_err(|_| HostError::PipeClosed)
    }

    /// Queue a debug notice. The notice is always traced, even when not forwarded.
    pub async fn debug(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        tracing::debug!(notice = %message, "debug event");
        self.emit(Event::Debug(message)).await
    }

    fn suppressed(&self, event: &Event) -> bool {
        !self.debug_events && event.is_debug()
    }
}

/// Consumer side of the outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Event>,
}

impl OutboundQueue {
    /// Next event, or `None` once every producer is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// Drain the queue into `output`, one frame per event, flushing after each.
///
/// Returns when every producer has been dropped, or with an error when the pipe fails.
pub async fn run_pipe_writer<W>(
    mut queue: OutboundQueue,
    output: W,
    encoding: DataEncoding,
    frame: FrameConfig,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let max_payload = frame.max_payload_size;
    let mut sink = FramedWrite::new(output, FrameCodec::with_config(frame));

    while let Some(event) = queue.recv().await {
        let payload = match event.to_json(encoding) {
            Ok(json) if json.len() <= max_payload => Bytes::from(json),
            Ok(json) => {
                tracing::warn!(
                    size = json.len(),
                    max = max_payload,
                    session = ?event.session(),
                    "event does not fit in a frame"
                );
                Bytes::from_static(INTERNAL_ERROR_PAYLOAD)
            }
            Err(err) => {
                tracing::warn!(error = %err, session = ?event.session(), "failed to encode event");
                Bytes::from_static(INTERNAL_ERROR_PAYLOAD)
            }
        };

        match sink.send(payload).await {
            Ok(()) => {}
            Err(FrameError::PayloadTooLarge { size, max }) => {
                tracing::warn!(size, max, "dropping event larger than the frame limit");
            }
            Err(err) => return Err(HostError::PipeWrite(err)),
        }
    }

    tracing::debug!("outbound queue closed, pipe writer exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::{json, Value};
    use serialmux_frame::FrameCodec;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::registry::SessionId;

    async fn next_json<R>(frames: &mut FramedRead<R, FrameCodec>) -> Value
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let payload = frames.next().await.unwrap().unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn writes_events_in_queue_order() {
        let (outbound, queue) = channel(8, true);
        let (host_side, client_side) = tokio::io::duplex(4096);
        let writer = tokio::spawn(run_pipe_writer(
            queue,
            host_side,
            DataEncoding::Base64,
            FrameConfig::default(),
        ));

        outbound.debug("hello").await.unwrap();
        outbound
            .emit(Event::PortClosed {
                id: SessionId::new(1),
            })
            .await
            .unwrap();
        drop(outbound);

        let mut frames = FramedRead::new(client_side, FrameCodec::new());
        assert_eq!(next_json(&mut frames).await, json!({"debug": "hello"}));
        assert_eq!(
            next_json(&mut frames).await,
            json!({"event": "PortClosed", "id": 1})
        );
        writer.await.unwrap().unwrap();
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn debug_events_can_be_suppressed() {
        let (outbound, mut queue) = channel(8, false);
        outbound.debug("quiet").await.unwrap();
        outbound
            .emit(Event::error(b"x", -1, "Command not valid JSON"))
            .await
            .unwrap();
        drop(outbound);

        assert!(matches!(queue.recv().await, Some(Event::Error { .. })));
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn oversized_event_degrades_to_internal_error() {
        let (outbound, queue) = channel(8, true);
        let (host_side, client_side) = tokio::io::duplex(4096);
        let writer = tokio::spawn(run_pipe_writer(
            queue,
            host_side,
            DataEncoding::Base64,
            FrameConfig {
                max_payload_size: 64,
            },
        ));

        outbound
            .emit(Event::Data {
                id: SessionId::new(0),
                bytes: Bytes::from(vec![0u8; 256]),
            })
            .await
            .unwrap();
        outbound
            .emit(Event::PortClosed {
                id: SessionId::new(0),
            })
            .await
            .unwrap();
        drop(outbound);

        let mut frames = FramedRead::new(client_side, FrameCodec::new());
        assert_eq!(next_json(&mut frames).await, json!({"debug": "Internal error"}));
        assert_eq!(
            next_json(&mut frames).await,
            json!({"event": "PortClosed", "id": 0})
        );
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn emit_fails_once_writer_is_gone() {
        let (outbound, queue) = channel(1, true);
        drop(queue);
        assert!(matches!(
            outbound.debug("late").await,
            Err(HostError::PipeClosed)
        ));
    }
}
