//! The dispatch loop.
//!
//! [`EventHub`] is the only owner of the session registry. It reads the inbound pipe,
//! turns frames into commands, routes them to sessions, and removes sessions once their
//! supervisors report that the close handshake finished.

use std::future::Future;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serialmux_device::{DeviceBackend, DeviceError, PortSettings};
use serialmux_frame::{FrameDecoder, FrameError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::event::{Event, NO_SESSION};
use crate::outbound::Outbound;
use crate::protocol::{
    parse_command, Command, FRAME_TOO_LARGE, INVALID_DEVICE_PATH, LIST_FAILED, NO_OPEN_PORT,
    OPEN_FAILED, PORT_CLOSING, TOO_MANY_PORTS,
};
use crate::registry::{RegistryError, SessionId, SessionRegistry};
use crate::session::{CloseReason, Session, SessionOptions};

const SERVING_BANNER: &str = "The proxy service is serving on stdin/stdout";
const READ_CHUNK: usize = 8 * 1024;

enum OpenFailure {
    Registry(RegistryError),
    Device(DeviceError),
}

impl From<RegistryError> for OpenFailure {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

/// Routes client commands to sessions.
pub struct EventHub {
    config: HostConfig,
    backend: Arc<dyn DeviceBackend>,
    outbound: Outbound,
    registry: SessionRegistry<Session>,
    decoder: FrameDecoder,
    terminated_tx: mpsc::UnboundedSender<SessionId>,
    terminated_rx: mpsc::UnboundedReceiver<SessionId>,
}

impl EventHub {
    pub fn new(config: HostConfig, backend: Arc<dyn DeviceBackend>, outbound: Outbound) -> Self {
        let (terminated_tx, terminated_rx) = mpsc::unbounded_channel();
        let decoder = FrameDecoder::new(config.frame.max_payload_size);
        Self {
            config,
            backend,
            outbound,
            registry: SessionRegistry::new(),
            decoder,
            terminated_tx,
            terminated_rx,
        }
    }

    /// Number of sessions in the registry.
    pub fn open_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Serve `input` until it reaches end of stream or `shutdown` completes.
    ///
    /// Sessions stay open when this returns; follow with [`EventHub::close_all`].
    pub async fn serve<R, F>(&mut self, mut input: R, shutdown: F) -> Result<()>
    where
        R: AsyncRead + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.outbound.debug(SERVING_BANNER).await?;
        tracing::info!("serving on the input pipe");

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            // Removals run before new commands so a reported close frees its id.
            tokio::select! {
                biased;
                Some(id) = self.terminated_rx.recv() => self.on_terminated(id).await?,
                () = &mut shutdown => {
                    tracing::info!(open = self.registry.len(), "shutdown requested");
                    return Ok(());
                }
                read = input.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        tracing::info!(open = self.registry.len(), "input pipe closed");
                        return Ok(());
                    }
                    Ok(_) => self.drain_frames(&mut buf).await?,
                    Err(err) => return Err(HostError::PipeRead(err)),
                },
            }
            // Keep reads from growing the buffer one byte at a time.
            if buf.capacity() - buf.len() < READ_CHUNK / 4 {
                buf.reserve(READ_CHUNK);
            }
        }
    }

    async fn drain_frames(&mut self, buf: &mut BytesMut) -> Result<()> {
        loop {
            match self.decoder.decode(buf) {
                Ok(Some(frame)) => self.handle_payload(&frame.payload).await?,
                Ok(None) => return Ok(()),
                Err(FrameError::PayloadTooLarge { .. }) => {
                    self.reply_error(b"", NO_SESSION, FRAME_TOO_LARGE).await?;
                }
                Err(err) => {
                    return Err(HostError::PipeRead(io::Error::new(
                        io::ErrorKind::InvalidData,
                        err,
                    )))
                }
            }
        }
    }

    /// Execute one command payload.
    pub async fn handle_payload(&mut self, raw: &[u8]) -> Result<()> {
        match parse_command(raw) {
            Ok(Command::Open {
                device_path,
                baud_rate,
            }) => self.open(raw, device_path, baud_rate).await,
            Ok(Command::Close { id }) => self.close(raw, id).await,
            Ok(Command::Write { id, data }) => self.write(raw, id, data).await,
            Ok(Command::ListPorts) => self.list_ports(raw).await,
            Err(err) => {
                tracing::debug!(error = %err, "rejected command");
                self.reply_error(raw, err.id, err.message).await
            }
        }
    }

    async fn open(&mut self, raw: &[u8], device_path: String, baud_rate: Option<u32>) -> Result<()> {
        if device_path.is_empty() {
            return self.reply_error(raw, NO_SESSION, INVALID_DEVICE_PATH).await;
        }
        self.outbound
            .debug(format!("Opening serial port {device_path}"))
            .await?;

        self.reap_terminated().await?;
        if self.registry.next_free().is_none() {
            tracing::warn!(path = %device_path, "no free session id");
            return self.reply_error(raw, NO_SESSION, TOO_MANY_PORTS).await;
        }

        let baud_rate = baud_rate.unwrap_or(self.config.default_baud_rate);
        self.outbound
            .debug(format!(
                "Requesting Serial connection to {device_path} (baudrate:{baud_rate})"
            ))
            .await?;

        let settings =
            PortSettings::eight_n_one(baud_rate).with_read_timeout(self.config.read_poll_interval);
        let backend = Arc::clone(&self.backend);
        let path = device_path.clone();
        let device = match tokio::task::spawn_blocking(move || backend.open(&path, &settings)).await
        {
            Ok(Ok(device)) => device,
            Ok(Err(err)) => {
                tracing::warn!(path = %device_path, error = %err, "failed to open serial port");
                return self.reply_error(raw, NO_SESSION, OPEN_FAILED).await;
            }
            Err(err) => {
                tracing::error!(path = %device_path, error = %err, "device open task failed");
                return self.reply_error(raw, NO_SESSION, OPEN_FAILED).await;
            }
        };

        let options = SessionOptions::from(&self.config);
        let outbound = self.outbound.clone();
        let terminated = self.terminated_tx.clone();
        let mut pending = None;
        let allocated = self.registry.allocate_with(|id| {
            let (session, start) =
                Session::prepare(id, device_path.clone(), device, options, outbound, terminated)
                    .map_err(OpenFailure::Device)?;
            pending = Some(start);
            Ok::<_, OpenFailure>(session)
        });

        let (id, pending) = match (allocated, pending) {
            (Ok(id), Some(pending)) => (id, pending),
            (Err(OpenFailure::Registry(err)), _) => {
                // The closure never ran, so dropping it released the device.
                tracing::warn!(path = %device_path, error = %err, "no free session id");
                return self.reply_error(raw, NO_SESSION, TOO_MANY_PORTS).await;
            }
            (Err(OpenFailure::Device(err)), _) => {
                tracing::warn!(path = %device_path, error = %err, "failed to split device handle");
                return self.reply_error(raw, NO_SESSION, OPEN_FAILED).await;
            }
            (Ok(id), None) => {
                tracing::error!(session = %id, "session registered without tasks");
                self.registry.remove(id);
                return self.reply_error(raw, NO_SESSION, OPEN_FAILED).await;
            }
        };

        tracing::info!(session = %id, path = %device_path, baud_rate, "serial port opened");
        self.outbound.debug(format!("Using id {id}")).await?;
        self.outbound
            .emit(Event::PortOpen { id, device_path })
            .await?;
        pending.spawn();
        Ok(())
    }

    async fn close(&mut self, raw: &[u8], raw_id: i64) -> Result<()> {
        let Some(id) = self.lookup(raw_id) else {
            return self.reply_error(raw, raw_id, NO_OPEN_PORT).await;
        };
        self.outbound
            .debug(format!("Closing serial port {id}"))
            .await?;

        if let Some(session) = self.registry.get(id) {
            if !session.request_close() {
                tracing::debug!(session = %id, state = %session.state(), "close already in progress");
            }
        }
        Ok(())
    }

    async fn write(&mut self, raw: &[u8], raw_id: i64, data: Vec<u8>) -> Result<()> {
        let written = match self.lookup(raw_id).and_then(|id| self.registry.get(id)) {
            Some(session) => session.write(Bytes::from(data)).await,
            None => return self.reply_error(raw, raw_id, NO_OPEN_PORT).await,
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "write rejected");
            return self.reply_error(raw, raw_id, PORT_CLOSING).await;
        }
        Ok(())
    }

    async fn list_ports(&mut self, raw: &[u8]) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        match tokio::task::spawn_blocking(move || backend.enumerate()).await {
            Ok(Ok(ports)) => {
                tracing::debug!(count = ports.len(), "enumerated serial ports");
                self.outbound.emit(Event::PortList(ports)).await
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "failed to enumerate serial ports");
                self.reply_error(raw, NO_SESSION, LIST_FAILED).await
            }
            Err(err) => {
                tracing::error!(error = %err, "port enumeration task failed");
                self.reply_error(raw, NO_SESSION, LIST_FAILED).await
            }
        }
    }

    async fn on_terminated(&mut self, id: SessionId) -> Result<()> {
        if self.registry.remove(id).is_none() {
            tracing::warn!(session = %id, "termination for unknown session");
            return Ok(());
        }
        self.outbound
            .debug(format!("Serial port closed: {id}"))
            .await
    }

    /// Apply terminations already reported without waiting for the loop.
    async fn reap_terminated(&mut self) -> Result<()> {
        while let Ok(id) = self.terminated_rx.try_recv() {
            self.on_terminated(id).await?;
        }
        Ok(())
    }

    /// Close every session and wait for their handshakes until `deadline`.
    ///
    /// Sessions still open at the deadline are dropped from the registry.
    pub async fn close_all(&mut self, deadline: Instant) -> Result<()> {
        self.reap_terminated().await?;
        if self.registry.is_empty() {
            return Ok(());
        }
        for (id, session) in self.registry.iter() {
            if session.close_with(CloseReason::Shutdown) {
                tracing::debug!(session = %id, "closing for shutdown");
            }
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while !self.registry.is_empty() {
                match self.terminated_rx.recv().await {
                    Some(id) => self.on_terminated(id).await?,
                    None => break,
                }
            }
            Ok::<_, HostError>(())
        })
        .await;

        match drained {
            Ok(result) => result,
            Err(_) => {
                let stuck: Vec<SessionId> = self.registry.drain().map(|(id, _)| id).collect();
                tracing::warn!(?stuck, "sessions did not close in time");
                Ok(())
            }
        }
    }

    fn lookup(&self, raw_id: i64) -> Option<SessionId> {
        SessionId::try_from(raw_id)
            .ok()
            .filter(|id| self.registry.contains(*id))
    }

    async fn reply_error(&self, raw: &[u8], id: i64, message: &'static str) -> Result<()> {
        self.outbound.emit(Event::error(raw, id, message)).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serialmux_device::MockBackend;
    use serialmux_frame::encode_frame;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::outbound::{self, OutboundQueue};

    const WAIT: Duration = Duration::from_secs(5);

    fn hub_with(backend: Arc<MockBackend>) -> (EventHub, OutboundQueue) {
        build_hub(backend, false)
    }

    fn build_hub(backend: Arc<MockBackend>, debug_events: bool) -> (EventHub, OutboundQueue) {
        let config = HostConfig {
            read_poll_interval: Duration::from_millis(10),
            ..HostConfig::default()
        };
        let (outbound, queue) = outbound::channel(64, debug_events);
        (EventHub::new(config, backend, outbound), queue)
    }

    async fn next(queue: &mut OutboundQueue) -> Event {
        tokio::time::timeout(WAIT, queue.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn message(event: &Event) -> (&str, i64) {
        match event {
            Event::Error { message, id, .. } => (message, *id),
            other => panic!("expected an error event, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_device_path_leaves_registry_untouched() {
        let backend = Arc::new(MockBackend::new());
        let (mut hub, mut queue) = hub_with(Arc::clone(&backend));

        hub.handle_payload(br#"{"command":"open","devicePath":""}"#)
            .await
            .unwrap();
        assert_eq!(message(&next(&mut queue).await), ("Invalid devicePath", -1));
        assert_eq!(hub.open_sessions(), 0);
        assert!(backend.opened().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_defaults_to_9600_baud() {
        let backend = Arc::new(MockBackend::new());
        backend.add_port("/dev/mock0");
        let (mut hub, mut queue) = hub_with(Arc::clone(&backend));

        hub.handle_payload(br#"{"command":"open","devicePath":"/dev/mock0"}"#)
            .await
            .unwrap();
        assert_eq!(
            next(&mut queue).await,
            Event::PortOpen {
                id: SessionId::new(0),
                device_path: "/dev/mock0".to_string(),
            }
        );
        let opened = backend.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].1.baud_rate, 9600);
        assert_eq!(opened[0].1.read_timeout, Duration::from_millis(10));
        assert_eq!(hub.open_sessions(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_failure_is_reported() {
        let backend = Arc::new(MockBackend::new());
        let (mut hub, mut queue) = hub_with(backend);

        hub.handle_payload(br#"{"command":"open","devicePath":"/dev/missing"}"#)
            .await
            .unwrap();
        assert_eq!(
            message(&next(&mut queue).await),
            ("Could not open serial port", -1)
        );
        assert_eq!(hub.open_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_ids_are_echoed_back() {
        let backend = Arc::new(MockBackend::new());
        let (mut hub, mut queue) = hub_with(backend);

        hub.handle_payload(br#"{"command":"write","id":3,"data":"aGk="}"#)
            .await
            .unwrap();
        assert_eq!(
            message(&next(&mut queue).await),
            ("No open port with that id", 3)
        );

        hub.handle_payload(br#"{"command":"close","id":300}"#)
            .await
            .unwrap();
        assert_eq!(
            message(&next(&mut queue).await),
            ("No open port with that id", 300)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn terminated_sessions_leave_the_registry() {
        let backend = Arc::new(MockBackend::new());
        let port = backend.add_port("/dev/mock0");
        let (mut hub, mut queue) = hub_with(Arc::clone(&backend));

        hub.handle_payload(br#"{"command":"open","devicePath":"/dev/mock0"}"#)
            .await
            .unwrap();
        assert!(matches!(next(&mut queue).await, Event::PortOpen { .. }));

        hub.handle_payload(br#"{"command":"close","id":0}"#)
            .await
            .unwrap();
        assert_eq!(
            next(&mut queue).await,
            Event::PortClosed {
                id: SessionId::new(0)
            }
        );

        let id = tokio::time::timeout(WAIT, hub.terminated_rx.recv())
            .await
            .unwrap()
            .unwrap();
        hub.on_terminated(id).await.unwrap();
        assert_eq!(hub.open_sessions(), 0);
        assert!(!port.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_ports_reports_enumeration_failure() {
        let backend = Arc::new(MockBackend::new());
        backend.add_port("/dev/mock0");
        let (mut hub, mut queue) = hub_with(Arc::clone(&backend));

        hub.handle_payload(br#"{"command":"listPorts"}"#).await.unwrap();
        assert!(matches!(next(&mut queue).await, Event::PortList(ports) if ports.len() == 1));

        backend.fail_enumeration(true);
        hub.handle_payload(br#"{"command":"listPorts"}"#).await.unwrap();
        assert_eq!(
            message(&next(&mut queue).await),
            ("Could not list serial ports", -1)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversized_frame_is_skipped() {
        let backend = Arc::new(MockBackend::new());
        let (mut hub, mut queue) = hub_with(backend);
        hub.decoder = FrameDecoder::new(16);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&40u32.to_le_bytes());
        buf.extend_from_slice(&[b'x'; 40]);
        let next_frame = br#"{"command":"nope"}"#;
        buf.extend_from_slice(&(next_frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(next_frame);

        hub.drain_frames(&mut buf).await.unwrap();
        // The follow-up frame is larger than the cap too, but the stream stays in sync.
        assert_eq!(message(&next(&mut queue).await), ("Frame too large", -1));
        assert_eq!(message(&next(&mut queue).await), ("Frame too large", -1));
        assert!(buf.is_empty());

        let small = br#"[]"#;
        buf.extend_from_slice(&(small.len() as u32).to_le_bytes());
        buf.extend_from_slice(small);
        hub.drain_frames(&mut buf).await.unwrap();
        assert_eq!(
            message(&next(&mut queue).await),
            ("Command not recognized", -1)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reported_close_frees_id_before_next_open() {
        let backend = Arc::new(MockBackend::new());
        backend.add_port("/dev/a");
        backend.add_port("/dev/b");
        let (mut hub, mut queue) = hub_with(Arc::clone(&backend));

        hub.handle_payload(br#"{"command":"open","devicePath":"/dev/a"}"#)
            .await
            .unwrap();
        assert!(matches!(next(&mut queue).await, Event::PortOpen { .. }));
        hub.handle_payload(br#"{"command":"close","id":0}"#)
            .await
            .unwrap();
        assert_eq!(
            next(&mut queue).await,
            Event::PortClosed {
                id: SessionId::new(0)
            }
        );

        // Termination notice and the next open are both waiting when the loop starts.
        let id = tokio::time::timeout(WAIT, hub.terminated_rx.recv())
            .await
            .unwrap()
            .unwrap();
        hub.terminated_tx.send(id).unwrap();

        let (mut client, host_in) = tokio::io::duplex(4096);
        let mut wire = BytesMut::new();
        encode_frame(br#"{"command":"open","devicePath":"/dev/b"}"#, &mut wire).unwrap();
        client.write_all(&wire).await.unwrap();
        drop(client);

        hub.serve(host_in, std::future::pending()).await.unwrap();
        assert_eq!(
            next(&mut queue).await,
            Event::PortOpen {
                id: SessionId::new(0),
                device_path: "/dev/b".to_string(),
            }
        );
        hub.close_all(Instant::now() + WAIT).await.unwrap();
        assert_eq!(hub.open_sessions(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_notices_only_for_live_ports() {
        let backend = Arc::new(MockBackend::new());
        backend.add_port("/dev/mock0");
        let (mut hub, mut queue) = build_hub(Arc::clone(&backend), true);

        hub.handle_payload(br#"{"command":"open","devicePath":"/dev/mock0"}"#)
            .await
            .unwrap();
        while !matches!(next(&mut queue).await, Event::PortOpen { .. }) {}

        hub.handle_payload(br#"{"command":"close","id":7}"#)
            .await
            .unwrap();
        assert_eq!(
            message(&next(&mut queue).await),
            ("No open port with that id", 7)
        );

        hub.handle_payload(br#"{"command":"close","id":0}"#)
            .await
            .unwrap();
        assert_eq!(
            next(&mut queue).await,
            Event::Debug("Closing serial port 0".to_string())
        );
        assert_eq!(
            next(&mut queue).await,
            Event::Debug("CommandClose received".to_string())
        );
        assert_eq!(
            next(&mut queue).await,
            Event::PortClosed {
                id: SessionId::new(0)
            }
        );
    }
}
