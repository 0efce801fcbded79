//! One open serial device and the tasks that serve it.
//!
//! A session runs three tasks:
//! - a reader on the blocking pool that forwards device input as `data` events
//! - an async writer that drains the session's write queue into the device
//! - a supervisor that owns the close handshake
//!
//! Any party may ask for a close (the dispatcher, a failing reader or writer, or the
//! supervisor after a task panic). Requests race on a single `Active -> Closing`
//! compare-and-set and only the winner reaches the supervisor, so the handshake runs once.
//! The supervisor then cancels both tasks, waits for each one to hand its device half
//! back, closes the device, and reports `PortClosed` as the final event for the id.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serialmux_device::{DeviceError, SerialDevice};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::HostConfig;
use crate::event::Event;
use crate::outbound::Outbound;
use crate::registry::SessionId;

const CLOSE_RECEIVED: &str = "CommandClose received";

/// Lifecycle of a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Device acquired, tasks not started yet.
    Opening = 0,
    Active = 1,
    /// A close was requested and the handshake is running.
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Opening,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// What started a session's close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `close`.
    Requested,
    ReadError,
    ReadEof,
    WriteError,
    /// The reader or writer panicked.
    TaskFault,
    /// The host is going away.
    Shutdown,
}

impl CloseReason {
    /// Error reported to the client before `PortClosed`, if any.
    pub fn client_message(self) -> Option<&'static str> {
        match self {
            Self::ReadError => Some("Error reading from serial port"),
            Self::ReadEof => Some("EOF reading from serial port"),
            Self::WriteError => Some("Error writing to serial port"),
            Self::TaskFault => Some("Serial port task failed"),
            Self::Requested | Self::Shutdown => None,
        }
    }
}

/// Per-session sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub read_buffer_size: usize,
    pub write_queue_capacity: usize,
}

impl From<&HostConfig> for SessionOptions {
    fn from(config: &HostConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            write_queue_capacity: config.write_queue_capacity,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&HostConfig::default())
    }
}

/// The session no longer accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session {0} is closing")]
pub struct SessionClosing(pub SessionId);

#[derive(Debug)]
struct Lifecycle(AtomicU8);

impl Lifecycle {
    fn new() -> Self {
        Self(AtomicU8::new(SessionState::Opening as u8))
    }

    fn load(&self) -> SessionState {
        SessionState::from_raw(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn store(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move into `Closing`. True for exactly one caller per session.
    fn begin_close(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Opening, SessionState::Closing)
    }
}

/// Shared entry point for every close request.
#[derive(Debug, Clone)]
struct CloseTrigger {
    lifecycle: Arc<Lifecycle>,
    commands: mpsc::Sender<CloseReason>,
}

impl CloseTrigger {
    fn fire(&self, reason: CloseReason) -> bool {
        if !self.lifecycle.begin_close() {
            return false;
        }
        // Capacity is 1 and only the winner of `begin_close` sends.
        if self.commands.try_send(reason).is_err() {
            tracing::warn!(?reason, "session supervisor is gone");
        }
        true
    }
}

/// Dispatcher-side handle of a running session, as stored in the registry.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    device_path: String,
    trigger: CloseTrigger,
    data_tx: mpsc::Sender<Bytes>,
}

impl Session {
    /// Split `device` into reader and writer halves and wire up the session channels.
    ///
    /// Nothing runs until [`PendingSession::spawn`], so the caller can announce the
    /// session before any of its events can be produced.
    pub fn prepare(
        id: SessionId,
        device_path: String,
        device: Box<dyn SerialDevice>,
        options: SessionOptions,
        outbound: Outbound,
        terminated: mpsc::UnboundedSender<SessionId>,
    ) -> Result<(Session, PendingSession), DeviceError> {
        let writer_half = match device.try_clone_device() {
            Ok(half) => half,
            Err(err) => {
                if let Err(close_err) = device.close() {
                    tracing::warn!(session = %id, error = %close_err, "failed to release device");
                }
                return Err(err);
            }
        };

        let lifecycle = Arc::new(Lifecycle::new());
        let (commands_tx, commands_rx) = mpsc::channel(1);
        let (data_tx, data_rx) = mpsc::channel(options.write_queue_capacity.max(1));
        let trigger = CloseTrigger {
            lifecycle: Arc::clone(&lifecycle),
            commands: commands_tx,
        };

        let session = Session {
            id,
            device_path: device_path.clone(),
            trigger: trigger.clone(),
            data_tx,
        };
        let pending = PendingSession {
            id,
            device_path,
            reader_half: device,
            writer_half,
            data_rx,
            commands_rx,
            trigger,
            outbound,
            terminated,
            read_buffer_size: options.read_buffer_size.max(1),
        };
        Ok((session, pending))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub fn state(&self) -> SessionState {
        self.trigger.lifecycle.load()
    }

    /// Ask the session to close. Returns false if a close was already under way.
    pub fn request_close(&self) -> bool {
        self.close_with(CloseReason::Requested)
    }

    pub(crate) fn close_with(&self, reason: CloseReason) -> bool {
        self.trigger.fire(reason)
    }

    /// Queue bytes for the device, waiting while the write queue is full.
    pub async fn write(&self, data: Bytes) -> Result<(), SessionClosing> {
        if self.state() != SessionState::Active {
            return Err(SessionClosing(self.id));
        }
        self.data_tx
            .send(data)
            .await
            .map_err(|_| SessionClosing(self.id))
    }
}

/// A prepared session whose tasks have not started.
pub struct PendingSession {
    id: SessionId,
    device_path: String,
    reader_half: Box<dyn SerialDevice>,
    writer_half: Box<dyn SerialDevice>,
    data_rx: mpsc::Receiver<Bytes>,
    commands_rx: mpsc::Receiver<CloseReason>,
    trigger: CloseTrigger,
    outbound: Outbound,
    terminated: mpsc::UnboundedSender<SessionId>,
    read_buffer_size: usize,
}

impl fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSession")
            .field("id", &self.id)
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl PendingSession {
    /// Start the reader, writer and supervisor. Must run inside a tokio runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        // A close requested while still opening is picked up by the supervisor.
        self.trigger
            .lifecycle
            .transition(SessionState::Opening, SessionState::Active);
        tokio::spawn(self.supervise())
    }

    async fn supervise(self) {
        let PendingSession {
            id,
            device_path,
            reader_half,
            writer_half,
            data_rx,
            mut commands_rx,
            trigger,
            outbound,
            terminated,
            read_buffer_size,
        } = self;

        tracing::debug!(session = %id, path = %device_path, "session started");

        let cancel = CancellationToken::new();
        let reader_ctx = ReaderContext {
            id,
            token: cancel.child_token(),
            trigger: trigger.clone(),
            outbound: outbound.clone(),
            buffer_size: read_buffer_size,
        };
        let mut reader = tokio::task::spawn_blocking(move || read_loop(reader_half, reader_ctx));
        let mut writer = tokio::spawn(write_loop(
            writer_half,
            data_rx,
            cancel.child_token(),
            trigger.clone(),
            id,
        ));

        let mut halves: Vec<Box<dyn SerialDevice>> = Vec::with_capacity(2);
        let mut reader_joined = false;
        let mut writer_joined = false;

        let reason = loop {
            tokio::select! {
                Some(reason) = commands_rx.recv() => break reason,
                joined = &mut reader, if !reader_joined => {
                    reader_joined = true;
                    collect_half(id, "reader", joined.map(Some), &trigger, &mut halves);
                }
                joined = &mut writer, if !writer_joined => {
                    writer_joined = true;
                    collect_half(id, "writer", joined, &trigger, &mut halves);
                }
                else => break CloseReason::TaskFault,
            }
        };

        tracing::debug!(session = %id, ?reason, "closing session");
        cancel.cancel();
        if reason == CloseReason::Requested && outbound.debug(CLOSE_RECEIVED).await.is_err() {
            tracing::debug!(session = %id, "output pipe gone before close notice");
        }

        if !reader_joined {
            collect_half(id, "reader", reader.await.map(Some), &trigger, &mut halves);
        }
        if !writer_joined {
            collect_half(id, "writer", writer.await, &trigger, &mut halves);
        }

        // Both tasks are done, so nothing can touch the device past this point.
        for half in halves {
            if let Err(err) = half.close() {
                tracing::warn!(session = %id, error = %err, "failed to close device handle");
            }
        }
        trigger.lifecycle.store(SessionState::Closed);
        tracing::info!(session = %id, path = %device_path, ?reason, "session closed");

        if let Some(message) = reason.client_message() {
            if outbound.emit(Event::session_error(id, message)).await.is_err() {
                tracing::debug!(session = %id, "output pipe gone before close error");
            }
        }
        if outbound.emit(Event::PortClosed { id }).await.is_err() {
            tracing::debug!(session = %id, "output pipe gone before PortClosed");
        }
        if terminated.send(id).is_err() {
            tracing::debug!(session = %id, "dispatcher gone before session terminated");
        }
    }
}

/// Keep a task's returned device half, or turn a task failure into a close request.
fn collect_half(
    id: SessionId,
    task: &'static str,
    joined: Result<Option<Box<dyn SerialDevice>>, JoinError>,
    trigger: &CloseTrigger,
    halves: &mut Vec<Box<dyn SerialDevice>>,
) {
    match joined {
        Ok(Some(half)) => halves.push(half),
        Ok(None) => {}
        Err(err) => {
            tracing::error!(session = %id, task, error = %err, "session task failed");
            trigger.fire(CloseReason::TaskFault);
        }
    }
}

struct ReaderContext {
    id: SessionId,
    token: CancellationToken,
    trigger: CloseTrigger,
    outbound: Outbound,
    buffer_size: usize,
}

fn read_loop(mut device: Box<dyn SerialDevice>, ctx: ReaderContext) -> Box<dyn SerialDevice> {
    let mut buf = vec![0u8; ctx.buffer_size];

    while !ctx.token.is_cancelled() {
        match device.read(&mut buf) {
            Ok(0) => {
                tracing::debug!(session = %ctx.id, "device reported end of stream");
                ctx.trigger.fire(CloseReason::ReadEof);
                break;
            }
            Ok(n) => {
                let event = Event::Data {
                    id: ctx.id,
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                };
                if ctx.outbound.blocking_emit(event).is_err() {
                    ctx.trigger.fire(CloseReason::Shutdown);
                    break;
                }
            }
            Err(err) if is_idle(&err) => {}
            Err(err) => {
                tracing::warn!(session = %ctx.id, error = %err, "serial read failed");
                ctx.trigger.fire(CloseReason::ReadError);
                break;
            }
        }
    }
    device
}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn write_loop(
    mut device: Box<dyn SerialDevice>,
    mut data_rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    trigger: CloseTrigger,
    id: SessionId,
) -> Option<Box<dyn SerialDevice>> {
    loop {
        let data = tokio::select! {
            biased;
            () = token.cancelled() => break,
            data = data_rx.recv() => match data {
                Some(data) => data,
                None => {
                    // The dispatcher dropped the session handle.
                    trigger.fire(CloseReason::Requested);
                    break;
                }
            },
        };

        let written = tokio::task::spawn_blocking(move || {
            let result = device.write_all(&data);
            (device, result)
        })
        .await;

        match written {
            Ok((returned, Ok(()))) => device = returned,
            Ok((returned, Err(err))) => {
                tracing::warn!(session = %id, error = %err, "serial write failed");
                trigger.fire(CloseReason::WriteError);
                return Some(returned);
            }
            Err(err) => {
                tracing::error!(session = %id, error = %err, "serial write task failed");
                trigger.fire(CloseReason::TaskFault);
                return None;
            }
        }
    }
    Some(device)
}
