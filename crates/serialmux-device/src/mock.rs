//! In-memory serial backend.
//!
//! Each registered path gets a [`MockPort`] that tests use to script what the device
//! returns from reads, make writes fail, and inspect what was written. The port also
//! records whether any handle touched it after the first handle was closed, which is how
//! session tests prove the close handshake never releases a device under a live task.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{DeviceError, Result};
use crate::traits::{DeviceBackend, PortDescriptor, PortSettings, SerialDevice};

/// Backend over a set of scripted ports.
#[derive(Default)]
pub struct MockBackend {
    ports: Mutex<HashMap<String, MockPort>>,
    listing: Mutex<Vec<PortDescriptor>>,
    fail_enumeration: AtomicBool,
    opened: Mutex<Vec<(String, PortSettings)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a port at `path` and return its control handle.
    pub fn add_port(&self, path: &str) -> MockPort {
        let port = MockPort::default();
        lock(&self.ports).insert(path.to_string(), port.clone());
        lock(&self.listing).push(PortDescriptor::bare(path));
        port
    }

    /// Control handle of a registered port.
    pub fn port(&self, path: &str) -> Option<MockPort> {
        lock(&self.ports).get(path).cloned()
    }

    /// Make [`DeviceBackend::enumerate`] fail.
    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Every successful open, in order, with the settings used.
    pub fn opened(&self) -> Vec<(String, PortSettings)> {
        lock(&self.opened).clone()
    }
}

impl DeviceBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<PortDescriptor>> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(DeviceError::Enumerate(io::Error::other(
                "enumeration disabled",
            )));
        }
        Ok(lock(&self.listing).clone())
    }

    fn open(&self, path: &str, settings: &PortSettings) -> Result<Box<dyn SerialDevice>> {
        let port = self.port(path).ok_or_else(|| DeviceError::Open {
            path: path.to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        })?;

        let device = port.acquire(settings).map_err(|source| DeviceError::Open {
            path: path.to_string(),
            source,
        })?;
        lock(&self.opened).push((path.to_string(), *settings));
        Ok(Box::new(device))
    }
}

enum Incoming {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
    Panic,
}

#[derive(Default)]
struct PortState {
    open: bool,
    handles: usize,
    released_any: bool,
    use_after_close: bool,
    close_count: usize,
    read_timeout: Duration,
    incoming: VecDeque<Incoming>,
    written: Vec<u8>,
    fail_writes: bool,
    hold_writes: bool,
    held_writes: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<PortState>,
    changed: Condvar,
}

/// Test-side control handle for one mock device.
#[derive(Clone, Default)]
pub struct MockPort {
    shared: Arc<Shared>,
}

impl MockPort {
    fn acquire(&self, settings: &PortSettings) -> io::Result<MockDevice> {
        let mut state = self.state();
        if state.open {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "port busy"));
        }
        state.open = true;
        state.handles = 1;
        state.released_any = false;
        state.read_timeout = settings.read_timeout;
        Ok(MockDevice::new(self.clone()))
    }

    /// Queue bytes for the next read.
    pub fn push_data(&self, data: &[u8]) {
        self.push(Incoming::Data(data.to_vec()));
    }

    /// Make the next read report end of stream.
    pub fn push_eof(&self) {
        self.push(Incoming::Eof);
    }

    /// Make the next read fail with `kind`.
    pub fn push_read_error(&self, kind: io::ErrorKind) {
        self.push(Incoming::Error(kind));
    }

    /// Make the next read panic inside the reading task.
    pub fn push_panic(&self) {
        self.push(Incoming::Panic);
    }

    /// Make every following write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    /// While set, writes block inside the device until released.
    pub fn hold_writes(&self, hold: bool) {
        self.state().hold_writes = hold;
        self.shared.changed.notify_all();
    }

    /// Block until a write is parked by [`MockPort::hold_writes`]. False on timeout.
    pub fn wait_write_held(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while state.held_writes == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Block until at least `len` bytes were written or `timeout` passes.
    pub fn wait_written(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        while state.written.len() < len {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.written.clone()
    }

    /// Whether any handle to the device is still open.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// How many times the device was fully released.
    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    /// Whether a read or write happened after one of the handles was released.
    pub fn used_after_close(&self) -> bool {
        self.state().use_after_close
    }

    fn push(&self, incoming: Incoming) {
        self.state().incoming.push_back(incoming);
        self.shared.changed.notify_all();
    }

    fn state(&self) -> MutexGuard<'_, PortState> {
        lock(&self.shared.state)
    }
}

struct MockDevice {
    port: MockPort,
    released: bool,
}

impl MockDevice {
    fn new(port: MockPort) -> Self {
        Self {
            port,
            released: false,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = self.port.state();
        state.released_any = true;
        state.handles = state.handles.saturating_sub(1);
        if state.handles == 0 {
            state.open = false;
            state.close_count += 1;
        }
        drop(state);
        self.port.shared.changed.notify_all();
    }
}

impl SerialDevice for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.port.state();
        if state.released_any {
            state.use_after_close = true;
        }

        let deadline = Instant::now() + state.read_timeout;
        let incoming = loop {
            if let Some(incoming) = state.incoming.pop_front() {
                break incoming;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            state = self
                .port
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        drop(state);

        match incoming {
            Incoming::Data(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let mut state = self.port.state();
                    state.incoming.push_front(Incoming::Data(data[n..].to_vec()));
                }
                Ok(n)
            }
            Incoming::Eof => Ok(0),
            Incoming::Error(kind) => Err(io::Error::new(kind, "scripted read failure")),
            Incoming::Panic => panic!("scripted device fault"),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.port.state();
        if state.released_any {
            state.use_after_close = true;
        }
        if state.hold_writes {
            state.held_writes += 1;
            self.port.shared.changed.notify_all();
            while state.hold_writes {
                state = self
                    .port
                    .shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.held_writes -= 1;
            // The write finishes after the wait, so a release during it is a violation.
            if state.released_any {
                state.use_after_close = true;
            }
        }
        if state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted write failure",
            ));
        }
        state.written.extend_from_slice(data);
        drop(state);
        self.port.shared.changed.notify_all();
        Ok(())
    }

    fn try_clone_device(&self) -> Result<Box<dyn SerialDevice>> {
        self.port.state().handles += 1;
        Ok(Box::new(MockDevice::new(self.port.clone())))
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
