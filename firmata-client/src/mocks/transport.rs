use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::errors::Error;
use crate::errors::ProtocolError::{Disconnected, NotInitialized, Timeout};
use crate::io::IoTransport;

#[derive(Debug, Default)]
struct MockBuffers {
    /// Bytes sent by the "device", waiting to be read.
    incoming: VecDeque<u8>,
    /// Bytes written by the host.
    written: Vec<u8>,
    opened: bool,
    closed: bool,
    timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockState {
    buffers: Mutex<MockBuffers>,
    available: Condvar,
}

/// In-memory duplex transport: tests push device bytes and inspect host writes.
///
/// Clones share the same buffers.
#[derive(Clone, Debug, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes as if the device sent them.
    pub fn push(&self, bytes: &[u8]) {
        self.state.buffers.lock().incoming.extend(bytes);
        self.state.available.notify_all();
    }

    /// Everything the host wrote so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.buffers.lock().written.clone()
    }

    /// Everything the host wrote so far, clearing the record.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.buffers.lock().written)
    }

    /// Waits (up to one second) until the host wrote at least `len` bytes, then takes them all.
    pub async fn written_until(&self, len: usize) -> Vec<u8> {
        for _ in 0..200 {
            if self.state.buffers.lock().written.len() >= len {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.take_written()
    }

    /// Simulates the device vanishing: pending and future reads fail with `Disconnected`.
    pub fn disconnect(&self) {
        self.state.buffers.lock().closed = true;
        self.state.available.notify_all();
    }

    pub fn is_opened(&self) -> bool {
        let buffers = self.state.buffers.lock();
        buffers.opened && !buffers.closed
    }
}

impl Display for MockTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MockTransport")
    }
}

impl IoTransport for MockTransport {
    fn open(&mut self) -> Result<(), Error> {
        let mut buffers = self.state.buffers.lock();
        if buffers.closed {
            return Err(Disconnected.into());
        }
        buffers.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.disconnect();
        Ok(())
    }

    fn set_timeout(&mut self, duration: Duration) -> Result<(), Error> {
        self.state.buffers.lock().timeout = Some(duration);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let mut buffers = self.state.buffers.lock();
        if buffers.closed {
            return Err(Disconnected.into());
        }
        if !buffers.opened {
            return Err(NotInitialized.into());
        }
        buffers.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let mut buffers = self.state.buffers.lock();
        loop {
            if buffers.incoming.len() >= buf.len() {
                for byte in buf.iter_mut() {
                    *byte = buffers.incoming.pop_front().unwrap_or_default();
                }
                return Ok(());
            }
            if buffers.closed {
                return Err(Disconnected.into());
            }
            match buffers.timeout {
                Some(timeout) => {
                    if self
                        .state
                        .available
                        .wait_for(&mut buffers, timeout)
                        .timed_out()
                        && buffers.incoming.len() < buf.len()
                        && !buffers.closed
                    {
                        return Err(Timeout { operation: "io" }.into());
                    }
                }
                None => self.state.available.wait(&mut buffers),
            }
        }
    }
}
