use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use tracing::trace;
use zmux_frame::{FrameError, Header};

use crate::error::{MuxError, Result};
use crate::mux::Shared;
use crate::ring::{lock, RingBuffer};

#[derive(Debug, Default)]
struct Closure {
    local: bool,
    remote: bool,
}

/// Per-channel state shared between the public handle and the receive loop.
pub(crate) struct ChannelCore {
    pub(crate) id: u16,
    pub(crate) recv: RingBuffer,
    /// Held while enqueueing frames for this channel; `true` once CLOSE is queued.
    write_gate: Mutex<bool>,
    closure: Mutex<Closure>,
}

impl ChannelCore {
    pub(crate) fn new(id: u16, recv_buffer_size: usize) -> Self {
        Self {
            id,
            recv: RingBuffer::new(recv_buffer_size),
            write_gate: Mutex::new(false),
            closure: Mutex::new(Closure::default()),
        }
    }

    pub(crate) fn is_locally_closed(&self) -> bool {
        lock(&self.closure).local
    }

    pub(crate) fn is_remotely_closed(&self) -> bool {
        lock(&self.closure).remote
    }

    /// Record the peer's CLOSE. Returns `true` once both sides have closed.
    pub(crate) fn mark_remote_closed(&self) -> bool {
        let mut closure = lock(&self.closure);
        closure.remote = true;
        self.recv.close();
        closure.local
    }

    /// Record our own CLOSE. Returns `true` once both sides have closed.
    fn mark_local_closed(&self) -> bool {
        let mut closure = lock(&self.closure);
        closure.local = true;
        self.recv.close();
        closure.remote
    }

    /// Queue a CLOSE frame for this channel, at most once.
    ///
    /// Returns `Ok(false)` if the channel was already closed locally.
    pub(crate) fn close(&self, shared: &Shared) -> Result<bool> {
        let enqueued = {
            let mut gate = lock(&self.write_gate);
            if *gate {
                return Ok(false);
            }
            *gate = true;
            shared.enqueue_control(Header::close(self.id))
        };

        if self.mark_local_closed() {
            shared.remove_channel(self.id);
        }
        enqueued.map(|()| true)
    }
}

/// One logical byte stream carried over a [`Mux`](crate::Mux).
///
/// Reads return bytes the peer wrote on the same channel, in order. Writes
/// are framed and queued on the shared send buffer. Dropping the handle
/// closes the channel.
///
/// `Channel` is `Sync`: one thread may read while another writes. Both
/// [`io::Read`] and [`io::Write`] are implemented for `Channel` and
/// `&Channel`.
pub struct Channel {
    core: Arc<ChannelCore>,
    shared: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(core: Arc<ChannelCore>, shared: Arc<Shared>) -> Self {
        Self { core, shared }
    }

    /// Channel id shared by both endpoints.
    pub fn id(&self) -> u16 {
        self.core.id
    }

    /// Read received bytes into `buf`.
    ///
    /// Blocks until data arrives. `Ok(0)` means the peer closed the channel
    /// and everything it sent has been read. If the multiplexer stops first,
    /// the termination cause is returned instead.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.core.is_locally_closed() {
            return Err(MuxError::ChannelClosed(self.core.id));
        }
        let n = self
            .core
            .recv
            .read(buf)
            .map_err(|_| self.shared.terminal_error())?;
        if n == 0 && !buf.is_empty() {
            if self.core.is_locally_closed() {
                return Err(MuxError::ChannelClosed(self.core.id));
            }
            if !self.core.is_remotely_closed() {
                if let Some(cause) = self.shared.termination() {
                    return Err(MuxError::Terminated(cause));
                }
            }
        }
        Ok(n)
    }

    /// Send `data` to the peer as one PAYLOAD frame.
    ///
    /// Blocks while the send buffer is full. Returns `data.len()` on success.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let max = self.shared.config().max_payload_size;
        if data.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: data.len(),
                max,
            }
            .into());
        }
        let header = Header::payload(self.core.id, data.len())?;

        let gate = lock(&self.core.write_gate);
        if *gate || self.core.is_remotely_closed() {
            return Err(MuxError::ChannelClosed(self.core.id));
        }
        self.shared
            .send_buffer()
            .write_parts(&[&header.to_bytes(), data])
            .map_err(|_| self.shared.terminal_error())?;
        drop(gate);

        trace!(channel = self.core.id, len = data.len(), "payload queued");
        Ok(data.len())
    }

    /// Close the channel in both directions.
    ///
    /// The peer reads end-of-stream after the data already sent. Pending
    /// received data is discarded. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.core.close(&self.shared)? {
            trace!(channel = self.core.id, "channel closed locally");
        }
        Ok(())
    }

    /// Whether either side has closed this channel.
    pub fn is_closed(&self) -> bool {
        self.core.is_locally_closed() || self.core.is_remotely_closed()
    }

    /// Bytes received but not yet read.
    pub fn buffered(&self) -> usize {
        self.core.recv.len()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.core.close(&self.shared) {
            trace!(channel = self.core.id, error = %err, "close on drop failed");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.core.id)
            .field("buffered", &self.core.recv.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Channel::read(self, buf).map_err(io::Error::from)
    }
}

impl Read for &Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Channel::read(*self, buf).map_err(io::Error::from)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(*self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
