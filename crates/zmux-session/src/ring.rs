use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// Errors raised by [`RingBuffer`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The buffer was closed; no more bytes will be accepted.
    #[error("buffer closed")]
    Closed,

    /// The sink or source on the other side of a transfer failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for ring buffer operations.
pub type BufferResult<T> = std::result::Result<T, BufferError>;

/// Largest run of bytes moved between the ring and a transport per I/O call.
const TRANSFER_CHUNK: usize = 64 * 1024;

struct RingState {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
    closed: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Occupied bytes as `(offset, len)` pairs, oldest first.
    fn filled_segments(&self) -> [(usize, usize); 2] {
        let first = self.len.min(self.capacity() - self.start);
        [(self.start, first), (0, self.len - first)]
    }

    /// Free space as `(offset, len)` pairs, in write order.
    fn free_segments(&self) -> [(usize, usize); 2] {
        let end = (self.start + self.len) % self.capacity();
        let free = self.free();
        let first = free.min(self.capacity() - end);
        [(end, first), (0, free - first)]
    }

    fn consume(&mut self, n: usize) {
        self.start = (self.start + n) % self.capacity();
        self.len -= n;
    }

    fn copy_in(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let [(offset, len), _] = self.free_segments();
        let first = n.min(len);
        self.buf[offset..offset + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.len += n;
        n
    }

    fn copy_out(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len);
        let [(offset, len), _] = self.filled_segments();
        let first = n.min(len);
        out[..first].copy_from_slice(&self.buf[offset..offset + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.consume(n);
        n
    }
}

/// Bounded, blocking byte FIFO shared between threads.
///
/// Writers block while the buffer is full, readers block while it is empty.
/// Every blocking wait ends when the buffer is closed: pending data can still
/// be read out afterwards, then reads report end-of-stream with `Ok(0)` and
/// writes fail with [`BufferError::Closed`].
///
/// Concurrent writers are serialized for the whole duration of a write, so the
/// bytes of one [`write_parts`](Self::write_parts) call are contiguous in the
/// buffer even when the call has to wait for space several times. Readers are
/// serialized the same way.
///
/// Transport I/O in [`drain_to`](Self::drain_to) and
/// [`fill_from`](Self::fill_from) never runs under the state lock, so a
/// stalled transport cannot hold up [`close`](Self::close) or the other side
/// of the buffer.
pub struct RingBuffer {
    state: Mutex<RingState>,
    changed: Condvar,
    /// Writer exclusion. Owns the staging chunk used by `fill_from`.
    writer: Mutex<Vec<u8>>,
    /// Reader exclusion. Owns the staging chunk used by `drain_to`.
    reader: Mutex<Vec<u8>>,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
                start: 0,
                len: 0,
                closed: false,
            }),
            changed: Condvar::new(),
            writer: Mutex::new(Vec::new()),
            reader: Mutex::new(Vec::new()),
        }
    }

    /// Copy up to `out.len()` buffered bytes into `out`.
    ///
    /// Blocks until at least one byte is available. Returns `Ok(0)` once the
    /// buffer is closed and drained, or immediately if `out` is empty.
    pub fn read(&self, out: &mut [u8]) -> BufferResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let _reader = lock(&self.reader);
        let mut state = self.wait_for_data(lock(&self.state));
        if state.len == 0 {
            return Ok(0);
        }
        let n = state.copy_out(out);
        self.changed.notify_all();
        Ok(n)
    }

    /// Append all of `data`, blocking for space as needed.
    pub fn write(&self, data: &[u8]) -> BufferResult<usize> {
        self.write_parts(&[data])
    }

    /// Append each part in order as one uninterrupted run of bytes.
    ///
    /// Fails with [`BufferError::Closed`] if the buffer is closed before every
    /// byte has been accepted.
    pub fn write_parts(&self, parts: &[&[u8]]) -> BufferResult<usize> {
        let _writer = lock(&self.writer);
        let mut state = lock(&self.state);
        let mut written = 0usize;
        for part in parts {
            let mut rest = *part;
            while !rest.is_empty() {
                state = self.wait_for_space(state)?;
                let n = state.copy_in(rest);
                rest = &rest[n..];
                written += n;
                self.changed.notify_all();
            }
        }
        Ok(written)
    }

    /// Hand the buffered bytes to `sink`, oldest first.
    ///
    /// Blocks until data is available, then writes what is buffered at that
    /// moment (both halves when the data wraps around, at most
    /// `TRANSFER_CHUNK` bytes). Returns the number of bytes transferred, or
    /// `Ok(0)` once the buffer is closed and drained. Bytes the sink accepted
    /// before failing are still consumed.
    ///
    /// Writers keep appending while the sink is busy.
    pub fn drain_to<W: Write + ?Sized>(&self, sink: &mut W) -> BufferResult<usize> {
        let mut staging = lock(&self.reader);
        {
            let state = self.wait_for_data(lock(&self.state));
            if state.len == 0 {
                return Ok(0);
            }
            staging.clear();
            let mut budget = TRANSFER_CHUNK;
            for (offset, len) in state.filled_segments() {
                let take = len.min(budget);
                staging.extend_from_slice(&state.buf[offset..offset + take]);
                budget -= take;
            }
        }

        let mut drained = 0usize;
        let mut outcome = Ok(());
        while drained < staging.len() {
            match sink.write(&staging[drained..]) {
                Ok(0) => {
                    outcome = Err(io::Error::from(ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => drained += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }

        // Only the holder of `reader` consumes, so the staged bytes are still
        // the oldest ones in the buffer.
        if drained > 0 {
            lock(&self.state).consume(drained);
            self.changed.notify_all();
        }
        outcome?;
        Ok(drained)
    }

    /// Pull bytes from `source` into the buffer until `source` is exhausted.
    ///
    /// Blocks for space as needed and commits each chunk as soon as it
    /// arrives, so readers see bytes before the source is exhausted.
    /// `source` is typically bounded, e.g. a [`Read::take`] over one frame
    /// payload. Fails with [`BufferError::Closed`] if the buffer is closed
    /// first; the bytes not yet pulled are left in `source`.
    pub fn fill_from<R: Read + ?Sized>(&self, source: &mut R) -> BufferResult<usize> {
        let mut staging = lock(&self.writer);
        let mut filled = 0usize;
        loop {
            let room = self.wait_for_space(lock(&self.state))?.free();
            staging.resize(room.min(TRANSFER_CHUNK), 0);
            let n = match source.read(&mut staging[..]) {
                Ok(0) => return Ok(filled),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(BufferError::Io(err)),
            };

            // Only the holder of `writer` adds bytes, so the space seen above
            // is still free.
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BufferError::Closed);
            }
            state.copy_in(&staging[..n]);
            drop(state);
            filled += n;
            self.changed.notify_all();
        }
    }

    /// Close the buffer and wake every blocked reader and writer.
    ///
    /// Idempotent. Bytes already buffered remain readable.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        drop(state);
        self.changed.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Number of bytes currently buffered.
    pub fn len(&self) -> usize {
        lock(&self.state).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity()
    }

    fn wait_for_data<'a>(&self, mut state: MutexGuard<'a, RingState>) -> MutexGuard<'a, RingState> {
        while state.len == 0 && !state.closed {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state
    }

    fn wait_for_space<'a>(
        &self,
        mut state: MutexGuard<'a, RingState>,
    ) -> BufferResult<MutexGuard<'a, RingState>> {
        loop {
            if state.closed {
                return Err(BufferError::Closed);
            }
            if state.free() > 0 {
                return Ok(state);
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RingBuffer")
            .field("capacity", &state.capacity())
            .field("len", &state.len)
            .field("closed", &state.closed)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
