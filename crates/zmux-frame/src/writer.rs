use std::io::{ErrorKind, Write};

use bytes::{BufMut, BytesMut};

use crate::codec::{encode_header, Frame, Header};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
///
/// The multiplexer itself never goes through a `FrameWriter`: channels
/// enqueue encoded frames into the shared send buffer instead. This type is
/// for speaking the protocol directly, e.g. from a minimal peer or a test.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Write a complete frame (blocking).
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() != frame.header.payload_len as usize {
            return Err(FrameError::LengthMismatch {
                declared: frame.header.payload_len,
                actual: frame.payload.len(),
            });
        }
        self.write_parts(&frame.header, frame.payload.as_ref())
    }

    /// Encode and send a PAYLOAD frame on a channel.
    pub fn send(&mut self, channel: u16, payload: &[u8]) -> Result<()> {
        let header = Header::payload(channel, payload.len())?;
        self.write_parts(&header, payload)
    }

    /// Send an OPEN frame.
    pub fn open(&mut self) -> Result<()> {
        self.write_parts(&Header::open(), &[])
    }

    /// Send an ACCEPTED frame for `channel`.
    pub fn accepted(&mut self, channel: u16) -> Result<()> {
        self.write_parts(&Header::accepted(channel), &[])
    }

    /// Send a CLOSE frame for `channel`.
    pub fn close(&mut self, channel: u16) -> Result<()> {
        self.write_parts(&Header::close(channel), &[])
    }

    fn write_parts(&mut self, header: &Header, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_header(header, &mut self.buf);
        self.buf.put_slice(payload);

        let mut offset = 0usize;
        while offset < self.buf.len() {
            match self.inner.write(&self.buf[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
