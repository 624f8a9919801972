use std::io::{self, ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_header, Frame, FrameConfig, Header, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Reads frame headers (and optionally payloads) from any `Read` stream.
///
/// The reader never consumes more than it has to: after
/// [`read_header`](Self::read_header) the stream is positioned exactly at the
/// first payload byte, so the payload can be moved elsewhere through
/// [`payload`](Self::payload) without intermediate buffering.
pub struct FrameReader<T> {
    inner: T,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Read the next header (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached, either
    /// cleanly between frames or in the middle of a header.
    pub fn read_header(&mut self) -> Result<Header> {
        let mut raw = [0u8; HEADER_SIZE];
        let mut filled = 0usize;
        while filled < HEADER_SIZE {
            match self.inner.read(&mut raw[filled..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        let header = decode_header(&raw)?.ok_or(FrameError::ConnectionClosed)?;
        let len = header.payload_len as usize;
        if len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.config.max_payload_size,
            });
        }
        Ok(header)
    }

    /// Bounded reader over the next `len` payload bytes.
    ///
    /// Reads past `len` return EOF, so handing this to a buffer that reads
    /// "until end of source" can never swallow the next header.
    pub fn payload(&mut self, len: u32) -> io::Take<&mut T> {
        (&mut self.inner).take(u64::from(len))
    }

    /// Consume and drop `len` payload bytes.
    pub fn skip_payload(&mut self, len: u32) -> Result<()> {
        let mut payload = self.payload(len);
        io::copy(&mut payload, &mut io::sink())?;
        if payload.limit() != 0 {
            return Err(FrameError::ConnectionClosed);
        }
        Ok(())
    }

    /// Read a whole frame, payload included, into memory.
    pub fn read_frame(&mut self) -> Result<Frame> {
        let header = self.read_header()?;
        let mut payload = BytesMut::zeroed(header.payload_len as usize);
        self.inner.read_exact(&mut payload).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(err)
            }
        })?;
        Ok(Frame {
            header,
            payload: payload.freeze(),
        })
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_header, FrameKind};

    fn payload_frame(channel: u16, payload: &[u8]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        encode_header(&Header::payload(channel, payload.len()).unwrap(), &mut wire);
        wire.put_slice(payload);
        wire.to_vec()
    }

    #[test]
    fn read_control_headers() {
        let mut wire = BytesMut::new();
        encode_header(&Header::open(), &mut wire);
        encode_header(&Header::accepted(42), &mut wire);

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        assert_eq!(reader.read_header().unwrap(), Header::open());
        assert_eq!(reader.read_header().unwrap(), Header::accepted(42));
        assert!(matches!(
            reader.read_header(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn payload_reader_is_bounded() {
        let mut wire = payload_frame(3, b"first");
        wire.extend(payload_frame(4, b"second"));

        let mut reader = FrameReader::new(Cursor::new(wire));
        let header = reader.read_header().unwrap();
        assert_eq!(header.kind, FrameKind::Payload);

        let mut out = Vec::new();
        reader
            .payload(header.payload_len)
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"first");

        let next = reader.read_frame().unwrap();
        assert_eq!(next.header.channel, 4);
        assert_eq!(next.payload.as_ref(), b"second");
    }

    #[test]
    fn skip_payload_discards_exactly() {
        let mut wire = payload_frame(1, b"drop me");
        wire.extend(payload_frame(2, b"keep"));

        let mut reader = FrameReader::new(Cursor::new(wire));
        let header = reader.read_header().unwrap();
        reader.skip_payload(header.payload_len).unwrap();

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"keep");
    }

    #[test]
    fn skip_payload_detects_truncation() {
        let mut wire = payload_frame(1, b"truncated");
        wire.truncate(HEADER_SIZE + 3);

        let mut reader = FrameReader::new(Cursor::new(wire));
        let header = reader.read_header().unwrap();
        assert!(matches!(
            reader.skip_payload(header.payload_len),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: payload_frame(4, b"slow"),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.header.channel, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_mid_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x02, 0x01]));
        let err = reader.read_header().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_payload() {
        let mut wire = payload_frame(2, b"only-part-of-it");
        wire.truncate(HEADER_SIZE + 4);

        let mut reader = FrameReader::new(Cursor::new(wire));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn unknown_kind_in_stream() {
        let mut reader = FrameReader::new(Cursor::new(vec![0x7F, 0, 0, 0, 0, 0, 0]));
        let err = reader.read_header().unwrap_err();
        assert!(matches!(err, FrameError::UnknownKind(0x7F)));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut wire = BytesMut::new();
        encode_header(&Header::payload(1, 1024).unwrap(), &mut wire);

        let cfg = FrameConfig {
            max_payload_size: 16,
        };
        let mut reader = FrameReader::with_config(Cursor::new(wire.to_vec()), cfg);
        let err = reader.read_header().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 1024, max: 16 }));
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(payload_frame(8, b"ok")),
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.header.channel, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn would_block_propagates_io_error() {
        let mut reader = FrameReader::new(WouldBlockReader);
        let err = reader.read_header().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    #[cfg(unix)]
    fn roundtrip_over_socket_pair() {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send(1, b"ping").unwrap();
        writer.close(1).unwrap();

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.header.channel, 1);
        assert_eq!(frame.payload.as_ref(), b"ping");
        assert_eq!(reader.read_header().unwrap(), Header::close(1));
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(reader.config().max_payload_size, crate::DEFAULT_MAX_PAYLOAD);
        let _ = reader.get_ref();
        let _ = reader.get_mut();
        let _inner = reader.into_inner();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }

    struct WouldBlockReader;

    impl Read for WouldBlockReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }
}
