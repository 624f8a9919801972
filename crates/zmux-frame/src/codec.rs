use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: kind (1) + channel (2) + length (4) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame kinds understood by this protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Request a new channel. Channel field is 0.
    Open = 0,
    /// Acknowledge an OPEN with the assigned channel id.
    Accepted = 1,
    /// Channel data; followed by `payload_len` bytes.
    Payload = 2,
    /// The sender will neither read nor write this channel again.
    Close = 3,
}

impl FrameKind {
    /// Human-readable name, used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Open => "OPEN",
            FrameKind::Accepted => "ACCEPTED",
            FrameKind::Payload => "PAYLOAD",
            FrameKind::Close => "CLOSE",
        }
    }

    /// Control frames never carry a payload.
    pub fn is_control(self) -> bool {
        self != FrameKind::Payload
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Open),
            1 => Ok(FrameKind::Accepted),
            2 => Ok(FrameKind::Payload),
            3 => Ok(FrameKind::Close),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    pub channel: u16,
    pub payload_len: u32,
}

impl Header {
    /// OPEN header (channel not yet assigned).
    pub fn open() -> Self {
        Self {
            kind: FrameKind::Open,
            channel: 0,
            payload_len: 0,
        }
    }

    /// ACCEPTED header carrying the assigned channel id.
    pub fn accepted(channel: u16) -> Self {
        Self {
            kind: FrameKind::Accepted,
            channel,
            payload_len: 0,
        }
    }

    /// CLOSE header for a channel.
    pub fn close(channel: u16) -> Self {
        Self {
            kind: FrameKind::Close,
            channel,
            payload_len: 0,
        }
    }

    /// PAYLOAD header announcing `len` bytes on `channel`.
    pub fn payload(channel: u16, len: usize) -> Result<Self> {
        let payload_len = u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        })?;
        Ok(Self {
            kind: FrameKind::Payload,
            channel,
            payload_len,
        })
    }

    /// Encode into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut dst = &mut out[..];
        dst.put_u8(self.kind as u8);
        dst.put_u16_le(self.channel);
        dst.put_u32_le(self.payload_len);
        out
    }

    /// The total wire size of the frame this header introduces.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// A complete frame: header plus (possibly empty) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

/// Encode a header into the wire format.
///
/// Wire format:
/// ```text
/// ┌───────────┬────────────┬──────────────┬──────────────────┐
/// │ Kind (1B) │ Channel    │ Length       │ Payload          │
/// │ 0..=3     │ (2B LE)    │ (4B LE)      │ (PAYLOAD only)   │
/// └───────────┴────────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_header(header: &Header, dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE);
    dst.put_slice(&header.to_bytes());
}

/// Decode a header from the front of `src`.
///
/// Returns `Ok(None)` if fewer than [`HEADER_SIZE`] bytes are available.
/// Does not consume anything; the caller advances past the header.
pub fn decode_header(src: &[u8]) -> Result<Option<Header>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut buf = &src[..HEADER_SIZE];
    let kind = FrameKind::try_from(buf.get_u8())?;
    let channel = buf.get_u16_le();
    let payload_len = buf.get_u32_le();

    if kind.is_control() && payload_len != 0 {
        return Err(FrameError::UnexpectedPayload {
            kind: kind.name(),
            len: payload_len,
        });
    }
    if kind == FrameKind::Open && channel != 0 {
        return Err(FrameError::UnexpectedChannel(channel));
    }

    Ok(Some(Header {
        kind,
        channel,
        payload_len,
    }))
}

/// Configuration for frame decoding.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest PAYLOAD accepted from the wire. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
