/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header carries a frame kind this protocol version does not define.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),

    /// A control frame announced a payload.
    #[error("{kind} frame must not carry a payload (got {len} bytes)")]
    UnexpectedPayload { kind: &'static str, len: u32 },

    /// An OPEN frame named a channel; ids are assigned by the acceptor.
    #[error("OPEN frame must not name a channel (got {0})")]
    UnexpectedChannel(u16),

    /// A frame's payload does not match the length its header declares.
    #[error("payload length mismatch (header says {declared} bytes, got {actual})")]
    LengthMismatch { declared: u32, actual: usize },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for errors that mean the peer broke the framing contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::UnknownKind(_)
                | FrameError::UnexpectedPayload { .. }
                | FrameError::UnexpectedChannel(_)
                | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
