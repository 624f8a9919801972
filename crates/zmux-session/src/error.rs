use std::io::{self, ErrorKind};
use std::time::Duration;

use zmux_frame::FrameError;

/// Why a multiplexer stopped. Recorded once; later causes are ignored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Termination {
    /// [`Mux::close`](crate::Mux::close) was called or the mux was dropped.
    #[error("multiplexer closed")]
    Closed,

    /// The peer closed the transport.
    #[error("transport closed by peer")]
    TransportClosed,

    /// Reading from or writing to the transport failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer sent something this protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Termination {
    /// Whether this is an abnormal stop rather than a requested one.
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::Transport(_) | Termination::Protocol(_))
    }
}

impl From<&FrameError> for Termination {
    fn from(err: &FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => Termination::TransportClosed,
            FrameError::Io(io) => Termination::Transport(io.to_string()),
            other => Termination::Protocol(other.to_string()),
        }
    }
}

/// Errors that can occur in multiplexer and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] zmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The multiplexer has stopped; carries the reason it stopped.
    #[error("multiplexer terminated: {0}")]
    Terminated(Termination),

    /// A handshake did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The channel was closed locally, or the peer closed it before a write.
    #[error("channel {0} is closed")]
    ChannelClosed(u16),

    /// Every channel id is in use.
    #[error("no free channel id")]
    ChannelIdsExhausted,

    /// One endpoint may open channels or accept them, never both.
    #[error("cannot {attempted}: this multiplexer already acts as the {role}")]
    RoleConflict {
        role: &'static str,
        attempted: &'static str,
    },
}

impl MuxError {
    /// The termination cause, if this error reports a stopped multiplexer.
    pub fn termination(&self) -> Option<&Termination> {
        match self {
            MuxError::Terminated(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        let kind = match &err {
            MuxError::Timeout(_) => ErrorKind::TimedOut,
            MuxError::ChannelClosed(_) => ErrorKind::BrokenPipe,
            MuxError::Terminated(Termination::Closed) => ErrorKind::NotConnected,
            MuxError::Terminated(_) => ErrorKind::ConnectionAborted,
            MuxError::Frame(FrameError::PayloadTooLarge { .. }) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
