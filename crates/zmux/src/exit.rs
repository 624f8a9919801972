use std::fmt;
use std::io;

use zmux_session::{MuxError, Termination};
use zmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::NotFound
        | io::ErrorKind::AddrInUse => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
    }
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    match err {
        MuxError::Transport(err) => transport_error(context, err),
        MuxError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        MuxError::Frame(_) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        MuxError::Terminated(Termination::Protocol(_)) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        MuxError::Terminated(_) | MuxError::ChannelClosed(_) => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        MuxError::ChannelIdsExhausted | MuxError::RoleConflict { .. } => {
            CliError::new(INTERNAL, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn mux_errors_map_to_exit_codes() {
        assert_eq!(
            mux_error("open", MuxError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            mux_error(
                "read",
                MuxError::Terminated(Termination::Protocol("bad kind".into()))
            )
            .code,
            DATA_INVALID
        );
        assert_eq!(
            mux_error("read", MuxError::Terminated(Termination::TransportClosed)).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let err = TransportError::Connect {
            endpoint: "tcp:127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        let cli = transport_error("connect failed", err);
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("connect failed: "));
    }

    #[test]
    fn bad_endpoint_is_usage() {
        let err = TransportError::InvalidEndpoint("nope".into());
        assert_eq!(transport_error("parse", err).code, USAGE);
    }
}
