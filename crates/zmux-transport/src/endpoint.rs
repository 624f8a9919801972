use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::tcp::TcpTransport;
use crate::traits::MuxStream;
#[cfg(unix)]
use crate::uds::UnixDomainSocket;

/// Where to listen or connect.
///
/// Accepted forms:
/// - `unix:/run/app.sock`
/// - `tcp:127.0.0.1:7000`
/// - `127.0.0.1:7000` (anything with a port and no path separator)
/// - `/run/app.sock`, `./app.sock` (anything that looks like a path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            return unix_endpoint(s, path);
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return tcp_endpoint(s, addr);
        }
        if s.contains('/') || s.starts_with('.') {
            return unix_endpoint(s, s);
        }
        tcp_endpoint(s, s)
    }
}

#[cfg(unix)]
fn unix_endpoint(raw: &str, path: &str) -> Result<Endpoint> {
    if path.is_empty() {
        return Err(TransportError::InvalidEndpoint(raw.to_string()));
    }
    Ok(Endpoint::Unix(PathBuf::from(path)))
}

#[cfg(not(unix))]
fn unix_endpoint(raw: &str, _path: &str) -> Result<Endpoint> {
    Err(TransportError::InvalidEndpoint(raw.to_string()))
}

fn tcp_endpoint(raw: &str, addr: &str) -> Result<Endpoint> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !valid {
        return Err(TransportError::InvalidEndpoint(raw.to_string()));
    }
    Ok(Endpoint::Tcp(addr.to_string()))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

impl Endpoint {
    /// Connect to this endpoint (blocking).
    pub fn connect(&self) -> Result<MuxStream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixDomainSocket::connect(path),
            Endpoint::Tcp(addr) => TcpTransport::connect(addr.as_str()),
        }
    }

    /// Bind a listener on this endpoint.
    pub fn bind(&self) -> Result<Listener> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Listener::Unix(UnixDomainSocket::bind(path)?)),
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpTransport::bind(addr)?)),
        }
    }
}

/// A bound listener of either transport kind.
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpTransport),
}

impl Listener {
    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<MuxStream> {
        match self {
            #[cfg(unix)]
            Listener::Unix(socket) => socket.accept(),
            Listener::Tcp(socket) => socket.accept(),
        }
    }

    /// The endpoint this listener is actually bound to.
    ///
    /// For TCP this resolves an ephemeral port to the real one.
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            #[cfg(unix)]
            Listener::Unix(socket) => Endpoint::Unix(socket.path().to_path_buf()),
            Listener::Tcp(socket) => Endpoint::Tcp(socket.local_addr().to_string()),
        }
    }
}
