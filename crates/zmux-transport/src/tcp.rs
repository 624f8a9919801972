use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::MuxStream;

/// TCP listener.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on a TCP address such as `127.0.0.1:7000`.
    ///
    /// Port `0` picks an ephemeral port; see [`TcpTransport::local_addr`].
    pub fn bind(addr: &str) -> Result<Self> {
        let bind_err = |source: std::io::Error| TransportError::Bind {
            endpoint: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<MuxStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted tcp connection");
        Ok(MuxStream::from_tcp(stream))
    }

    /// Connect to a listening TCP endpoint (blocking).
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<MuxStream> {
        let stream = TcpStream::connect(&addr).map_err(|source| TransportError::Connect {
            endpoint: addr.to_string(),
            source,
        })?;
        debug!(%addr, "connected over tcp");
        Ok(MuxStream::from_tcp(stream))
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
