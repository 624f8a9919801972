use std::io::{Read, Write};
use std::net::TcpStream;

use crate::error::Result;

/// A connection that can be split into independently owned halves.
///
/// The multiplexer moves the read half into its receive loop and the write
/// half into its send loop, so both halves must be `Send + 'static`.
pub trait Duplex: Send + 'static {
    /// Half used exclusively for reading.
    type Reader: Read + Send + 'static;
    /// Half used exclusively for writing.
    type Writer: Write + Send + 'static;

    /// Split the connection into its read and write halves.
    fn split(self) -> Result<(Self::Reader, Self::Writer)>;
}

/// A connected Unix or TCP stream.
///
/// This is the fundamental I/O type returned by [`crate::Listener`] and
/// [`crate::Endpoint::connect`].
pub struct MuxStream {
    inner: MuxStreamInner,
}

enum MuxStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for MuxStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            MuxStreamInner::Unix(stream) => stream.read(buf),
            MuxStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for MuxStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            MuxStreamInner::Unix(stream) => stream.write(buf),
            MuxStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            MuxStreamInner::Unix(stream) => stream.flush(),
            MuxStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl MuxStream {
    /// Wrap a Unix domain socket stream.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: MuxStreamInner::Unix(stream),
        }
    }

    /// Wrap a TCP stream.
    ///
    /// Nagle's algorithm is disabled: frames are small and latency-sensitive.
    pub fn from_tcp(stream: TcpStream) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, "failed to set TCP_NODELAY");
        }
        Self {
            inner: MuxStreamInner::Tcp(stream),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            MuxStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            MuxStreamInner::Tcp(stream) => Ok(Self {
                inner: MuxStreamInner::Tcp(stream.try_clone()?),
            }),
        }
    }

    /// Shut down both directions of the connection.
    ///
    /// Any thread blocked reading from a clone of this stream observes EOF.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            MuxStreamInner::Unix(stream) => stream
                .shutdown(std::net::Shutdown::Both)
                .map_err(Into::into),
            MuxStreamInner::Tcp(stream) => stream
                .shutdown(std::net::Shutdown::Both)
                .map_err(Into::into),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            MuxStreamInner::Unix(_) => "unix-domain-socket",
            MuxStreamInner::Tcp(_) => "tcp",
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

impl Duplex for MuxStream {
    type Reader = MuxStream;
    type Writer = MuxStream;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        let reader = self.try_clone()?;
        Ok((reader, self))
    }
}

impl Duplex for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        let reader = self.try_clone()?;
        Ok((reader, self))
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    type Reader = std::os::unix::net::UnixStream;
    type Writer = std::os::unix::net::UnixStream;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        let reader = self.try_clone()?;
        Ok((reader, self))
    }
}

/// Pre-split halves, e.g. stdin/stdout or in-memory test doubles.
impl<R, W> Duplex for (R, W)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    type Reader = R;
    type Writer = W;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        Ok(self)
    }
}
