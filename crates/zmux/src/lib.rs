//! Many ordered byte streams over one connection.
//!
//! zmux multiplexes independent, flow-controlled channels over a single
//! duplex transport such as a TCP or Unix socket. One side opens channels,
//! the other accepts them; each channel is a plain `Read + Write` stream.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix and TCP transports, endpoints, the `Duplex` split
//! - [`frame`]: The 7-byte frame header codec and blocking frame I/O
//! - [`session`]: Ring buffers, channels and the multiplexer engine
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::net::TcpStream;
//!
//! let mux = zmux::Mux::new(TcpStream::connect("127.0.0.1:7000")?)?;
//! let mut channel = mux.open()?;
//! channel.write_all(b"hello")?;
//! let mut reply = [0u8; 5];
//! channel.read_exact(&mut reply)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Re-export transport types.
pub mod transport {
    pub use zmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use zmux_frame::*;
}

/// Re-export session types.
pub mod session {
    pub use zmux_session::*;
}

pub use zmux_session::{Channel, Mux, MuxConfig, MuxError, Role, Termination};
