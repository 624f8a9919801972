//! Duplex byte-stream transports for zmux.
//!
//! The multiplexer needs nothing more than an ordered, reliable byte stream
//! that can be split into an owned read half and an owned write half. This
//! crate provides that abstraction ([`Duplex`]) together with the concrete
//! streams zmux ships with:
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! Everything above this crate is transport-agnostic.

pub mod endpoint;
pub mod error;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use endpoint::{Endpoint, Listener};
pub use error::{Result, TransportError};
pub use tcp::TcpTransport;
pub use traits::{Duplex, MuxStream};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
