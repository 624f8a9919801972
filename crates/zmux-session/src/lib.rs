//! Channel multiplexing over a single duplex byte stream.
//!
//! A [`Mux`] runs two background loops over one transport and hands out
//! [`Channel`]s: independent, ordered byte streams with their own flow
//! control. One endpoint opens channels, the other accepts them.

pub mod channel;
pub mod config;
pub mod error;
mod lifecycle;
pub mod mux;
pub mod ring;

pub use channel::Channel;
pub use config::{MuxConfig, DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SEND_BUFFER_SIZE};
pub use error::{MuxError, Result, Termination};
pub use mux::{Mux, Role};
pub use ring::{BufferError, BufferResult, RingBuffer};
