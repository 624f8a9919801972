//! Frame codec for the zmux multiplexing protocol.
//!
//! Every frame starts with a fixed 7-byte header:
//! - A 1-byte frame kind (OPEN, ACCEPTED, PAYLOAD, CLOSE)
//! - A 2-byte little-endian channel ID
//! - A 4-byte little-endian payload length
//!
//! PAYLOAD frames are followed by exactly that many raw bytes; control frames
//! carry none. The codec is pure: buffering and routing live in
//! `zmux-session`.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_header, encode_header, Frame, FrameConfig, FrameKind, Header, DEFAULT_MAX_PAYLOAD,
    HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
