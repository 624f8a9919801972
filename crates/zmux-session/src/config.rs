use std::time::Duration;

use serde::{Deserialize, Serialize};
use zmux_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};

/// Default capacity of the shared send buffer, in bytes.
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 16 * 1024;

/// Default capacity of each channel's receive buffer, in bytes.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 1024;

/// Multiplexer tuning.
///
/// Zero sizes mean "use the default", so a partially filled config file
/// behaves like the defaults for everything it leaves out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Capacity of the send buffer shared by all channels.
    pub send_buffer_size: usize,
    /// Receive buffer capacity for channels opened or accepted without an
    /// explicit size.
    pub recv_buffer_size: usize,
    /// Largest PAYLOAD frame sent or accepted.
    pub max_payload_size: usize,
    /// Bound on how long `open`/`accept` wait for the other side.
    /// `None` waits forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            handshake_timeout_ms: None,
        }
    }
}

impl MuxConfig {
    /// Replace zero values with their defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.send_buffer_size == 0 {
            self.send_buffer_size = defaults.send_buffer_size;
        }
        if self.recv_buffer_size == 0 {
            self.recv_buffer_size = defaults.recv_buffer_size;
        }
        if self.max_payload_size == 0 {
            self.max_payload_size = defaults.max_payload_size;
        }
        if self.handshake_timeout_ms == Some(0) {
            self.handshake_timeout_ms = None;
        }
        self
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Per-call receive buffer size, falling back to the configured default.
    pub fn recv_buffer_or_default(&self, size: usize) -> usize {
        if size == 0 {
            self.recv_buffer_size
        } else {
            size
        }
    }

    pub(crate) fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_become_defaults() {
        let config = MuxConfig {
            send_buffer_size: 0,
            recv_buffer_size: 0,
            max_payload_size: 0,
            handshake_timeout_ms: Some(0),
        }
        .normalized();
        assert_eq!(config, MuxConfig::default());
    }

    #[test]
    fn explicit_values_survive_normalization() {
        let config = MuxConfig {
            send_buffer_size: 64,
            recv_buffer_size: 8,
            max_payload_size: 32,
            handshake_timeout_ms: Some(250),
        }
        .normalized();
        assert_eq!(config.send_buffer_size, 64);
        assert_eq!(config.recv_buffer_size, 8);
        assert_eq!(config.handshake_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn per_call_size_falls_back() {
        let config = MuxConfig::default();
        assert_eq!(config.recv_buffer_or_default(0), DEFAULT_RECV_BUFFER_SIZE);
        assert_eq!(config.recv_buffer_or_default(10), 10);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: MuxConfig = serde_json::from_str(r#"{"recv_buffer_size": 4096}"#).unwrap();
        assert_eq!(config.recv_buffer_size, 4096);
        assert_eq!(config.send_buffer_size, DEFAULT_SEND_BUFFER_SIZE);
        assert_eq!(config.handshake_timeout_ms, None);
    }

    #[test]
    fn serializes_without_unset_timeout() {
        let json = serde_json::to_value(MuxConfig::default()).unwrap();
        assert!(json.get("handshake_timeout_ms").is_none());
        assert_eq!(json["send_buffer_size"], DEFAULT_SEND_BUFFER_SIZE);
    }
}
