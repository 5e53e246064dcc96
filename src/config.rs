use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::control::{CborCodec, ControlCodec};
use crate::frame::DATA_HEADER_LEN;

/// Largest permitted window, in blocks
///
/// Twice the window size must fit a 16-bit block number, since block numbers
/// are taken modulo `2 * window_size`.
pub const MAX_WINDOW_SIZE: u16 = 16_384;

/// Parameters fixed at session setup and immutable for the session's lifetime
///
/// The sender picks them; the receiver learns them from the START message.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionParams {
    /// Payload bytes per block; a data frame occupies `block_size + 5` bytes
    /// on the link
    pub block_size: u16,
    /// Blocks transmitted before stopping to await an acknowledgement
    pub window_size: u16,
    /// Round-trip budget for one window; the sender retransmits after twice
    /// this, the receiver coalesces ACKs over it
    pub timeout: Duration,
    /// Full-window retransmissions allowed before the session fails
    pub max_retransmits: u16,
    /// Wall-clock budget for the whole session
    pub session_expiry: Duration,
}

impl SessionParams {
    /// Parameters sized for a link that accepts datagrams of `mtu` bytes
    pub fn for_mtu(mtu: u16) -> Self {
        Self {
            block_size: mtu.saturating_sub(DATA_HEADER_LEN as u16),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size == 0 {
            return Err(ConfigError::IllegalValue("block_size must be nonzero"));
        }
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::IllegalValue(
                "window_size must be in 1..=16384",
            ));
        }
        if self.timeout.is_zero() || self.timeout.as_millis() > u128::from(u16::MAX) {
            return Err(ConfigError::IllegalValue(
                "timeout must be nonzero and fit 16 bits of milliseconds",
            ));
        }
        if self.session_expiry < self.timeout
            || self.session_expiry.as_millis() > u128::from(u32::MAX)
        {
            return Err(ConfigError::IllegalValue(
                "session_expiry must be at least the timeout and fit 32 bits of milliseconds",
            ));
        }
        Ok(())
    }

    /// Block numbers wrap at twice the window size
    pub(crate) fn max_blocks(&self) -> u16 {
        2 * self.window_size
    }

    /// Bytes in the wire bitmap covering one modular cycle of block numbers
    pub(crate) fn bitmap_len(&self) -> usize {
        (usize::from(self.max_blocks()) + 7) / 8
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        // Tuned for a BLE 4.2+ connection with the 247-byte data-length
        // extension; one window in flight per connection interval pair.
        Self {
            block_size: 242,
            window_size: 16,
            timeout: Duration::from_millis(500),
            max_retransmits: 4,
            session_expiry: Duration::from_secs(60),
        }
    }
}

/// Global configuration for an endpoint, affecting all sessions
#[derive(Clone)]
pub struct EndpointConfig {
    /// Concurrent outgoing transfers admitted before `send` is refused
    pub max_send_sessions: usize,
    /// Concurrent incoming transfers admitted before inbound STARTs are
    /// dropped
    pub max_recv_sessions: usize,
    /// Upper bound on one receive session's window buffer
    /// (`window_size * block_size`); a START asking for more is refused with
    /// a NO_MEMORY acknowledgement
    pub max_receive_buffer: usize,
    /// Encoding used for control messages
    pub control_codec: Arc<dyn ControlCodec>,
}

impl EndpointConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_sessions == 0 && self.max_recv_sessions == 0 {
            return Err(ConfigError::IllegalValue(
                "at least one session slot is required",
            ));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_send_sessions: 2,
            max_recv_sessions: 2,
            max_receive_buffer: 64 * 1024,
            control_codec: Arc::new(CborCodec),
        }
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("max_send_sessions", &self.max_send_sessions)
            .field("max_recv_sessions", &self.max_recv_sessions)
            .field("max_receive_buffer", &self.max_receive_buffer)
            .finish_non_exhaustive()
    }
}

/// Errors in endpoint or session configuration
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error("illegal configuration value: {0}")]
    IllegalValue(&'static str),
}
