//! Reliable, windowed, block-oriented transport for bounded-size objects over
//! datagram links whose MTU is too small to carry an application payload in
//! one piece. The canonical deployment is a Bluetooth Low Energy GATT pipe
//! between a constrained device and a companion gateway, but the design is
//! link-agnostic.
//!
//! The sender splits an object of known length into fixed-size blocks and
//! transmits them a window at a time; the receiver accumulates blocks in a
//! per-window bitmap and acknowledges each window either wholesale
//! (zero-length bitmap: advance) or selectively (bitmap of missing block
//! numbers: resend these). Block numbers are taken modulo twice the window
//! size so a retransmitted block from one window can never be mistaken for a
//! fresh block of the next.
//!
//! ## Wire format
//!
//! Every datagram carries exactly one frame. Data frame:
//!
//! ```text
//! 0..2  session id    (u16 LE)
//! 2..4  block number  (u16 LE)
//! 4     flags         bits 7..5 reserved pattern, bit 1 RESUME, bit 0 LAST
//! 5..   block payload
//! ```
//!
//! ACK frame:
//!
//! ```text
//! 0..2  session id          (u16 LE)
//! 2     error code          (0 = success, nonzero = peer-reported fatal)
//! 3..5  first block number  (u16 LE) of the window being acknowledged
//! 5..   missing-blocks bitmap; empty acknowledges the whole window
//! ```
//!
//! Session setup and teardown ride on self-describing key-value control
//! messages (START, ABORT, RESUME, ACK) whose encoding is pluggable; see
//! [`ControlCodec`]. The default [`CborCodec`] encodes a CBOR map of
//! single-character keys to unsigned integers.
//!
//! ## Architecture
//!
//! [`Endpoint`] is the sans-IO core: it performs no I/O and keeps no clock.
//! It consumes inbound datagrams ([`Endpoint::handle_datagram`]) and timer
//! expirations ([`Endpoint::handle_timeout`]), and produces outbound
//! datagrams ([`Endpoint::poll_transmit`]) and application events
//! ([`Endpoint::poll`]). The host drives it from whatever runtime it has.
//!
//! [`Context`] is a thin serialized wrapper for hosts that prefer a
//! callback-style API: it binds a [`DatagramLink`] and application callbacks
//! to an endpoint behind one mutex, so inbound datagrams, timer expirations
//! and API calls are dispatched one at a time.

mod bitmap;
mod coding;
mod config;
mod context;
mod control;
mod endpoint;
mod frame;
mod session;
mod shared;

#[cfg(test)]
mod tests;

pub use crate::config::{ConfigError, EndpointConfig, SessionParams, MAX_WINDOW_SIZE};
pub use crate::context::{BlockHandler, Context, DatagramLink, EventHandler};
pub use crate::control::{CborCodec, ControlCodec, ControlDecodeError, ControlMessage};
pub use crate::endpoint::{AbortError, DestroyError, Endpoint, ResumeError, SendError};
pub use crate::shared::{
    ErrorCode, Event, SessionHandle, SessionId, Side, TransferError, Transmit, TransmitKind,
};

/// Bytes of overhead a data frame adds to each block payload
pub const DATA_FRAME_OVERHEAD: u16 = frame::DATA_HEADER_LEN as u16;
