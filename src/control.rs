//! Session setup and teardown messages
//!
//! Control messages are self-describing maps of single-character keys to
//! integer scalars, so either peer can be upgraded without breaking the
//! other. The encoding itself is a capability injected at endpoint creation;
//! [`CborCodec`] is the built-in implementation.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::shared::{ErrorCode, SessionId};

/// `m`: discriminates the message kind
const KEY_MESSAGE_TYPE: u8 = b'm';
/// `i`: session identifier
const KEY_SESSION_ID: u8 = b'i';
/// `s`: object size in START, byte offset in RESUME
const KEY_SIZE: u8 = b's';
/// `b`: block size in bytes
const KEY_BLOCK_SIZE: u8 = b'b';
/// `w`: window size in blocks
const KEY_WINDOW_SIZE: u8 = b'w';
/// `t`: per-window timeout in milliseconds
const KEY_TIMEOUT: u8 = b't';
/// `r`: retransmit budget per window
const KEY_NUM_RETRANS: u8 = b'r';
/// `x`: session expiry in milliseconds
const KEY_SESSION_EXPIRY: u8 = b'x';
/// `e`: error code
const KEY_ERROR_CODE: u8 = b'e';

const MSG_START: u64 = 1;
const MSG_ABORT: u64 = 2;
const MSG_RESUME: u64 = 3;
const MSG_ACK: u64 = 5;

/// A session-level control message
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    /// Opens a transfer and fixes its parameters for the session's lifetime
    Start {
        session_id: SessionId,
        object_size: u64,
        block_size: u16,
        window_size: u16,
        timeout_ms: u16,
        max_retransmits: u16,
        expiry_ms: u32,
    },
    /// Terminates a session on both peers
    Abort {
        session_id: SessionId,
        error: ErrorCode,
    },
    /// Revives a timed-out session from the given window-aligned byte offset
    Resume { session_id: SessionId, offset: u64 },
    /// Session-setup-level acknowledgement; per-window ACKs use the binary
    /// ACK frame instead
    Ack {
        session_id: SessionId,
        error: ErrorCode,
    },
}

impl ControlMessage {
    pub fn session_id(&self) -> SessionId {
        match *self {
            Self::Start { session_id, .. }
            | Self::Abort { session_id, .. }
            | Self::Resume { session_id, .. }
            | Self::Ack { session_id, .. } => session_id,
        }
    }
}

/// Why a datagram could not be understood as a control message
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ControlDecodeError {
    #[error("truncated message")]
    UnexpectedEnd,
    #[error("not a key-value map of integer scalars")]
    Malformed,
    #[error("unknown message type {0}")]
    UnknownType(u64),
    #[error("missing required field `{0}`")]
    MissingField(char),
    #[error("field `{0}` out of range")]
    IllegalValue(char),
}

/// Pluggable encoding for control messages
///
/// The core never names a concrete encoding; an implementation is injected
/// through [`EndpointConfig`](crate::EndpointConfig). Implementations must be
/// deterministic and must reject anything they would not themselves produce.
pub trait ControlCodec: Send + Sync {
    fn encode(&self, msg: &ControlMessage, buf: &mut BytesMut);
    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, ControlDecodeError>;
}

/// The built-in control encoding: a CBOR map of one-character text keys to
/// unsigned integers
///
/// Only the subset of CBOR this protocol needs is implemented (major types
/// 0, 3 and 5); unknown keys with well-formed scalar values are skipped for
/// forward compatibility.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

const MAJOR_UINT: u8 = 0;
const MAJOR_TEXT: u8 = 3;
const MAJOR_MAP: u8 = 5;

fn put_head(buf: &mut BytesMut, major: u8, value: u64) {
    let major = major << 5;
    if value < 24 {
        buf.put_u8(major | value as u8);
    } else if value <= u64::from(u8::MAX) {
        buf.put_u8(major | 24);
        buf.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        buf.put_u8(major | 25);
        buf.put_u16(value as u16);
    } else if value <= u64::from(u32::MAX) {
        buf.put_u8(major | 26);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(major | 27);
        buf.put_u64(value);
    }
}

fn put_entry(buf: &mut BytesMut, key: u8, value: u64) {
    put_head(buf, MAJOR_TEXT, 1);
    buf.put_u8(key);
    put_head(buf, MAJOR_UINT, value);
}

fn get_head(buf: &mut impl Buf) -> Result<(u8, u64), ControlDecodeError> {
    use ControlDecodeError::*;
    if !buf.has_remaining() {
        return Err(UnexpectedEnd);
    }
    let initial = buf.get_u8();
    let major = initial >> 5;
    let argument = match initial & 0x1f {
        small @ 0..=23 => u64::from(small),
        24 if buf.remaining() >= 1 => u64::from(buf.get_u8()),
        25 if buf.remaining() >= 2 => u64::from(buf.get_u16()),
        26 if buf.remaining() >= 4 => u64::from(buf.get_u32()),
        27 if buf.remaining() >= 8 => buf.get_u64(),
        24..=27 => return Err(UnexpectedEnd),
        _ => return Err(Malformed),
    };
    Ok((major, argument))
}

impl ControlCodec for CborCodec {
    fn encode(&self, msg: &ControlMessage, buf: &mut BytesMut) {
        match *msg {
            ControlMessage::Start {
                session_id,
                object_size,
                block_size,
                window_size,
                timeout_ms,
                max_retransmits,
                expiry_ms,
            } => {
                put_head(buf, MAJOR_MAP, 8);
                put_entry(buf, KEY_MESSAGE_TYPE, MSG_START);
                put_entry(buf, KEY_SESSION_ID, u64::from(session_id.0));
                put_entry(buf, KEY_SIZE, object_size);
                put_entry(buf, KEY_BLOCK_SIZE, u64::from(block_size));
                put_entry(buf, KEY_WINDOW_SIZE, u64::from(window_size));
                put_entry(buf, KEY_TIMEOUT, u64::from(timeout_ms));
                put_entry(buf, KEY_NUM_RETRANS, u64::from(max_retransmits));
                put_entry(buf, KEY_SESSION_EXPIRY, u64::from(expiry_ms));
            }
            ControlMessage::Abort { session_id, error } => {
                put_head(buf, MAJOR_MAP, 3);
                put_entry(buf, KEY_MESSAGE_TYPE, MSG_ABORT);
                put_entry(buf, KEY_SESSION_ID, u64::from(session_id.0));
                put_entry(buf, KEY_ERROR_CODE, u64::from(error.to_wire()));
            }
            ControlMessage::Resume { session_id, offset } => {
                put_head(buf, MAJOR_MAP, 3);
                put_entry(buf, KEY_MESSAGE_TYPE, MSG_RESUME);
                put_entry(buf, KEY_SESSION_ID, u64::from(session_id.0));
                put_entry(buf, KEY_SIZE, offset);
            }
            ControlMessage::Ack { session_id, error } => {
                put_head(buf, MAJOR_MAP, 3);
                put_entry(buf, KEY_MESSAGE_TYPE, MSG_ACK);
                put_entry(buf, KEY_SESSION_ID, u64::from(session_id.0));
                put_entry(buf, KEY_ERROR_CODE, u64::from(error.to_wire()));
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<ControlMessage, ControlDecodeError> {
        use ControlDecodeError::*;
        let mut buf = bytes;
        let (major, entries) = get_head(&mut buf)?;
        if major != MAJOR_MAP {
            return Err(Malformed);
        }

        let mut fields = Fields::default();
        for _ in 0..entries {
            let (major, len) = get_head(&mut buf)?;
            if major != MAJOR_TEXT || len != 1 {
                return Err(Malformed);
            }
            if !buf.has_remaining() {
                return Err(UnexpectedEnd);
            }
            let key = buf.get_u8();
            let (major, value) = get_head(&mut buf)?;
            if major != MAJOR_UINT {
                return Err(Malformed);
            }
            fields.insert(key, value);
        }
        if buf.has_remaining() {
            return Err(Malformed);
        }

        let session_id = SessionId(fields.require(KEY_SESSION_ID)?.bounded(KEY_SESSION_ID)?);
        match fields.require(KEY_MESSAGE_TYPE)? {
            MSG_START => Ok(ControlMessage::Start {
                session_id,
                object_size: fields.require(KEY_SIZE)?,
                block_size: fields.require(KEY_BLOCK_SIZE)?.bounded(KEY_BLOCK_SIZE)?,
                window_size: fields.require(KEY_WINDOW_SIZE)?.bounded(KEY_WINDOW_SIZE)?,
                timeout_ms: fields.require(KEY_TIMEOUT)?.bounded(KEY_TIMEOUT)?,
                max_retransmits: fields.require(KEY_NUM_RETRANS)?.bounded(KEY_NUM_RETRANS)?,
                expiry_ms: fields
                    .require(KEY_SESSION_EXPIRY)?
                    .bounded(KEY_SESSION_EXPIRY)?,
            }),
            MSG_ABORT => Ok(ControlMessage::Abort {
                session_id,
                error: error_code(&fields)?,
            }),
            MSG_RESUME => Ok(ControlMessage::Resume {
                session_id,
                offset: fields.require(KEY_SIZE)?,
            }),
            MSG_ACK => Ok(ControlMessage::Ack {
                session_id,
                error: error_code(&fields)?,
            }),
            other => Err(UnknownType(other)),
        }
    }
}

fn error_code(fields: &Fields) -> Result<ErrorCode, ControlDecodeError> {
    let raw: u8 = fields.require(KEY_ERROR_CODE)?.bounded(KEY_ERROR_CODE)?;
    Ok(ErrorCode::from_wire(raw))
}

/// Values seen for the known keys; unknown keys are dropped on insert
#[derive(Debug, Default)]
struct Fields {
    values: [Option<u64>; KEYS.len()],
}

const KEYS: [u8; 9] = [
    KEY_MESSAGE_TYPE,
    KEY_SESSION_ID,
    KEY_SIZE,
    KEY_BLOCK_SIZE,
    KEY_WINDOW_SIZE,
    KEY_TIMEOUT,
    KEY_NUM_RETRANS,
    KEY_SESSION_EXPIRY,
    KEY_ERROR_CODE,
];

impl Fields {
    fn insert(&mut self, key: u8, value: u64) {
        if let Some(i) = KEYS.iter().position(|&k| k == key) {
            self.values[i] = Some(value);
        }
    }

    fn require(&self, key: u8) -> Result<u64, ControlDecodeError> {
        let i = KEYS.iter().position(|&k| k == key).unwrap();
        self.values[i].ok_or(ControlDecodeError::MissingField(key as char))
    }
}

trait Bounded<T> {
    fn bounded(self, key: u8) -> Result<T, ControlDecodeError>;
}

impl<T: TryFrom<u64>> Bounded<T> for u64 {
    fn bounded(self, key: u8) -> Result<T, ControlDecodeError> {
        T::try_from(self).map_err(|_| ControlDecodeError::IllegalValue(key as char))
    }
}
