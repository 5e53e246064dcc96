use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::shared::SessionId;

/// Fixed header of a data frame: session id, block number, flags
pub(crate) const DATA_HEADER_LEN: usize = 5;
/// Fixed header of an ACK frame: session id, error code, first block number
pub(crate) const ACK_HEADER_LEN: usize = 5;
/// Anything shorter cannot carry a session id and is dropped unexamined
pub(crate) const MIN_DATAGRAM_LEN: usize = 3;

/// Flag bits 7..5 must carry this pattern; anything else is not one of ours
const RESERVED_PATTERN: u8 = 0b1010_0000;
const RESERVED_MASK: u8 = 0b1110_0000;
/// Bits 4..2 are unassigned and must be zero
const UNASSIGNED_MASK: u8 = 0b0001_1100;
const FLAG_RESUME: u8 = 0x02;
const FLAG_LAST: u8 = 0x01;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub(crate) enum FrameDecodeError {
    #[error("truncated frame")]
    UnexpectedEnd,
    #[error("reserved flag bits violated")]
    ReservedBits,
    #[error("frame length inconsistent with session window size")]
    LengthMismatch,
}

impl From<UnexpectedEnd> for FrameDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

/// One block of the object, as carried in a single datagram
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct DataFrame {
    pub(crate) session_id: SessionId,
    pub(crate) block_number: u16,
    /// First block emitted after a session-level resume
    pub(crate) resume: bool,
    /// Terminal block of the object
    pub(crate) last: bool,
    pub(crate) payload: Bytes,
}

impl DataFrame {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.write(self.session_id);
        buf.write(self.block_number);
        let mut flags = RESERVED_PATTERN;
        if self.resume {
            flags |= FLAG_RESUME;
        }
        if self.last {
            flags |= FLAG_LAST;
        }
        buf.write(flags);
        buf.put_slice(&self.payload);
    }

    pub(crate) fn decode(mut bytes: Bytes) -> Result<Self, FrameDecodeError> {
        let session_id = bytes.get::<SessionId>()?;
        let block_number = bytes.get::<u16>()?;
        let flags = bytes.get::<u8>()?;
        if flags & RESERVED_MASK != RESERVED_PATTERN || flags & UNASSIGNED_MASK != 0 {
            return Err(FrameDecodeError::ReservedBits);
        }
        Ok(Self {
            session_id,
            block_number,
            resume: flags & FLAG_RESUME != 0,
            last: flags & FLAG_LAST != 0,
            payload: bytes,
        })
    }
}

/// Acknowledgement for the receiver's current window
///
/// Names the window it describes by that window's first block number, so the
/// sender can discard acknowledgements lingering from a window it already
/// advanced past, including link-duplicated copies of the acknowledgement
/// that moved it forward. An empty bitmap acknowledges the window outright
/// and tells the sender to advance. A nonzero bitmap has one bit per block
/// number of the `2 * window_size` modular cycle (LSB-first within each
/// byte); a set bit means that block was not received and must be resent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct AckFrame {
    pub(crate) session_id: SessionId,
    pub(crate) error_code: u8,
    /// First block number of the window this acknowledgement describes
    pub(crate) first_block_number: u16,
    /// Empty to acknowledge the whole window
    pub(crate) bitmap: Bytes,
}

impl AckFrame {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.write(self.session_id);
        buf.write(self.error_code);
        buf.write(self.first_block_number);
        buf.put_slice(&self.bitmap);
    }

    /// Decode an ACK addressed to a session whose bitmap occupies
    /// `bitmap_len` bytes
    ///
    /// The frame must be exactly header-sized (full-window ACK) or carry a
    /// complete bitmap; anything else contradicts the session's negotiated
    /// window size.
    pub(crate) fn decode(mut bytes: Bytes, bitmap_len: usize) -> Result<Self, FrameDecodeError> {
        if bytes.len() != ACK_HEADER_LEN && bytes.len() != ACK_HEADER_LEN + bitmap_len {
            return Err(FrameDecodeError::LengthMismatch);
        }
        let session_id = bytes.get::<SessionId>()?;
        let error_code = bytes.get::<u8>()?;
        let first_block_number = bytes.get::<u16>()?;
        Ok(Self {
            session_id,
            error_code,
            first_block_number,
            bitmap: bytes,
        })
    }

    /// Whether bit `block_number` is set in the missing-blocks bitmap
    pub(crate) fn is_missing(&self, block_number: u16) -> bool {
        let byte = usize::from(block_number) / 8;
        match self.bitmap.as_ref().get(byte) {
            Some(b) => b >> (block_number % 8) & 1 != 0,
            None => false,
        }
    }
}

/// Session id of a datagram that might be a data or ACK frame
///
/// Control messages do not share this layout; the demultiplexer falls back to
/// control parsing when the extracted id matches no live session or the frame
/// fails to decode.
pub(crate) fn peek_session_id(datagram: &[u8]) -> Option<SessionId> {
    let bytes: [u8; 2] = datagram.get(..2)?.try_into().ok()?;
    Some(SessionId(u16::from_le_bytes(bytes)))
}
