use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// Protocol-level identifier for a transfer session
///
/// Each peer allocates identifiers for the sessions it initiates from its own
/// half of the 16-bit space (see [`Side`]), so two peers transferring in both
/// directions at once can never collide.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(pub u16);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Which half of the session-id space this endpoint allocates from
///
/// One side of a link must be constructed as `Client` and the other as
/// `Server`; which is which is a property of the link (e.g. GATT central vs
/// peripheral). Client-initiated sessions carry odd identifiers,
/// server-initiated sessions even ones.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// Allocates odd session identifiers
    Client = 0,
    /// Allocates even session identifiers
    Server = 1,
}

impl std::ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Externally-stable handle to a session owned by an [`Endpoint`](crate::Endpoint)
///
/// Remains valid until the session is destroyed; never dangles into a reused
/// slot because slots are only vacated by explicit destruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionHandle(pub usize);

impl From<SessionHandle> for usize {
    fn from(x: SessionHandle) -> Self {
        x.0
    }
}

/// Error codes carried on the wire in ACK frames and ABORT messages
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    Success,
    SessionNotFound,
    SessionFound,
    SessionAborted,
    SessionTimedOut,
    InvalidParam,
    NoMemory,
    NetworkError,
    InternalError,
    /// A code this implementation does not know; preserved verbatim
    Unknown(u8),
}

impl ErrorCode {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::SessionNotFound => 1,
            Self::SessionFound => 2,
            Self::SessionAborted => 3,
            Self::SessionTimedOut => 4,
            Self::InvalidParam => 5,
            Self::NoMemory => 6,
            Self::NetworkError => 7,
            Self::InternalError => 8,
            Self::Unknown(x) => x,
        }
    }

    pub(crate) fn from_wire(x: u8) -> Self {
        match x {
            0 => Self::Success,
            1 => Self::SessionNotFound,
            2 => Self::SessionFound,
            3 => Self::SessionAborted,
            4 => Self::SessionTimedOut,
            5 => Self::InvalidParam,
            6 => Self::NoMemory,
            7 => Self::NetworkError,
            8 => Self::InternalError,
            x => Self::Unknown(x),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(x) => write!(f, "unknown({x})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Reasons a session stopped making progress
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum TransferError {
    /// The peer reported a fatal error or aborted the session
    #[error("peer reported: {0}")]
    Peer(ErrorCode),
    /// The per-window retransmit budget was exhausted; the sender may resume
    #[error("retransmit budget exhausted")]
    TimedOut,
    /// The session outlived its wall-clock expiry budget
    #[error("session expired")]
    Expired,
    /// The link refused a datagram the session cannot make progress without
    #[error("network send failed")]
    Network,
    /// The application aborted the session
    #[error("aborted by application")]
    Aborted,
}

/// Things the application cares about
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer opened a transfer toward us; blocks will follow
    ReceiveStarted {
        session: SessionHandle,
        total_size: u64,
    },
    /// An in-order slice of the incoming object
    ///
    /// Offsets are strictly ascending and contiguous from 0 through
    /// `total_size`.
    Block {
        session: SessionHandle,
        offset: u64,
        data: Bytes,
        total_size: u64,
    },
    /// The incoming object was delivered in full
    ReceiveComplete { session: SessionHandle },
    /// The incoming transfer died
    ReceiveFailed {
        session: SessionHandle,
        error: TransferError,
    },
    /// The peer acknowledged the whole object
    SendComplete { session: SessionHandle },
    /// The retransmit budget ran out; `resume` may revive the session
    SendTimedOut { session: SessionHandle },
    /// The outgoing transfer died
    SendFailed {
        session: SessionHandle,
        error: TransferError,
    },
}

/// What kind of frame an outbound datagram carries
///
/// The driving layer needs this to apply the failure policy when the link
/// refuses a datagram. A lost data frame is transient because the
/// retransmit machinery recovers it. A lost ACK deadlocks its receive
/// session and is fatal there, as is a lost control message for a live send
/// session; once a session is terminal, control losses no longer matter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransmitKind {
    Data,
    Ack,
    Control,
}

/// An outbound datagram, ready for the link
#[derive(Debug, Clone)]
pub struct Transmit {
    /// Session the datagram belongs to
    pub session_id: SessionId,
    pub kind: TransmitKind,
    pub contents: Bytes,
}

/// Outbound datagrams and application events accumulated by session logic
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) transmits: VecDeque<Transmit>,
    pub(crate) events: VecDeque<Event>,
}

impl Pending {
    pub(crate) fn transmit(&mut self, session_id: SessionId, kind: TransmitKind, contents: Bytes) {
        self.transmits.push_back(Transmit {
            session_id,
            kind,
            contents,
        });
    }

    pub(crate) fn event(&mut self, event: Event) {
        self.events.push_back(event);
    }
}
