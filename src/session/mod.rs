use std::time::Instant;

pub(crate) mod recv;
pub(crate) mod send;
pub(crate) mod timer;

use recv::RecvSession;
use send::SendSession;

use crate::shared::SessionId;

/// A live transfer, either direction
///
/// Send and receive sessions share an identity and timers but diverge
/// completely in body, so they are two variants rather than one struct with
/// a discriminant.
#[derive(Debug)]
pub(crate) enum Session {
    Send(SendSession),
    Recv(RecvSession),
}

impl Session {
    pub(crate) fn id(&self) -> SessionId {
        match self {
            Self::Send(s) => s.id(),
            Self::Recv(r) => r.id(),
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        match self {
            Self::Send(s) => s.is_terminal(),
            Self::Recv(r) => r.is_terminal(),
        }
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        match self {
            Self::Send(s) => s.timers.next_timeout(),
            Self::Recv(r) => r.timers.next_timeout(),
        }
    }

    pub(crate) fn poll_expired(&mut self, now: Instant) -> Option<timer::Timer> {
        match self {
            Self::Send(s) => s.timers.poll_expired(now),
            Self::Recv(r) => r.timers.poll_expired(now),
        }
    }
}
