use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{ConfigError, EndpointConfig, SessionParams};
use crate::control::{ControlCodec, ControlMessage};
use crate::frame::{self, AckFrame, DataFrame};
use crate::session::recv::RecvSession;
use crate::session::send::SendSession;
use crate::session::Session;
use crate::shared::{
    ErrorCode, Event, Pending, SessionHandle, SessionId, Side, Transmit, TransmitKind,
};

/// The main entry point to the library
///
/// This object performs no I/O whatsoever. It consumes inbound datagrams via
/// [`handle_datagram`](Self::handle_datagram) and timer expirations via
/// [`handle_timeout`](Self::handle_timeout), and produces outbound datagrams
/// via [`poll_transmit`](Self::poll_transmit) and application events via
/// [`poll`](Self::poll). After any call that takes `now`, the host should
/// re-arm its wakeup from [`next_timeout`](Self::next_timeout) and drain both
/// queues.
///
/// All session state lives here; sessions are addressed by small stable
/// [`SessionHandle`]s and vacated only by explicit destruction, so a handle
/// can never silently come to name a different session.
pub struct Endpoint {
    side: Side,
    config: EndpointConfig,
    codec: Arc<dyn ControlCodec>,
    sessions: Slab<Session>,
    send_ids: FxHashMap<SessionId, SessionHandle>,
    recv_ids: FxHashMap<SessionId, SessionHandle>,
    /// Cursor through this side's half of the id space
    next_session_id: u16,
    pending: Pending,
}

impl Endpoint {
    /// Create an endpoint for one side of a link
    ///
    /// Returns `Err` if the configuration is invalid.
    pub fn new(config: EndpointConfig, side: Side) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = StdRng::from_os_rng();
        Ok(Self::with_seed_id(config, side, rng.random()))
    }

    fn with_seed_id(config: EndpointConfig, side: Side, seed: u16) -> Self {
        // Client-initiated sessions are odd, server-initiated even; the
        // starting point within the half-space is random so sessions from a
        // restarted peer are unlikely to collide with stale state.
        let next_session_id = match side {
            Side::Client => seed | 1,
            Side::Server => seed & !1,
        };
        Self {
            side,
            codec: config.control_codec.clone(),
            config,
            sessions: Slab::new(),
            send_ids: FxHashMap::default(),
            recv_ids: FxHashMap::default(),
            next_session_id,
            pending: Pending::default(),
        }
    }

    /// Which half of the id space this endpoint allocates from
    pub fn side(&self) -> Side {
        self.side
    }

    /// Initiate sending `object` to the peer
    ///
    /// Emits the START message and the first window of blocks immediately;
    /// the transfer then progresses through
    /// [`handle_datagram`](Self::handle_datagram) and
    /// [`handle_timeout`](Self::handle_timeout). Completion or failure is
    /// reported through [`poll`](Self::poll).
    ///
    /// The object is borrowed by reference count: the caller must not assume
    /// the memory is released until the session is destroyed.
    pub fn send(
        &mut self,
        now: Instant,
        object: Bytes,
        params: SessionParams,
    ) -> Result<SessionHandle, SendError> {
        params.validate()?;
        if object.is_empty() {
            return Err(SendError::EmptyObject);
        }
        if self.send_ids.len() >= self.config.max_send_sessions {
            return Err(SendError::MaxSessionsReached);
        }
        let id = self.alloc_session_id().ok_or(SendError::MaxSessionsReached)?;

        let entry = self.sessions.vacant_entry();
        let handle = SessionHandle(entry.key());
        let mut session = SendSession::new(id, handle, object, params, now);
        session.start(now, &*self.codec, &mut self.pending);
        entry.insert(Session::Send(session));
        self.send_ids.insert(id, handle);
        Ok(handle)
    }

    /// Process an inbound datagram
    ///
    /// Malformed or unroutable datagrams are dropped silently; no reply is
    /// sent to an unknown session id, the peer will time out.
    pub fn handle_datagram(&mut self, now: Instant, datagram: Bytes) {
        if datagram.len() < frame::MIN_DATAGRAM_LEN {
            trace!("dropping {}-byte datagram, too short for any frame", datagram.len());
            return;
        }

        // A data or ACK frame leads with the session id; route to the session
        // if one matches, otherwise try the datagram as a control message.
        // (Control messages have their own framing, so an id extracted from
        // one is garbage, but garbage that misses both tables.)
        if let Some(id) = frame::peek_session_id(&datagram) {
            if let Some(&handle) = self.send_ids.get(&id) {
                let Some(Session::Send(session)) = self.sessions.get_mut(handle.0) else {
                    unreachable!("send id map points at a send session");
                };
                match AckFrame::decode(datagram.clone(), session.bitmap_len()) {
                    Ok(ack) => {
                        session.handle_ack(&ack, now, &mut self.pending);
                        return;
                    }
                    Err(e) => trace!(%id, "not an ACK frame ({e}), trying control"),
                }
            } else if let Some(&handle) = self.recv_ids.get(&id) {
                let Some(Session::Recv(session)) = self.sessions.get_mut(handle.0) else {
                    unreachable!("recv id map points at a receive session");
                };
                match DataFrame::decode(datagram.clone()) {
                    Ok(data) => {
                        session.handle_data(&data, now, &mut self.pending);
                        return;
                    }
                    Err(e) => trace!(%id, "not a data frame ({e}), trying control"),
                }
            }
        }

        let msg = match self.codec.decode(&datagram) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("dropping unroutable datagram: {e}");
                return;
            }
        };
        self.handle_control(now, msg);
    }

    fn handle_control(&mut self, now: Instant, msg: ControlMessage) {
        let codec = self.codec.clone();
        let id = msg.session_id();
        match msg {
            ControlMessage::Start {
                object_size,
                block_size,
                window_size,
                timeout_ms,
                max_retransmits,
                expiry_ms,
                ..
            } => {
                let params = SessionParams {
                    block_size,
                    window_size,
                    timeout: Duration::from_millis(u64::from(timeout_ms)),
                    max_retransmits,
                    session_expiry: Duration::from_millis(u64::from(expiry_ms)),
                };
                self.handle_start(now, id, object_size, params);
            }
            ControlMessage::Abort { error, .. } => {
                let Some(handle) = self.handle_for_id(id) else {
                    trace!(%id, "dropping ABORT for unknown session");
                    return;
                };
                match &mut self.sessions[handle.0] {
                    Session::Send(s) => s.handle_abort(error, &mut self.pending),
                    Session::Recv(r) => r.handle_abort(error, &mut self.pending),
                }
            }
            ControlMessage::Resume { offset, .. } => {
                // Only the receiving half of a transfer can serve a resume
                match self.recv_ids.get(&id).copied() {
                    Some(handle) => {
                        let Some(Session::Recv(session)) = self.sessions.get_mut(handle.0) else {
                            unreachable!("recv id map points at a receive session");
                        };
                        session.handle_resume(offset, now, &*codec, &mut self.pending);
                    }
                    None => trace!(%id, "dropping RESUME for unknown session"),
                }
            }
            ControlMessage::Ack { error, .. } => {
                match self.send_ids.get(&id).copied() {
                    Some(handle) => {
                        let Some(Session::Send(session)) = self.sessions.get_mut(handle.0) else {
                            unreachable!("send id map points at a send session");
                        };
                        session.handle_control_ack(error, &mut self.pending);
                    }
                    None => trace!(%id, "dropping control ACK for unknown session"),
                }
            }
        }
    }

    /// Admission control for inbound STARTs
    fn handle_start(&mut self, now: Instant, id: SessionId, object_size: u64, params: SessionParams) {
        if self.send_ids.contains_key(&id) || self.recv_ids.contains_key(&id) {
            // Either a retransmitted START for a session we already admitted,
            // or an id colliding with state that has not been destroyed yet.
            // Identifiers must not be reused while any state bearing them
            // exists, so the START is not honored either way.
            trace!(%id, "dropping START for known session id");
            return;
        }
        if self.recv_ids.len() >= self.config.max_recv_sessions {
            debug!(%id, "no free receive session slot, dropping START");
            return;
        }
        if params.validate().is_err() || object_size == 0 {
            debug!(%id, "refusing START with invalid parameters");
            self.control_ack(id, ErrorCode::InvalidParam);
            return;
        }
        let buffer_len = usize::from(params.window_size) * usize::from(params.block_size);
        if buffer_len > self.config.max_receive_buffer {
            debug!(%id, buffer_len, "refusing START, window buffer too large");
            self.control_ack(id, ErrorCode::NoMemory);
            return;
        }

        let entry = self.sessions.vacant_entry();
        let handle = SessionHandle(entry.key());
        entry.insert(Session::Recv(RecvSession::new(
            id,
            handle,
            object_size,
            params,
            now,
        )));
        self.recv_ids.insert(id, handle);
        debug!(%id, object_size, "admitted incoming transfer");
        self.pending.event(Event::ReceiveStarted {
            session: handle,
            total_size: object_size,
        });
    }

    /// Abort a session; synchronous, best-effort toward the peer
    pub fn abort(&mut self, handle: SessionHandle) -> Result<(), AbortError> {
        let codec = self.codec.clone();
        let session = self.sessions.get_mut(handle.0).ok_or(AbortError::NotFound)?;
        if session.is_terminal() {
            return Err(AbortError::Terminal);
        }
        match session {
            Session::Send(s) => s.abort(&*codec, &mut self.pending),
            Session::Recv(r) => r.abort(&*codec, &mut self.pending),
        }
        Ok(())
    }

    /// Resume a send session that failed by timing out
    pub fn resume(&mut self, now: Instant, handle: SessionHandle) -> Result<(), ResumeError> {
        let codec = self.codec.clone();
        match self.sessions.get_mut(handle.0) {
            None => Err(ResumeError::NotFound),
            Some(Session::Recv(_)) => Err(ResumeError::NotResumable),
            Some(Session::Send(session)) => {
                if !session.is_resumable() {
                    return Err(ResumeError::NotResumable);
                }
                session.resume(now, &*codec, &mut self.pending);
                Ok(())
            }
        }
    }

    /// Release a terminal session's state and identifier
    ///
    /// Until this is called the session's id stays reserved, so a peer
    /// cannot open a fresh session under an identifier we still have state
    /// for.
    pub fn destroy_session(&mut self, handle: SessionHandle) -> Result<(), DestroyError> {
        let session = self.sessions.get(handle.0).ok_or(DestroyError::NotFound)?;
        if !session.is_terminal() {
            return Err(DestroyError::SessionInProgress);
        }
        let session = self.sessions.remove(handle.0);
        match &session {
            Session::Send(_) => self.send_ids.remove(&session.id()),
            Session::Recv(_) => self.recv_ids.remove(&session.id()),
        };
        trace!(id = %session.id(), "session destroyed");
        Ok(())
    }

    /// Whether every session is in a terminal phase
    pub fn is_idle(&self) -> bool {
        self.sessions.iter().all(|(_, s)| s.is_terminal())
    }

    /// The driving layer failed to hand a transmit to the link
    ///
    /// Applies the failure policy: data loss is transient, ACK loss is fatal
    /// to its receive session, control loss is fatal to a live send session.
    pub fn handle_transmit_error(&mut self, session_id: SessionId, kind: TransmitKind) {
        let Some(handle) = self.handle_for_id(session_id) else {
            return;
        };
        match &mut self.sessions[handle.0] {
            Session::Send(s) => s.handle_transmit_error(kind, &mut self.pending),
            Session::Recv(r) => r.handle_transmit_error(kind, &mut self.pending),
        }
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// has work to do
    pub fn next_timeout(&self) -> Option<Instant> {
        self.sessions
            .iter()
            .filter_map(|(_, s)| s.next_timeout())
            .min()
    }

    /// Fire every timer with a deadline at or before `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let codec = self.codec.clone();
        // Sessions are neither created nor removed by timer handling, so the
        // key snapshot stays valid.
        let keys: Vec<usize> = self.sessions.iter().map(|(k, _)| k).collect();
        for key in keys {
            while let Some(timer) = self.sessions[key].poll_expired(now) {
                match &mut self.sessions[key] {
                    Session::Send(s) => s.handle_timeout(timer, now, &*codec, &mut self.pending),
                    Session::Recv(r) => r.handle_timeout(timer, now, &*codec, &mut self.pending),
                }
            }
        }
    }

    /// Get the next datagram to hand to the link
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.pending.transmits.pop_front()
    }

    /// Get the next application-facing event
    pub fn poll(&mut self) -> Option<Event> {
        self.pending.events.pop_front()
    }

    fn handle_for_id(&self, id: SessionId) -> Option<SessionHandle> {
        self.send_ids
            .get(&id)
            .or_else(|| self.recv_ids.get(&id))
            .copied()
    }

    /// Pick an unused id from this side's half-space
    fn alloc_session_id(&mut self) -> Option<SessionId> {
        for _ in 0..u16::MAX / 2 {
            let id = SessionId(self.next_session_id);
            self.next_session_id = self.next_session_id.wrapping_add(2);
            if !self.send_ids.contains_key(&id) && !self.recv_ids.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    fn control_ack(&mut self, id: SessionId, error: ErrorCode) {
        let mut buf = BytesMut::new();
        self.codec.encode(
            &ControlMessage::Ack {
                session_id: id,
                error,
            },
            &mut buf,
        );
        self.pending.transmit(id, TransmitKind::Control, buf.freeze());
    }

    #[cfg(test)]
    pub(crate) fn send_session(&self, handle: SessionHandle) -> &SendSession {
        match &self.sessions[handle.0] {
            Session::Send(s) => s,
            Session::Recv(_) => panic!("not a send session"),
        }
    }

    #[cfg(test)]
    pub(crate) fn recv_session(&self, handle: SessionHandle) -> &RecvSession {
        match &self.sessions[handle.0] {
            Session::Recv(r) => r,
            Session::Send(_) => panic!("not a receive session"),
        }
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn new_seeded(config: EndpointConfig, side: Side, seed: u16) -> Self {
        Self::with_seed_id(config, side, seed)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("side", &self.side)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

/// Errors from [`Endpoint::send`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum SendError {
    /// The session parameters are invalid
    #[error(transparent)]
    InvalidParams(#[from] ConfigError),
    /// Zero-length objects have no terminal block and cannot be transferred
    #[error("cannot send an empty object")]
    EmptyObject,
    /// Every send-session slot is occupied; destroy a finished session first
    #[error("too many concurrent send sessions")]
    MaxSessionsReached,
}

/// Errors from [`Endpoint::resume`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ResumeError {
    #[error("unknown session")]
    NotFound,
    /// Only send sessions that failed by timing out can be resumed
    #[error("session is not in a resumable state")]
    NotResumable,
}

/// Errors from [`Endpoint::abort`]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum AbortError {
    #[error("unknown session")]
    NotFound,
    /// The session already finished; there is nothing to abort
    #[error("session is already terminal")]
    Terminal,
}

/// Errors from [`Endpoint::destroy_session`] and [`Context::destroy`](crate::Context::destroy)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum DestroyError {
    #[error("unknown session")]
    NotFound,
    /// Only terminal sessions can be destroyed
    #[error("session is still in progress")]
    SessionInProgress,
}
