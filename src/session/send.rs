use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::config::SessionParams;
use crate::control::{ControlCodec, ControlMessage};
use crate::frame::{AckFrame, DataFrame, DATA_HEADER_LEN};
use crate::session::timer::{Timer, TimerTable};
use crate::shared::{ErrorCode, Event, Pending, SessionHandle, SessionId, TransferError, TransmitKind};

/// Where the sender is in its lifecycle
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendPhase {
    /// Created but START not yet emitted
    Init,
    /// START emitted, first window not yet on the wire
    Starting,
    /// Windows in flight, more object remaining beyond the current window
    Sending,
    /// The current window contains the terminal block; awaiting the final ACK
    Draining,
    Complete,
    Failed(TransferError),
    Aborted,
}

impl SendPhase {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_) | Self::Aborted)
    }
}

/// Sender half of a transfer: owns the object, walks it window by window
#[derive(Debug)]
pub(crate) struct SendSession {
    id: SessionId,
    handle: SessionHandle,
    object: Bytes,
    params: SessionParams,
    phase: SendPhase,
    /// Byte offset of the first block of the current window
    window_base: u64,
    /// Block number of the first block of the current window
    first_block: u16,
    retries_left: u16,
    /// Whether any ACK for this session has ever arrived; until one has, a
    /// window retransmit re-emits START too, in case the START itself was
    /// the casualty
    acked_once: bool,
    /// Set the RESUME flag on the next window's first block
    resume_pending: bool,
    /// Absolute deadline fixed at creation; resume does not extend it
    expires_at: Instant,
    pub(crate) timers: TimerTable,
}

impl SendSession {
    pub(crate) fn new(
        id: SessionId,
        handle: SessionHandle,
        object: Bytes,
        params: SessionParams,
        now: Instant,
    ) -> Self {
        Self {
            id,
            handle,
            object,
            params,
            phase: SendPhase::Init,
            window_base: 0,
            first_block: 0,
            retries_left: params.max_retransmits,
            acked_once: false,
            resume_pending: false,
            expires_at: now + params.session_expiry,
            timers: TimerTable::default(),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub(crate) fn bitmap_len(&self) -> usize {
        self.params.bitmap_len()
    }

    /// Emit START and the first window, arm timers
    pub(crate) fn start(&mut self, now: Instant, codec: &dyn ControlCodec, pending: &mut Pending) {
        debug_assert_eq!(self.phase, SendPhase::Init);
        self.emit_start(codec, pending);
        self.phase = SendPhase::Starting;
        debug!(id = %self.id, size = self.object.len(), "starting transfer");
        self.emit_window(pending);
        self.phase = self.in_flight_phase();
        self.timers.set(Timer::Retransmit, now + 2 * self.params.timeout);
        self.timers.set(Timer::Expiry, self.expires_at);
    }

    /// Consume an ACK frame for this session
    pub(crate) fn handle_ack(&mut self, ack: &AckFrame, now: Instant, pending: &mut Pending) {
        if self.phase.is_terminal() {
            trace!(id = %self.id, "dropping ACK for terminal session");
            return;
        }
        if ack.error_code != 0 {
            let code = ErrorCode::from_wire(ack.error_code);
            debug!(id = %self.id, %code, "peer reported fatal error");
            self.fail(TransferError::Peer(code), pending);
            return;
        }
        if ack.first_block_number != self.first_block {
            // Lingers from a window already advanced past. This includes a
            // link-duplicated copy of the full-window ACK that moved us
            // here; honoring it again would skip a window outright. The
            // timer stays armed.
            trace!(
                id = %self.id,
                acked = ack.first_block_number,
                current = self.first_block,
                "dropping stale ACK"
            );
            return;
        }

        self.acked_once = true;
        self.timers.stop(Timer::Retransmit);

        if ack.bitmap.is_empty() {
            self.advance_window(now, pending);
        } else {
            self.retransmit_missing(ack, pending);
            self.timers.set(Timer::Retransmit, now + 2 * self.params.timeout);
        }
    }

    /// Session-setup-level acknowledgement (control message), carrying an
    /// error the receiver hit before any window could flow
    pub(crate) fn handle_control_ack(&mut self, error: ErrorCode, pending: &mut Pending) {
        if self.phase.is_terminal() {
            return;
        }
        if error == ErrorCode::Success {
            trace!(id = %self.id, "peer acknowledged session setup");
            return;
        }
        debug!(id = %self.id, code = %error, "peer refused session");
        self.fail(TransferError::Peer(error), pending);
    }

    pub(crate) fn handle_abort(&mut self, error: ErrorCode, pending: &mut Pending) {
        if self.phase.is_terminal() {
            return;
        }
        debug!(id = %self.id, code = %error, "peer aborted transfer");
        self.fail(TransferError::Peer(error), pending);
    }

    pub(crate) fn handle_timeout(
        &mut self,
        timer: Timer,
        now: Instant,
        codec: &dyn ControlCodec,
        pending: &mut Pending,
    ) {
        if self.phase.is_terminal() {
            return;
        }
        match timer {
            Timer::Retransmit => {
                if self.retries_left == 0 {
                    debug!(id = %self.id, "out of retransmissions");
                    self.phase = SendPhase::Failed(TransferError::TimedOut);
                    self.timers.stop_all();
                    pending.event(Event::SendTimedOut {
                        session: self.handle,
                    });
                    return;
                }
                self.retries_left -= 1;
                trace!(id = %self.id, retries_left = self.retries_left, "window timed out, re-emitting");
                if !self.acked_once {
                    self.emit_start(codec, pending);
                }
                self.emit_window(pending);
                self.timers.set(Timer::Retransmit, now + 2 * self.params.timeout);
            }
            Timer::Expiry => {
                warn!(id = %self.id, "session expired");
                // Best-effort courtesy to the peer; its own expiry would
                // catch this anyway.
                self.emit_abort(ErrorCode::SessionTimedOut, codec, pending);
                self.fail(TransferError::Expired, pending);
            }
            Timer::AckDelay => debug_assert!(false, "ACK delay timer on a send session"),
        }
    }

    /// Application-requested abort; synchronous, no event
    pub(crate) fn abort(&mut self, codec: &dyn ControlCodec, pending: &mut Pending) {
        self.timers.stop_all();
        self.emit_abort(ErrorCode::SessionAborted, codec, pending);
        self.phase = SendPhase::Aborted;
    }

    /// Whether `resume` would be accepted
    pub(crate) fn is_resumable(&self) -> bool {
        self.phase == SendPhase::Failed(TransferError::TimedOut)
    }

    /// Revive a timed-out session from the current window boundary
    pub(crate) fn resume(&mut self, now: Instant, codec: &dyn ControlCodec, pending: &mut Pending) {
        debug_assert!(self.is_resumable());
        debug!(id = %self.id, offset = self.window_base, "resuming transfer");
        self.retries_left = self.params.max_retransmits;
        self.resume_pending = true;
        let mut buf = BytesMut::new();
        codec.encode(
            &ControlMessage::Resume {
                session_id: self.id,
                offset: self.window_base,
            },
            &mut buf,
        );
        pending.transmit(self.id, TransmitKind::Control, buf.freeze());
        self.emit_window(pending);
        self.phase = self.in_flight_phase();
        self.timers.set(Timer::Retransmit, now + 2 * self.params.timeout);
        self.timers.set(Timer::Expiry, self.expires_at);
    }

    /// The link refused a datagram this session cannot progress without
    pub(crate) fn handle_transmit_error(&mut self, kind: TransmitKind, pending: &mut Pending) {
        match kind {
            // The retransmit timer recovers lost data blocks
            TransmitKind::Data => trace!(id = %self.id, "data send failed, relying on retransmit"),
            TransmitKind::Control if !self.phase.is_terminal() => {
                debug!(id = %self.id, "control send failed");
                self.fail(TransferError::Network, pending);
            }
            // A failed ABORT after the session is already terminal changes nothing
            _ => {}
        }
    }

    fn fail(&mut self, error: TransferError, pending: &mut Pending) {
        self.timers.stop_all();
        self.phase = SendPhase::Failed(error);
        pending.event(Event::SendFailed {
            session: self.handle,
            error,
        });
    }

    /// Full-window acknowledgement: move to the next window or finish
    fn advance_window(&mut self, now: Instant, pending: &mut Pending) {
        let w = self.params.window_size;
        self.first_block = (self.first_block + w) % self.params.max_blocks();
        self.window_base += u64::from(w) * u64::from(self.params.block_size);

        if self.window_base >= self.object.len() as u64 {
            debug!(id = %self.id, "transfer complete");
            self.phase = SendPhase::Complete;
            self.timers.stop_all();
            pending.event(Event::SendComplete {
                session: self.handle,
            });
            return;
        }

        self.retries_left = self.params.max_retransmits;
        self.emit_window(pending);
        self.phase = self.in_flight_phase();
        self.timers.set(Timer::Retransmit, now + 2 * self.params.timeout);
    }

    /// Selective retransmit: re-emit exactly the blocks the receiver marked
    /// missing. The window base does not move and the retry budget is not
    /// reset; only a full-window ACK does either.
    fn retransmit_missing(&mut self, ack: &AckFrame, pending: &mut Pending) {
        for i in 0..self.window_block_count() {
            let block_number = (self.first_block + i) % self.params.max_blocks();
            if ack.is_missing(block_number) {
                trace!(id = %self.id, block = block_number, "selective retransmit");
                self.emit_block(i, false, pending);
            }
        }
    }

    /// Blocks the current window actually contains; the final window may be
    /// short
    fn window_block_count(&self) -> u16 {
        let remaining = self.object.len() as u64 - self.window_base;
        let blocks = remaining.div_ceil(u64::from(self.params.block_size));
        blocks.min(u64::from(self.params.window_size)) as u16
    }

    fn in_flight_phase(&self) -> SendPhase {
        let window_len = u64::from(self.params.window_size) * u64::from(self.params.block_size);
        if self.window_base + window_len >= self.object.len() as u64 {
            SendPhase::Draining
        } else {
            SendPhase::Sending
        }
    }

    /// Emit every block of the current window, in ascending block order
    fn emit_window(&mut self, pending: &mut Pending) {
        for i in 0..self.window_block_count() {
            let resume = self.resume_pending && i == 0;
            self.emit_block(i, resume, pending);
        }
        self.resume_pending = false;
    }

    fn emit_block(&self, i: u16, resume: bool, pending: &mut Pending) {
        let block_size = usize::from(self.params.block_size);
        let start = self.window_base as usize + usize::from(i) * block_size;
        let end = (start + block_size).min(self.object.len());
        let frame = DataFrame {
            session_id: self.id,
            block_number: (self.first_block + i) % self.params.max_blocks(),
            resume,
            last: end == self.object.len(),
            payload: self.object.slice(start..end),
        };
        let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + (end - start));
        frame.encode(&mut buf);
        pending.transmit(self.id, TransmitKind::Data, buf.freeze());
    }

    fn emit_start(&self, codec: &dyn ControlCodec, pending: &mut Pending) {
        let mut buf = BytesMut::new();
        codec.encode(
            &ControlMessage::Start {
                session_id: self.id,
                object_size: self.object.len() as u64,
                block_size: self.params.block_size,
                window_size: self.params.window_size,
                timeout_ms: self.params.timeout.as_millis() as u16,
                max_retransmits: self.params.max_retransmits,
                expiry_ms: self.params.session_expiry.as_millis() as u32,
            },
            &mut buf,
        );
        pending.transmit(self.id, TransmitKind::Control, buf.freeze());
    }

    fn emit_abort(&self, error: ErrorCode, codec: &dyn ControlCodec, pending: &mut Pending) {
        let mut buf = BytesMut::new();
        codec.encode(
            &ControlMessage::Abort {
                session_id: self.id,
                error,
            },
            &mut buf,
        );
        pending.transmit(self.id, TransmitKind::Control, buf.freeze());
    }

    #[cfg(test)]
    pub(crate) fn retries_left(&self) -> u16 {
        self.retries_left
    }

    #[cfg(test)]
    pub(crate) fn window_base(&self) -> u64 {
        self.window_base
    }
}
