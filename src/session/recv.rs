use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::bitmap::BlockBitmap;
use crate::config::SessionParams;
use crate::control::{ControlCodec, ControlMessage};
use crate::frame::{AckFrame, DataFrame, ACK_HEADER_LEN};
use crate::session::timer::{Timer, TimerTable};
use crate::shared::{ErrorCode, Event, Pending, SessionHandle, SessionId, TransferError, TransmitKind};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum RecvPhase {
    /// Admitted, no block seen yet
    Init,
    /// Accumulating blocks into the current window
    Receiving,
    /// Handing a completed window to the application
    Delivering,
    Complete,
    Failed(TransferError),
    Aborted,
}

impl RecvPhase {
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_) | Self::Aborted)
    }
}

/// Receiver half of a transfer: reassembles one window at a time and hands
/// contiguous, in-order slices of the object to the application
#[derive(Debug)]
pub(crate) struct RecvSession {
    id: SessionId,
    handle: SessionHandle,
    params: SessionParams,
    total_size: u64,
    phase: RecvPhase,
    /// Byte offset of the first block of the current window
    window_base: u64,
    /// Block number of the first block of the current window
    first_block: u16,
    /// Exactly one window's worth of payload, reused across windows
    buffer: Box<[u8]>,
    /// One bit per block number of the modular cycle; set means the block is
    /// in `buffer`
    received: BlockBitmap,
    pub(crate) timers: TimerTable,
}

impl RecvSession {
    pub(crate) fn new(
        id: SessionId,
        handle: SessionHandle,
        total_size: u64,
        params: SessionParams,
        now: Instant,
    ) -> Self {
        let buffer_len = usize::from(params.window_size) * usize::from(params.block_size);
        let mut timers = TimerTable::default();
        timers.set(Timer::AckDelay, now + params.timeout);
        timers.set(Timer::Expiry, now + params.session_expiry);
        Self {
            id,
            handle,
            params,
            total_size,
            phase: RecvPhase::Init,
            window_base: 0,
            first_block: 0,
            buffer: vec![0; buffer_len].into_boxed_slice(),
            received: BlockBitmap::new(params.max_blocks()),
            timers,
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Accumulate one inbound block
    pub(crate) fn handle_data(&mut self, frame: &DataFrame, now: Instant, pending: &mut Pending) {
        if self.phase.is_terminal() {
            trace!(id = %self.id, "dropping block for terminal session");
            return;
        }
        self.phase = RecvPhase::Receiving;

        let max = self.params.max_blocks();
        if frame.block_number >= max {
            debug!(id = %self.id, block = frame.block_number, "block number out of range");
            return;
        }
        let index = (frame.block_number + max - self.first_block) % max;
        if index >= self.params.window_size {
            // Not part of the current window: either a replay of the window
            // we already acknowledged or far ahead of us. Ignore it; the
            // sender retransmits until it learns our progress.
            trace!(id = %self.id, block = frame.block_number, "block outside current window");
            return;
        }
        if self.received.test(frame.block_number) {
            trace!(id = %self.id, block = frame.block_number, "duplicate block");
            return;
        }
        if frame.resume {
            trace!(id = %self.id, "first block of a resumed window");
        }

        let offset = self.window_base + u64::from(index) * u64::from(self.params.block_size);
        let payload_len = frame.payload.len() as u64;
        if payload_len == 0 || payload_len > u64::from(self.params.block_size) {
            debug!(id = %self.id, len = payload_len, "implausible block length");
            return;
        }
        if frame.last != (offset + payload_len == self.total_size) {
            debug!(id = %self.id, block = frame.block_number, "LAST flag contradicts object size");
            return;
        }
        if !frame.last && payload_len != u64::from(self.params.block_size) {
            debug!(id = %self.id, block = frame.block_number, "short block that is not terminal");
            return;
        }

        let start = usize::from(index) * usize::from(self.params.block_size);
        self.buffer[start..start + frame.payload.len()].copy_from_slice(&frame.payload);
        self.received.set(frame.block_number);
        trace!(id = %self.id, block = frame.block_number, offset, "block received");

        if !self.window_missing() {
            // Window complete: no reason to wait out the coalescing delay
            self.emit_ack(now, pending);
        }
    }

    /// The ACK coalescing timer fired (or the window completed): acknowledge
    /// progress and, if the window is whole, deliver it
    pub(crate) fn emit_ack(&mut self, now: Instant, pending: &mut Pending) {
        if self.phase.is_terminal() {
            return;
        }
        if self.window_missing() {
            self.emit_selective_ack(pending);
            self.timers.set(Timer::AckDelay, now + self.params.timeout);
            return;
        }

        self.emit_frame_ack(&Bytes::new(), pending);
        self.deliver_window(pending);

        let w = self.params.window_size;
        self.first_block = (self.first_block + w) % self.params.max_blocks();
        self.window_base += u64::from(w) * u64::from(self.params.block_size);
        self.received.clear_all();

        if self.window_base >= self.total_size {
            debug!(id = %self.id, "object delivered in full");
            self.phase = RecvPhase::Complete;
            self.timers.stop_all();
            pending.event(Event::ReceiveComplete {
                session: self.handle,
            });
        } else {
            self.phase = RecvPhase::Receiving;
            self.timers.set(Timer::AckDelay, now + self.params.timeout);
        }
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
            Timer::AckDelay => self.emit_ack(now, pending),
            Timer::Expiry => {
                warn!(id = %self.id, "session expired");
                self.emit_abort(ErrorCode::SessionTimedOut, codec, pending);
                self.fail(TransferError::Expired, pending);
            }
            Timer::Retransmit => debug_assert!(false, "retransmit timer on a receive session"),
        }
    }

    /// Peer wants to pick a timed-out transfer back up at `offset`
    ///
    /// Resumption is only defined from the exact window boundary both sides
    /// agree on; anything else means the sender's notion of progress has
    /// diverged beyond repair.
    pub(crate) fn handle_resume(
        &mut self,
        offset: u64,
        now: Instant,
        codec: &dyn ControlCodec,
        pending: &mut Pending,
    ) {
        if self.phase.is_terminal() {
            trace!(id = %self.id, "dropping RESUME for terminal session");
            return;
        }
        if offset != self.window_base {
            warn!(
                id = %self.id,
                peer_offset = offset,
                local_offset = self.window_base,
                "resume offset mismatch, aborting"
            );
            self.emit_abort(ErrorCode::SessionAborted, codec, pending);
            self.fail(TransferError::Aborted, pending);
            return;
        }
        debug!(id = %self.id, offset, "peer resumed transfer");
        self.timers.set(Timer::AckDelay, now + self.params.timeout);
    }

    pub(crate) fn handle_abort(&mut self, error: ErrorCode, pending: &mut Pending) {
        if self.phase.is_terminal() {
            return;
        }
        debug!(id = %self.id, code = %error, "peer aborted transfer");
        self.fail(TransferError::Peer(error), pending);
    }

    /// Application-requested abort; synchronous, no event
    pub(crate) fn abort(&mut self, codec: &dyn ControlCodec, pending: &mut Pending) {
        self.timers.stop_all();
        self.emit_abort(ErrorCode::SessionAborted, codec, pending);
        self.phase = RecvPhase::Aborted;
    }

    /// The link refused one of our datagrams
    ///
    /// Losing an ACK is fatal here, unlike on the send side: the sender
    /// would retransmit a window we can no longer acknowledge and the
    /// transfer would deadlock.
    pub(crate) fn handle_transmit_error(&mut self, kind: TransmitKind, pending: &mut Pending) {
        match kind {
            TransmitKind::Ack if !self.phase.is_terminal() => {
                debug!(id = %self.id, "ACK send failed");
                self.fail(TransferError::Network, pending);
            }
            _ => {}
        }
    }

    fn fail(&mut self, error: TransferError, pending: &mut Pending) {
        self.timers.stop_all();
        self.phase = RecvPhase::Failed(error);
        pending.event(Event::ReceiveFailed {
            session: self.handle,
            error,
        });
    }

    /// Hand the completed window to the application in block order
    fn deliver_window(&mut self, pending: &mut Pending) {
        self.phase = RecvPhase::Delivering;
        let block_size = u64::from(self.params.block_size);
        for i in 0..self.window_block_count() {
            let offset = self.window_base + u64::from(i) * block_size;
            let len = block_size.min(self.total_size - offset) as usize;
            let start = usize::from(i) * usize::from(self.params.block_size);
            pending.event(Event::Block {
                session: self.handle,
                offset,
                data: Bytes::copy_from_slice(&self.buffer[start..start + len]),
                total_size: self.total_size,
            });
        }
    }

    /// Whether any block of the current window is still outstanding
    fn window_missing(&self) -> bool {
        let lo = self.first_block;
        self.received
            .any_missing_in_range(lo, lo + self.window_block_count())
    }

    /// Bitmap of missing block numbers, one bit per block of the modular
    /// cycle, restricted to blocks the object actually contains
    fn emit_selective_ack(&self, pending: &mut Pending) {
        let mut bits = vec![0u8; (usize::from(self.received.len()) + 7) / 8];
        for i in 0..self.window_block_count() {
            let block_number = (self.first_block + i) % self.params.max_blocks();
            if !self.received.test(block_number) {
                bits[usize::from(block_number) / 8] |= 1 << (block_number % 8);
            }
        }
        trace!(id = %self.id, missing = self.window_block_count() - self.received.count_set(), "selective ACK");
        self.emit_frame_ack(&Bytes::from(bits), pending);
    }

    fn emit_frame_ack(&self, bitmap: &Bytes, pending: &mut Pending) {
        let frame = AckFrame {
            session_id: self.id,
            error_code: 0,
            first_block_number: self.first_block,
            bitmap: bitmap.clone(),
        };
        let mut buf = BytesMut::with_capacity(ACK_HEADER_LEN + bitmap.len());
        frame.encode(&mut buf);
        pending.transmit(self.id, TransmitKind::Ack, buf.freeze());
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

    /// Blocks the current window actually covers; the final window may be
    /// short
    fn window_block_count(&self) -> u16 {
        let remaining = self.total_size - self.window_base;
        let blocks = remaining.div_ceil(u64::from(self.params.block_size));
        blocks.min(u64::from(self.params.window_size)) as u16
    }

    #[cfg(test)]
    pub(crate) fn window_base(&self) -> u64 {
        self.window_base
    }
}
