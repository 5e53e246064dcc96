use std::io;
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::{ConfigError, EndpointConfig, SessionParams};
use crate::endpoint::{AbortError, DestroyError, Endpoint, ResumeError, SendError};
use crate::shared::{Event, SessionHandle, Side};

/// The datagram link a [`Context`] drives, e.g. a GATT characteristic pipe
///
/// The link must deliver bounded-size datagrams uncorrupted; reordering is
/// tolerated. A short write is treated as a network error, never retried at
/// this layer.
///
/// Inbound datagrams reach the context through
/// [`Context::handle_datagram`]; the host's receive callback registration is
/// glue outside this crate's scope.
pub trait DatagramLink: Send {
    /// Synchronously emit one datagram; returns the number of bytes accepted
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;
    /// Largest datagram the link accepts
    fn max_datagram_size(&self) -> usize;
}

/// Blocks of an incoming object, in order: `(session, offset, data, total_size)`
pub type BlockHandler = Box<dyn FnMut(SessionHandle, u64, &[u8], u64) + Send>;
/// Session lifecycle notifications
pub type EventHandler = Box<dyn FnMut(&Event) + Send>;

/// Callback-style front end over an [`Endpoint`]
///
/// Serializes inbound datagrams, timer expirations and API calls behind one
/// mutex, as the protocol requires single-threaded mutation of session
/// state. Callbacks are invoked while that lock is held and must not call
/// back into the same context.
///
/// Terminal sessions are destroyed automatically once their final event has
/// been delivered, except send sessions that timed out: those stay around so
/// the application can [`resume`](Self::resume) them, and are released with
/// the context instead.
pub struct Context {
    inner: Mutex<Inner>,
}

struct Inner {
    endpoint: Endpoint,
    link: Box<dyn DatagramLink>,
    on_block: Option<BlockHandler>,
    on_event: Option<EventHandler>,
}

impl Context {
    pub fn new(
        link: Box<dyn DatagramLink>,
        config: EndpointConfig,
        side: Side,
    ) -> Result<Self, ConfigError> {
        let endpoint = Endpoint::new(config, side)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                endpoint,
                link,
                on_block: None,
                on_event: None,
            }),
        })
    }

    /// Register the application's receive handlers
    ///
    /// `on_block` observes each in-order slice of incoming objects;
    /// `on_event` observes session lifecycle events for both directions.
    pub fn set_receive_handler(&self, on_block: BlockHandler, on_event: EventHandler) {
        let mut inner = self.lock();
        inner.on_block = Some(on_block);
        inner.on_event = Some(on_event);
    }

    /// Initiate sending `object` to the peer
    pub fn send(&self, object: Bytes, params: SessionParams) -> Result<SessionHandle, SendError> {
        let mut inner = self.lock();
        let handle = inner.endpoint.send(Instant::now(), object, params)?;
        inner.pump();
        Ok(handle)
    }

    /// Feed one inbound datagram from the link
    pub fn handle_datagram(&self, datagram: &[u8]) {
        let mut inner = self.lock();
        inner
            .endpoint
            .handle_datagram(Instant::now(), Bytes::copy_from_slice(datagram));
        inner.pump();
    }

    /// Fire any timers that have come due
    ///
    /// The host should call this at (or any time after) the instant reported
    /// by [`next_timeout`](Self::next_timeout). Calling it early or more than
    /// once is harmless.
    pub fn handle_timeout(&self) {
        let mut inner = self.lock();
        inner.endpoint.handle_timeout(Instant::now());
        inner.pump();
    }

    /// When [`handle_timeout`](Self::handle_timeout) next has work to do
    pub fn next_timeout(&self) -> Option<Instant> {
        self.lock().endpoint.next_timeout()
    }

    /// Resume a send session that failed by timing out
    pub fn resume(&self, session: SessionHandle) -> Result<(), ResumeError> {
        let mut inner = self.lock();
        inner.endpoint.resume(Instant::now(), session)?;
        inner.pump();
        Ok(())
    }

    /// Abort a session and release it
    pub fn abort(&self, session: SessionHandle) -> Result<(), AbortError> {
        let mut inner = self.lock();
        inner.endpoint.abort(session)?;
        inner.pump();
        let _ = inner.endpoint.destroy_session(session);
        Ok(())
    }

    /// Tear the context down
    ///
    /// Every session must be terminal; otherwise the context is handed back
    /// unchanged so the caller can abort the stragglers.
    pub fn destroy(self) -> Result<(), (Self, DestroyError)> {
        if !self.lock().endpoint.is_idle() {
            return Err((self, DestroyError::SessionInProgress));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Inner {
    /// Flush outbound datagrams to the link and deliver pending events
    fn pump(&mut self) {
        while let Some(transmit) = self.endpoint.poll_transmit() {
            let result = self.link.send_datagram(&transmit.contents);
            let sent = match result {
                Ok(n) => n,
                Err(e) => {
                    debug!(id = %transmit.session_id, "link send failed: {e}");
                    self.endpoint
                        .handle_transmit_error(transmit.session_id, transmit.kind);
                    continue;
                }
            };
            if sent < transmit.contents.len() {
                debug!(
                    id = %transmit.session_id,
                    sent,
                    len = transmit.contents.len(),
                    "partial datagram send"
                );
                self.endpoint
                    .handle_transmit_error(transmit.session_id, transmit.kind);
            }
        }

        while let Some(event) = self.endpoint.poll() {
            self.dispatch(event);
        }
    }

    fn dispatch(&mut self, event: Event) {
        match &event {
            Event::Block {
                session,
                offset,
                data,
                total_size,
            } => {
                match &mut self.on_block {
                    Some(handler) => handler(*session, *offset, data.as_ref(), *total_size),
                    None => warn!("incoming block dropped: no receive handler registered"),
                }
                return;
            }
            // Sessions that finished outright are released once the
            // application has heard about it; a timed-out sender survives
            // for a potential resume.
            Event::SendComplete { session }
            | Event::SendFailed { session, .. }
            | Event::ReceiveComplete { session }
            | Event::ReceiveFailed { session, .. } => {
                let session = *session;
                if let Some(handler) = &mut self.on_event {
                    handler(&event);
                }
                let _ = self.endpoint.destroy_session(session);
                return;
            }
            Event::ReceiveStarted { .. } | Event::SendTimedOut { .. } => {}
        }
        if let Some(handler) = &mut self.on_event {
            handler(&event);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}
