use std::time::Instant;

/// Kinds of timeouts needed to run a session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// When the sender gives up waiting for an ACK and re-emits the window
    Retransmit = 0,
    /// When the receiver stops coalescing and emits an ACK
    AckDelay = 1,
    /// When the session's wall-clock budget runs out
    Expiry = 2,
}

impl Timer {
    const VALUES: [Self; 3] = [Self::Retransmit, Self::AckDelay, Self::Expiry];
}

/// Deadlines for each kind of `Timer`
///
/// All timers are one-shot and explicitly re-armed. Polling rather than
/// scheduling callbacks means an expiration observed after its session moved
/// on is simply never reported.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 3],
}

impl TimerTable {
    /// Arm `timer`, replacing any previous deadline
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    pub(crate) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = [None; 3];
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    /// Earliest armed deadline, if any
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().flatten().min().copied()
    }

    /// Disarm and return the earliest timer with a deadline at or before `now`
    pub(crate) fn poll_expired(&mut self, now: Instant) -> Option<Timer> {
        let expired = Timer::VALUES
            .into_iter()
            .filter(|&t| self.data[t as usize].is_some_and(|at| at <= now))
            .min_by_key(|&t| self.data[t as usize]);
        if let Some(timer) = expired {
            self.stop(timer);
        }
        expired
    }
}
