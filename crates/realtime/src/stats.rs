use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Counters maintained by the connection driver
#[derive(Debug, Default)]
pub(crate) struct ConnectionStats {
    opens: AtomicUsize,
    open_failures: AtomicUsize,
    frames_sent: AtomicUsize,
    frames_received: AtomicUsize,
    sends_dropped: AtomicUsize,
    protocol_errors: AtomicUsize,
    reconnect_attempts: AtomicU32,
}

impl ConnectionStats {
    pub(crate) fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_send(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, handler_failures: usize) -> StatsSnapshot {
        StatsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            handler_failures,
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a connection's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transport opens started
    pub opens: usize,
    /// Transport opens that failed
    pub open_failures: usize,
    pub frames_sent: usize,
    pub frames_received: usize,
    /// Sends dropped because the connection was not open
    pub sends_dropped: usize,
    /// Inbound frames that could not be decoded
    pub protocol_errors: usize,
    /// Handler invocations that failed
    pub handler_failures: usize,
    /// Current reconnect attempt (0 while healthy)
    pub reconnect_attempts: u32,
}
