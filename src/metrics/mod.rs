use std::sync::atomic::{AtomicU64, Ordering};

// Coarse per-engine counters. Relaxed everywhere: they are only ever read
// for reporting. The wire_* counters cover requests served over TCP;
// embedded LocalQueue calls bypass the workers and are not counted.
#[derive(Debug, Default)]
pub struct Stats {
    wire_pushed: AtomicU64,
    wire_popped: AtomicU64,
    pop_timeouts: AtomicU64,
    requeued: AtomicU64,
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    protocol_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub wire_pushed: u64,
    pub wire_popped: u64,
    pub pop_timeouts: u64,
    pub requeued: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub protocol_errors: u64,
}

impl Stats {
    #[inline]
    pub fn inc_wire_pushed(&self) {
        self.wire_pushed.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_wire_popped(&self) {
        self.wire_popped.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_pop_timeouts(&self) {
        self.pop_timeouts.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_connections_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_connections_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
    #[inline]
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            wire_pushed: self.wire_pushed.load(Ordering::Relaxed),
            wire_popped: self.wire_popped.load(Ordering::Relaxed),
            pop_timeouts: self.pop_timeouts.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Simple text format (Prometheus-style without HELP/TYPE lines).
    pub fn render(&self) -> String {
        let s = self.snapshot();
        format!(
            "turbomq_wire_pushed {}\nturbomq_wire_popped {}\nturbomq_pop_timeouts {}\nturbomq_requeued {}\nturbomq_connections_accepted {}\nturbomq_connections_closed {}\nturbomq_protocol_errors {}\n",
            s.wire_pushed,
            s.wire_popped,
            s.pop_timeouts,
            s.requeued,
            s.connections_accepted,
            s.connections_closed,
            s.protocol_errors,
        )
    }
}
