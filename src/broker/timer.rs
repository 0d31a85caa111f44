//! Pop deadlines for one worker.
//!
//! Ordered by `(deadline, seq)`. A pop that resolves before its deadline
//! removes its entry, so the map only ever holds pops that are still parked.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use mio::Token;

#[derive(Debug, Default)]
pub(crate) struct DeadlineQueue {
    entries: BTreeMap<(Instant, u64), Token>,
}

impl DeadlineQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// `seq` is unique per worker, which keeps equal deadlines apart.
    pub(crate) fn schedule(&mut self, at: Instant, token: Token, seq: u64) {
        self.entries.insert((at, seq), token);
    }

    /// Drops the entry of a pop that resolved early.
    pub(crate) fn cancel(&mut self, at: Instant, seq: u64) -> bool {
        self.entries.remove(&(at, seq)).is_some()
    }

    /// How long the event loop may sleep before the earliest deadline.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .first_key_value()
            .map(|(&(at, _), _)| at.saturating_duration_since(now))
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(Token, u64)> {
        let entry = self.entries.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        let ((_, seq), token) = entry.remove_entry();
        Some((token, seq))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let base = Instant::now();
        let mut q = DeadlineQueue::new();
        q.schedule(base + Duration::from_millis(30), Token(3), 3);
        q.schedule(base + Duration::from_millis(10), Token(1), 1);
        q.schedule(base + Duration::from_millis(20), Token(2), 2);

        assert_eq!(q.next_timeout(base), Some(Duration::from_millis(10)));
        assert_eq!(q.pop_expired(base), None);

        let later = base + Duration::from_millis(25);
        assert_eq!(q.pop_expired(later), Some((Token(1), 1)));
        assert_eq!(q.pop_expired(later), Some((Token(2), 2)));
        assert_eq!(q.pop_expired(later), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn equal_deadlines_are_kept_apart() {
        let at = Instant::now();
        let mut q = DeadlineQueue::new();
        q.schedule(at, Token(1), 1);
        q.schedule(at, Token(1), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_expired(at), Some((Token(1), 1)));
        assert_eq!(q.pop_expired(at), Some((Token(1), 2)));
    }

    #[test]
    fn resolved_pops_leave_nothing_behind() {
        let base = Instant::now();
        let hour = base + Duration::from_secs(3600);
        let mut q = DeadlineQueue::new();
        for seq in 0..2000 {
            q.schedule(hour, Token(seq as usize + 1), seq);
            assert!(q.cancel(hour, seq));
        }
        assert_eq!(q.len(), 0);
        assert_eq!(q.next_timeout(base), None);
        assert!(!q.cancel(hour, 0));
    }

    #[test]
    fn overdue_deadline_means_no_sleep() {
        let base = Instant::now();
        let mut q = DeadlineQueue::new();
        assert_eq!(q.next_timeout(base), None);
        q.schedule(base, Token(7), 0);
        assert_eq!(
            q.next_timeout(base + Duration::from_secs(1)),
            Some(Duration::ZERO)
        );
    }
}
