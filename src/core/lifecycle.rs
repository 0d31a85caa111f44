//! Engine lifecycle state shared between the engine, its queues and every
//! local queue handle.
//!
//! Transitions only move forward: `Idle → Running → Stopped → Destroyed`,
//! with `Idle → Destroyed` allowed for an engine that never ran.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::core::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
    Destroyed = 3,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => EngineState::Idle,
            1 => EngineState::Running,
            2 => EngineState::Stopped,
            _ => EngineState::Destroyed,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
            EngineState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Idle as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves from any state in `from` to `to`, or reports why it cannot.
    pub fn transition(
        &self,
        operation: &'static str,
        from: &[EngineState],
        to: EngineState,
    ) -> Result<EngineState, BrokerError> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let state = EngineState::from_u8(current);
            if !from.contains(&state) {
                return Err(BrokerError::InvalidState { operation, state });
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(state),
                Err(actual) => current = actual,
            }
        }
    }

    /// Fails once the engine has been destroyed.
    pub fn ensure_usable(&self, operation: &'static str) -> Result<(), BrokerError> {
        match self.state() {
            EngineState::Destroyed => Err(BrokerError::InvalidState {
                operation,
                state: EngineState::Destroyed,
            }),
            _ => Ok(()),
        }
    }

    /// Pops may suspend only while the engine has not been stopped.
    #[inline]
    pub fn accepts_waiters(&self) -> bool {
        matches!(self.state(), EngineState::Idle | EngineState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        let lc = Lifecycle::new();
        lc.transition("run", &[EngineState::Idle], EngineState::Running)
            .unwrap();
        assert!(lc
            .transition("run", &[EngineState::Idle], EngineState::Running)
            .is_err());
        lc.transition("stop", &[EngineState::Running], EngineState::Stopped)
            .unwrap();
        assert!(!lc.accepts_waiters());
        lc.transition(
            "destroy",
            &[EngineState::Idle, EngineState::Stopped],
            EngineState::Destroyed,
        )
        .unwrap();

        let err = lc.ensure_usable("get_queue").unwrap_err();
        assert_eq!(
            err,
            BrokerError::InvalidState {
                operation: "get_queue",
                state: EngineState::Destroyed
            }
        );
    }
}
