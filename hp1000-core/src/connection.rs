//! Link and catch-up state machines.
//!
//! Pure state bookkeeping with no I/O. The driver's poll loop performs the
//! actual discovery, negotiation and polling and reports each step here, so
//! every failure path has exactly one defined next state.
//!
//! # Link lifecycle
//!
//! ```text
//!   Unbound ──► Discovering ──► Negotiating ──► CatchingUp ──► Polling
//!                   ▲   │            │               │            │
//!                   │   └────────────┴───────┬───────┴────────────┘
//!                   │                        ▼
//!                   └─────────────────── Degraded
//! ```
//!
//! # Usage
//!
//! ```rust
//! use hp1000_core::connection::{LinkState, LinkStateMachine};
//!
//! let mut link = LinkStateMachine::new();
//! link.transition(LinkState::Discovering).unwrap();
//! link.transition(LinkState::Negotiating).unwrap();
//! assert!(link.transition(LinkState::Polling).is_err());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Link State
// =============================================================================

/// Where the poll loop is in its cycle.
///
/// At most one station session is live at a time, and only in
/// `Negotiating`, `CatchingUp` and `Polling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LinkState {
    /// Not started
    #[default]
    Unbound,
    /// Looking for the console on the local network
    Discovering,
    /// Session open, fetching the unit selection
    Negotiating,
    /// Retrieving archive records newer than the cursor
    CatchingUp,
    /// Requesting live data at the configured interval
    Polling,
    /// Session lost or console not found; cooling down before rediscovery
    Degraded,
}

impl LinkState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Unbound, Discovering)
                | (Discovering, Negotiating)
                | (Discovering, Degraded)
                | (Negotiating, CatchingUp)
                | (Negotiating, Degraded)
                | (CatchingUp, Polling)
                | (CatchingUp, Degraded)
                | (Polling, Degraded)
                | (Degraded, Discovering)
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Unbound => write!(f, "Unbound"),
            LinkState::Discovering => write!(f, "Discovering"),
            LinkState::Negotiating => write!(f, "Negotiating"),
            LinkState::CatchingUp => write!(f, "Catching Up"),
            LinkState::Polling => write!(f, "Polling"),
            LinkState::Degraded => write!(f, "Degraded"),
        }
    }
}

/// A state change the machine does not allow
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransition<S> {
    pub from: S,
    pub to: S,
}

// =============================================================================
// Link State Machine
// =============================================================================

/// Tracks the link state and counts sessions and consecutive failures.
#[derive(Debug, Clone, Default)]
pub struct LinkStateMachine {
    state: LinkState,
    /// Sessions opened so far (transitions into `Negotiating`)
    sessions: u32,
    /// Consecutive entries into `Degraded` without reaching `Polling`
    failure_count: u32,
}

impl LinkStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn sessions(&self) -> u32 {
        self.sessions
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Move to `next`, returning the previous state.
    ///
    /// The state is left unchanged when the transition is not allowed.
    pub fn transition(&mut self, next: LinkState) -> Result<LinkState, InvalidTransition<LinkState>> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            return Err(InvalidTransition {
                from: previous,
                to: next,
            });
        }
        match next {
            LinkState::Negotiating => self.sessions = self.sessions.saturating_add(1),
            LinkState::Polling => self.failure_count = 0,
            LinkState::Degraded => self.failure_count = self.failure_count.saturating_add(1),
            _ => {}
        }
        self.state = next;
        Ok(previous)
    }
}

// =============================================================================
// Catch-up State
// =============================================================================

/// Progress of one archive catch-up run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CatchupState {
    #[default]
    Idle,
    /// Waiting for a batch of records after the cursor
    Requesting,
    /// Emitting a received batch
    Draining,
    /// All records up to now were emitted
    Done,
    /// The link failed; the cursor keeps what was emitted
    Aborted,
}

impl CatchupState {
    pub fn can_transition_to(&self, next: CatchupState) -> bool {
        use CatchupState::*;
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Requesting, Draining)
                | (Requesting, Aborted)
                | (Draining, Requesting)
                | (Draining, Done)
        )
    }

    /// Move to `next` if allowed
    pub fn advance(&mut self, next: CatchupState) -> Result<(), InvalidTransition<CatchupState>> {
        if !self.can_transition_to(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for CatchupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatchupState::Idle => write!(f, "Idle"),
            CatchupState::Requesting => write!(f, "Requesting"),
            CatchupState::Draining => write!(f, "Draining"),
            CatchupState::Done => write!(f, "Done"),
            CatchupState::Aborted => write!(f, "Aborted"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_lifecycle() {
        let mut link = LinkStateMachine::new();
        assert_eq!(link.state(), LinkState::Unbound);

        assert_eq!(link.transition(LinkState::Discovering), Ok(LinkState::Unbound));
        link.transition(LinkState::Negotiating).unwrap();
        assert_eq!(link.sessions(), 1);

        link.transition(LinkState::CatchingUp).unwrap();
        link.transition(LinkState::Polling).unwrap();
        link.transition(LinkState::Degraded).unwrap();
        assert_eq!(link.failure_count(), 1);
        assert_eq!(link.state(), LinkState::Degraded);

        link.transition(LinkState::Discovering).unwrap();
        link.transition(LinkState::Degraded).unwrap();
        assert_eq!(link.failure_count(), 2);

        link.transition(LinkState::Discovering).unwrap();
        link.transition(LinkState::Negotiating).unwrap();
        link.transition(LinkState::CatchingUp).unwrap();
        link.transition(LinkState::Polling).unwrap();
        assert_eq!(link.failure_count(), 0);
        assert_eq!(link.sessions(), 2);
    }

    #[test]
    fn test_invalid_link_transitions() {
        let mut link = LinkStateMachine::new();
        assert_eq!(
            link.transition(LinkState::Polling),
            Err(InvalidTransition {
                from: LinkState::Unbound,
                to: LinkState::Polling
            })
        );
        assert_eq!(link.state(), LinkState::Unbound);

        link.transition(LinkState::Discovering).unwrap();
        link.transition(LinkState::Degraded).unwrap();
        // Degraded is never terminal, but only leads back to discovery
        assert!(link.transition(LinkState::Negotiating).is_err());
        assert!(link.transition(LinkState::Unbound).is_err());
        assert!(link.transition(LinkState::Discovering).is_ok());
    }

    #[test]
    fn test_every_state_has_a_way_out() {
        let all = [
            LinkState::Unbound,
            LinkState::Discovering,
            LinkState::Negotiating,
            LinkState::CatchingUp,
            LinkState::Polling,
            LinkState::Degraded,
        ];
        for state in all {
            assert!(
                all.iter().any(|next| state.can_transition_to(*next)),
                "{state} is terminal"
            );
        }
    }

    #[test]
    fn test_catchup_transitions() {
        let mut state = CatchupState::default();
        state.advance(CatchupState::Requesting).unwrap();
        state.advance(CatchupState::Draining).unwrap();
        state.advance(CatchupState::Requesting).unwrap();
        state.advance(CatchupState::Draining).unwrap();
        state.advance(CatchupState::Done).unwrap();
        assert!(state.advance(CatchupState::Requesting).is_err());

        let mut state = CatchupState::Requesting;
        state.advance(CatchupState::Aborted).unwrap();
        assert!(state.advance(CatchupState::Requesting).is_err());
        assert!(CatchupState::Idle.advance(CatchupState::Done).is_err());
    }
}
