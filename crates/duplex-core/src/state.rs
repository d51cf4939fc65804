//! Call session lifecycle states.

use serde::Serialize;
use tokio::time::Instant;

/// Liveness state of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallState {
    /// Probing paths and running the key handshake
    Initializing,
    /// A verified path carries traffic
    Connected,
    /// Terminal: no usable path or an unrecoverable key/protocol error
    Failed,
    /// The active path was lost, failing over
    Reconnecting,
}

impl CallState {
    /// Check whether a transition to `to` is allowed
    #[must_use]
    pub fn can_transition(self, to: CallState) -> bool {
        match (self, to) {
            // Failed is terminal
            (CallState::Failed, _) => false,
            (_, CallState::Failed) => true,

            (CallState::Initializing, CallState::Connected | CallState::Reconnecting) => true,
            (CallState::Connected, CallState::Reconnecting) => true,
            (CallState::Reconnecting, CallState::Connected) => true,

            _ => false,
        }
    }

    /// True once nothing can happen any more
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == CallState::Failed
    }
}

/// Current state plus the bookkeeping of when it was entered.
#[derive(Debug)]
pub struct CallStateMachine {
    state: CallState,
    entered_at: Instant,
    first_connected_at: Option<Instant>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    /// Start in `Initializing`
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CallState::Initializing,
            entered_at: Instant::now(),
            first_connected_at: None,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.state
    }

    /// When the current state was entered
    #[must_use]
    pub fn entered_at(&self) -> Instant {
        self.entered_at
    }

    /// When the session first connected
    #[must_use]
    pub fn first_connected_at(&self) -> Option<Instant> {
        self.first_connected_at
    }

    /// Transition to a new state.
    ///
    /// Returns `false`, leaving the state unchanged, if the transition is
    /// not allowed from the current state.
    pub fn transition_to(&mut self, new_state: CallState) -> bool {
        if !self.state.can_transition(new_state) {
            tracing::debug!(
                "Rejected call state transition: {:?} -> {:?}",
                self.state,
                new_state
            );
            return false;
        }

        let old_state = self.state;
        self.state = new_state;
        self.entered_at = Instant::now();

        if new_state == CallState::Connected && self.first_connected_at.is_none() {
            self.first_connected_at = Some(self.entered_at);
        }

        tracing::debug!("Call state transition: {:?} -> {:?}", old_state, new_state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use CallState::*;

        assert!(Initializing.can_transition(Connected));
        assert!(Initializing.can_transition(Reconnecting));
        assert!(Initializing.can_transition(Failed));
        assert!(Connected.can_transition(Reconnecting));
        assert!(Connected.can_transition(Failed));
        assert!(Reconnecting.can_transition(Connected));
        assert!(Reconnecting.can_transition(Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        use CallState::*;

        assert!(!Connected.can_transition(Initializing));
        assert!(!Connected.can_transition(Connected));
        assert!(!Reconnecting.can_transition(Initializing));
        assert!(!Reconnecting.can_transition(Reconnecting));
        for to in [Initializing, Connected, Reconnecting, Failed] {
            assert!(!Failed.can_transition(to));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_machine_bookkeeping() {
        let mut machine = CallStateMachine::new();
        assert_eq!(machine.state(), CallState::Initializing);
        assert!(machine.first_connected_at().is_none());

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        assert!(machine.transition_to(CallState::Connected));
        let connected_at = machine.first_connected_at().unwrap();

        assert!(machine.transition_to(CallState::Reconnecting));
        assert!(machine.transition_to(CallState::Connected));
        assert_eq!(machine.first_connected_at(), Some(connected_at));

        assert!(machine.transition_to(CallState::Failed));
        assert!(!machine.transition_to(CallState::Connected));
        assert!(machine.state().is_terminal());
    }
}
