//! Session state machine.

use std::fmt;

/// Per-connection session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No device, no transport.
    #[default]
    Idle,
    /// Version queries in flight.
    Probing,
    /// Versions and capability known, ready for updates.
    Identified,
    /// Image transfer in progress.
    Writing,
    /// Reset and re-probe in progress.
    Recovering,
    /// Last operation failed; the reason is kept for display.
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Probing => write!(f, "Probing"),
            SessionState::Identified => write!(f, "Identified"),
            SessionState::Writing => write!(f, "Writing"),
            SessionState::Recovering => write!(f, "Recovering"),
            SessionState::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

impl SessionState {
    /// Whether an operation is running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Probing | SessionState::Writing | SessionState::Recovering
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

/// Holds the current state and logs transitions.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Move to `new_state`, returning the previous one.
    pub fn goto_state(&mut self, new_state: SessionState) -> SessionState {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        std::mem::replace(&mut self.state, new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_returns_previous() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.goto_state(SessionState::Probing), SessionState::Idle);
        assert!(sm.state().is_busy());
        sm.goto_state(SessionState::Failed("timeout".into()));
        assert!(sm.state().is_failed());
        assert_eq!(sm.state().to_string(), "Failed(timeout)");
    }
}
