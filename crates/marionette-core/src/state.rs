//! Session lifecycle.
//!
//! ```text
//! Uninitialized -> Handshaking -> Ready -> Connected -> Closing -> Closed
//!                                   \______________________/
//! ```
//!
//! `Connected` is optional: protocol introspection works in `Ready`, UI
//! operations need `Connected`. A fatal transport error moves any state
//! straight to `Closed`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,
            (Uninitialized, Handshaking) => true,
            // A failed handshake can be retried.
            (Handshaking, Ready) | (Handshaking, Uninitialized) => true,
            (Ready, Connected) => true,
            // Reconnecting to another endpoint.
            (Connected, Connected) => true,
            _ => false,
        }
    }

    /// Whether the handshake has completed and the session is still open.
    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Connected)
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }

    pub fn is_closed(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [Uninitialized, Handshaking, Ready, Connected, Closing, Closed];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn operations_cannot_skip_handshake() {
        assert!(!Uninitialized.can_transition_to(Ready));
        assert!(!Uninitialized.can_transition_to(Connected));
        assert!(!Handshaking.can_transition_to(Connected));
    }

    #[test]
    fn any_open_state_can_close() {
        for state in [Uninitialized, Handshaking, Ready, Connected, Closing] {
            assert!(state.can_transition_to(Closed));
        }
    }

    #[test]
    fn closed_is_terminal() {
        for state in [Uninitialized, Handshaking, Ready, Connected, Closing, Closed] {
            assert!(!Closed.can_transition_to(state));
        }
    }

    #[test]
    fn ready_and_connected_are_ready() {
        assert!(Ready.is_ready());
        assert!(Connected.is_ready());
        assert!(!Handshaking.is_ready());
        assert!(!Closed.is_ready());
        assert!(Closing.is_closed());
    }
}
