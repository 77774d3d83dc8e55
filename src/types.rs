//! Core types used throughout ring admission.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Network identity of a ring member.
pub type Endpoint = SocketAddr;

/// Lifecycle of a node being admitted to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BootstrapState {
    /// Tokens are resolved and pending ranges are being registered.
    Joining,
    /// Ranges are being fetched from their current owners.
    Streaming,
    /// Every range arrived and the cluster was told the node is a full member.
    Normal,
    /// The attempt failed. A new attempt has to start from scratch.
    Failed,
}

impl BootstrapState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapState::Normal | BootstrapState::Failed)
    }

    /// Check if moving from this state to `next` is a legal transition.
    pub fn can_transition_to(&self, next: BootstrapState) -> bool {
        use BootstrapState::*;
        matches!(
            (self, next),
            (Joining, Streaming) | (Streaming, Normal) | (Joining, Failed) | (Streaming, Failed)
        )
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Joining => write!(f, "joining"),
            BootstrapState::Streaming => write!(f, "streaming"),
            BootstrapState::Normal => write!(f, "normal"),
            BootstrapState::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_state_transitions() {
        use BootstrapState::*;

        assert!(Joining.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Normal));
        assert!(Joining.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Failed));

        assert!(!Joining.can_transition_to(Normal));
        assert!(!Normal.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Joining));
    }

    #[test]
    fn test_terminal_states() {
        assert!(BootstrapState::Normal.is_terminal());
        assert!(BootstrapState::Failed.is_terminal());
        assert!(!BootstrapState::Streaming.is_terminal());
        assert_eq!(BootstrapState::Streaming.to_string(), "streaming");
    }
}
