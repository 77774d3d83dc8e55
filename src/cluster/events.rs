//! Ring membership events.

use crate::dht::Token;
use crate::types::Endpoint;

/// Events describing how a ring member's status changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    /// An endpoint answered a liveness probe.
    Alive {
        /// The endpoint.
        endpoint: Endpoint,
    },

    /// An endpoint missed probes but is not yet convicted.
    Suspect {
        /// The endpoint.
        endpoint: Endpoint,
        /// Consecutive missed probes.
        failed_pings: usize,
    },

    /// An endpoint has been convicted as down.
    Dead {
        /// The endpoint.
        endpoint: Endpoint,
    },

    /// An endpoint announced it is joining with the given tokens.
    Joining {
        /// The endpoint.
        endpoint: Endpoint,
        /// Tokens it will own.
        tokens: Vec<Token>,
    },

    /// An endpoint finished bootstrapping and owns its tokens.
    Normal {
        /// The endpoint.
        endpoint: Endpoint,
        /// Tokens it now owns.
        tokens: Vec<Token>,
    },

    /// An endpoint left the ring.
    Left {
        /// The endpoint.
        endpoint: Endpoint,
    },
}

impl EndpointEvent {
    /// Get the endpoint the event is about.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            EndpointEvent::Alive { endpoint }
            | EndpointEvent::Suspect { endpoint, .. }
            | EndpointEvent::Dead { endpoint }
            | EndpointEvent::Joining { endpoint, .. }
            | EndpointEvent::Normal { endpoint, .. }
            | EndpointEvent::Left { endpoint } => *endpoint,
        }
    }

    /// Check if the event reports the endpoint as reachable.
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            EndpointEvent::Alive { .. }
                | EndpointEvent::Joining { .. }
                | EndpointEvent::Normal { .. }
        )
    }

    /// Check if the event reports the endpoint as gone.
    pub fn is_down(&self) -> bool {
        matches!(self, EndpointEvent::Dead { .. } | EndpointEvent::Left { .. })
    }
}

/// Listener for membership events.
pub trait EndpointEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: &EndpointEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl EndpointEventListener for LoggingEventListener {
    fn on_event(&self, event: &EndpointEvent) {
        match event {
            EndpointEvent::Alive { endpoint } => {
                tracing::debug!(%endpoint, "Endpoint alive");
            }
            EndpointEvent::Suspect {
                endpoint,
                failed_pings,
            } => {
                tracing::warn!(%endpoint, failed_pings, "Endpoint suspected failed");
            }
            EndpointEvent::Dead { endpoint } => {
                tracing::error!(%endpoint, "Endpoint convicted");
            }
            EndpointEvent::Joining { endpoint, tokens } => {
                tracing::info!(%endpoint, tokens = tokens.len(), "Endpoint joining ring");
            }
            EndpointEvent::Normal { endpoint, tokens } => {
                tracing::info!(%endpoint, tokens = tokens.len(), "Endpoint is now normal");
            }
            EndpointEvent::Left { endpoint } => {
                tracing::info!(%endpoint, "Endpoint left ring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_endpoint() {
        let endpoint: Endpoint = "127.0.0.1:7000".parse().unwrap();
        let event = EndpointEvent::Normal {
            endpoint,
            tokens: vec![Token::new(1)],
        };
        assert_eq!(event.endpoint(), endpoint);
    }

    #[test]
    fn test_event_types() {
        let endpoint: Endpoint = "127.0.0.1:7000".parse().unwrap();

        let alive = EndpointEvent::Alive { endpoint };
        assert!(alive.is_up());
        assert!(!alive.is_down());

        let dead = EndpointEvent::Dead { endpoint };
        assert!(!dead.is_up());
        assert!(dead.is_down());

        let suspect = EndpointEvent::Suspect {
            endpoint,
            failed_pings: 1,
        };
        assert!(!suspect.is_up());
        assert!(!suspect.is_down());
    }
}
