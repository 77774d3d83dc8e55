//! Liveness tracking for ring members.
//!
//! The gossip protocol itself lives elsewhere; this module only keeps the
//! verdicts it produces and answers `is_alive` for stream source selection.

use crate::cluster::events::{EndpointEvent, EndpointEventListener};
use crate::config::FailureDetectorConfig;
use crate::types::Endpoint;
use dashmap::DashMap;
use std::fmt::Debug;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Liveness oracle.
pub trait FailureDetector: Send + Sync + Debug {
    /// Check if an endpoint is currently considered reachable.
    fn is_alive(&self, endpoint: &Endpoint) -> bool;
}

/// Health of one endpoint.
#[derive(Debug, Clone)]
struct EndpointHealth {
    /// When the endpoint last answered.
    last_seen: Instant,

    /// Consecutive missed probes.
    failed_checks: usize,

    /// Whether the endpoint is currently considered up.
    is_alive: bool,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            last_seen: Instant::now(),
            failed_checks: 0,
            is_alive: true,
        }
    }

    fn mark_seen(&mut self) {
        self.last_seen = Instant::now();
        self.failed_checks = 0;
        self.is_alive = true;
    }
}

/// Failure detector fed by gossip results.
///
/// An endpoint is convicted after `failure_confirmations` consecutive missed
/// probes and recovers on its next successful one. Endpoints that were never
/// reported are not alive.
#[derive(Debug)]
pub struct GossipFailureDetector {
    endpoints: DashMap<Endpoint, EndpointHealth>,
    config: FailureDetectorConfig,
}

impl GossipFailureDetector {
    /// Create a failure detector.
    pub fn new(config: FailureDetectorConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            config,
        }
    }

    /// Record a successful probe.
    ///
    /// Returns an event if the endpoint is new or came back.
    pub fn handle_alive(&self, endpoint: Endpoint) -> Option<EndpointEvent> {
        let mut entry = self.endpoints.entry(endpoint).or_insert_with(|| {
            debug!(%endpoint, "Tracking new endpoint");
            let mut health = EndpointHealth::new();
            health.is_alive = false;
            health
        });
        let was_alive = entry.is_alive;
        entry.mark_seen();
        drop(entry);

        if was_alive {
            None
        } else {
            info!(%endpoint, "Endpoint is alive");
            Some(EndpointEvent::Alive { endpoint })
        }
    }

    /// Record a missed probe.
    ///
    /// Returns a `Suspect` event below the confirmation threshold and a
    /// `Dead` event when the endpoint is convicted.
    pub fn handle_failed_check(&self, endpoint: Endpoint) -> Option<EndpointEvent> {
        let mut entry = self.endpoints.get_mut(&endpoint)?;
        entry.failed_checks += 1;
        let failed_checks = entry.failed_checks;
        let was_alive = entry.is_alive;

        if failed_checks >= self.config.failure_confirmations {
            entry.is_alive = false;
            drop(entry);
            if was_alive {
                warn!(%endpoint, failed_checks, "Endpoint convicted");
                return Some(EndpointEvent::Dead { endpoint });
            }
            None
        } else {
            drop(entry);
            Some(EndpointEvent::Suspect {
                endpoint,
                failed_pings: failed_checks,
            })
        }
    }

    /// Convict an endpoint immediately.
    pub fn convict(&self, endpoint: Endpoint) {
        if let Some(mut entry) = self.endpoints.get_mut(&endpoint) {
            entry.is_alive = false;
            warn!(%endpoint, "Endpoint convicted");
        }
    }

    /// Stop tracking an endpoint.
    pub fn forget(&self, endpoint: &Endpoint) {
        self.endpoints.remove(endpoint);
    }

    /// All endpoints currently alive, sorted.
    pub fn live_endpoints(&self) -> Vec<Endpoint> {
        let mut live: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.is_alive)
            .map(|e| *e.key())
            .collect();
        live.sort();
        live
    }

    /// Seconds since the endpoint last answered.
    pub fn seconds_since_seen(&self, endpoint: &Endpoint) -> Option<f64> {
        self.endpoints
            .get(endpoint)
            .map(|e| e.last_seen.elapsed().as_secs_f64())
    }
}

impl Default for GossipFailureDetector {
    fn default() -> Self {
        Self::new(FailureDetectorConfig::default())
    }
}

impl FailureDetector for GossipFailureDetector {
    fn is_alive(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.get(endpoint).is_some_and(|e| e.is_alive)
    }
}

impl EndpointEventListener for GossipFailureDetector {
    fn on_event(&self, event: &EndpointEvent) {
        match event {
            EndpointEvent::Dead { endpoint } => self.convict(*endpoint),
            EndpointEvent::Left { endpoint } => self.forget(endpoint),
            event if event.is_up() => {
                self.handle_alive(event.endpoint());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn detector(confirmations: usize) -> GossipFailureDetector {
        GossipFailureDetector::new(FailureDetectorConfig {
            failure_confirmations: confirmations,
        })
    }

    #[test]
    fn test_unknown_endpoint_is_not_alive() {
        let fd = detector(3);
        assert!(!fd.is_alive(&addr("10.0.0.1:7000")));
    }

    #[test]
    fn test_alive_then_convicted() {
        let fd = detector(2);
        let a = addr("10.0.0.1:7000");

        assert_eq!(fd.handle_alive(a), Some(EndpointEvent::Alive { endpoint: a }));
        assert_eq!(fd.handle_alive(a), None);
        assert!(fd.is_alive(&a));

        assert_eq!(
            fd.handle_failed_check(a),
            Some(EndpointEvent::Suspect {
                endpoint: a,
                failed_pings: 1
            })
        );
        assert!(fd.is_alive(&a));

        assert_eq!(fd.handle_failed_check(a), Some(EndpointEvent::Dead { endpoint: a }));
        assert!(!fd.is_alive(&a));
        assert_eq!(fd.handle_failed_check(a), None);

        assert_eq!(fd.handle_alive(a), Some(EndpointEvent::Alive { endpoint: a }));
        assert!(fd.is_alive(&a));
    }

    #[test]
    fn test_failed_check_on_unknown_endpoint() {
        let fd = detector(1);
        assert_eq!(fd.handle_failed_check(addr("10.0.0.9:7000")), None);
    }

    #[test]
    fn test_events_drive_liveness() {
        let fd = detector(3);
        let a = addr("10.0.0.1:7000");
        let b = addr("10.0.0.2:7000");

        fd.on_event(&EndpointEvent::Alive { endpoint: a });
        fd.on_event(&EndpointEvent::Normal {
            endpoint: b,
            tokens: vec![],
        });
        assert_eq!(fd.live_endpoints(), vec![a, b]);

        fd.on_event(&EndpointEvent::Dead { endpoint: a });
        assert!(!fd.is_alive(&a));

        fd.on_event(&EndpointEvent::Left { endpoint: b });
        assert!(fd.seconds_since_seen(&b).is_none());
        assert!(fd.live_endpoints().is_empty());
    }
}
