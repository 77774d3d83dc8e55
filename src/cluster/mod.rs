//! Cluster membership and liveness.

pub mod events;
pub mod failure_detector;
pub mod membership;

pub use events::{EndpointEvent, EndpointEventListener, LoggingEventListener};
pub use failure_detector::{FailureDetector, GossipFailureDetector};
pub use membership::{ClusterMembership, RingMembership};
