//! Filters deciding which replicas may serve a range.

use crate::cluster::FailureDetector;
use crate::types::Endpoint;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

/// Predicate over candidate source endpoints.
pub trait SourceFilter: Send + Sync + Debug {
    /// Check if `endpoint` may be streamed from.
    fn should_include(&self, endpoint: &Endpoint) -> bool;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Rejects endpoints the failure detector reports as down.
#[derive(Debug, Clone)]
pub struct FailureDetectorSourceFilter {
    detector: Arc<dyn FailureDetector>,
}

impl FailureDetectorSourceFilter {
    /// Create a filter over `detector`.
    pub fn new(detector: Arc<dyn FailureDetector>) -> Self {
        Self { detector }
    }
}

impl SourceFilter for FailureDetectorSourceFilter {
    fn should_include(&self, endpoint: &Endpoint) -> bool {
        self.detector.is_alive(endpoint)
    }

    fn name(&self) -> &'static str {
        "failure_detector"
    }
}

/// Rejects a fixed set of endpoints.
#[derive(Debug, Clone, Default)]
pub struct ExcludeEndpointsFilter {
    excluded: HashSet<Endpoint>,
}

impl ExcludeEndpointsFilter {
    /// Create a filter rejecting `endpoints`.
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            excluded: endpoints.into_iter().collect(),
        }
    }
}

impl SourceFilter for ExcludeEndpointsFilter {
    fn should_include(&self, endpoint: &Endpoint) -> bool {
        !self.excluded.contains(endpoint)
    }

    fn name(&self) -> &'static str {
        "exclude_endpoints"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::GossipFailureDetector;

    #[test]
    fn test_failure_detector_filter() {
        let a: Endpoint = "10.0.0.1:7000".parse().unwrap();
        let b: Endpoint = "10.0.0.2:7000".parse().unwrap();
        let detector = Arc::new(GossipFailureDetector::default());
        detector.handle_alive(a);

        let filter = FailureDetectorSourceFilter::new(detector.clone());
        assert!(filter.should_include(&a));
        assert!(!filter.should_include(&b));

        detector.convict(a);
        assert!(!filter.should_include(&a));
    }

    #[test]
    fn test_exclude_filter() {
        let a: Endpoint = "10.0.0.1:7000".parse().unwrap();
        let b: Endpoint = "10.0.0.2:7000".parse().unwrap();
        let filter = ExcludeEndpointsFilter::new([a]);
        assert!(!filter.should_include(&a));
        assert!(filter.should_include(&b));
    }
}
