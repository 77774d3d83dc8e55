//! Replication strategies and the per-keyspace registry.
//!
//! A strategy decides which endpoints replicate the data behind each token.
//! Bootstrap only needs two answers from it: which ranges a joining endpoint
//! must receive, and which current replicas can serve a given range.

use crate::dht::{Range, Token};
use crate::locator::token_metadata::RingSnapshot;
use crate::types::Endpoint;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

/// Keyspaces that are local to every node and never streamed.
pub const SYSTEM_KEYSPACES: &[&str] = &[
    "system",
    "system_auth",
    "system_traces",
    "system_distributed",
];

/// Check if a keyspace is node-local.
pub fn is_system_keyspace(name: &str) -> bool {
    SYSTEM_KEYSPACES.contains(&name)
}

/// Placement policy for one keyspace.
pub trait ReplicationStrategy: Send + Sync + Debug {
    /// Replicas for data at `token`, in preference order.
    fn natural_endpoints(&self, ring: &RingSnapshot, token: &Token) -> Vec<Endpoint>;

    /// Every range each endpoint replicates on `ring`.
    fn address_ranges(&self, ring: &RingSnapshot) -> HashMap<Endpoint, Vec<Range>> {
        let mut ranges: HashMap<Endpoint, Vec<Range>> = HashMap::new();
        for entry in ring.entries() {
            let Some(range) = ring.primary_range_for(&entry.token) else {
                continue;
            };
            for endpoint in self.natural_endpoints(ring, &entry.token) {
                ranges.entry(endpoint).or_default().push(range);
            }
        }
        ranges
    }

    /// Ranges `endpoint` will replicate once it holds `tokens`, evaluated
    /// against `ring` as it stands before the join.
    fn pending_ranges_for(
        &self,
        ring: &RingSnapshot,
        tokens: &[Token],
        endpoint: Endpoint,
    ) -> Vec<Range> {
        let projected = ring.with_tokens(tokens, endpoint);
        let mut ranges = self
            .address_ranges(&projected)
            .remove(&endpoint)
            .unwrap_or_default();
        ranges.sort();
        ranges
    }

    /// Current replicas that hold all of `range`, in preference order.
    ///
    /// Pending ranges never straddle a token of the pre-join ring, so the
    /// replicas of the range's right bound hold the whole range.
    fn range_sources(&self, ring: &RingSnapshot, range: &Range) -> Vec<Endpoint> {
        self.natural_endpoints(ring, &range.right)
    }
}

/// Replicas are the first `replication_factor` distinct endpoints found
/// walking clockwise from the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleStrategy {
    replication_factor: usize,
}

impl SimpleStrategy {
    /// Create a strategy keeping `replication_factor` copies (at least one).
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
        }
    }

    /// Get the replication factor.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

impl ReplicationStrategy for SimpleStrategy {
    fn natural_endpoints(&self, ring: &RingSnapshot, token: &Token) -> Vec<Endpoint> {
        let mut replicas = Vec::with_capacity(self.replication_factor);
        for entry in ring.ring_iter_from(token) {
            if !replicas.contains(&entry.endpoint) {
                replicas.push(entry.endpoint);
                if replicas.len() >= self.replication_factor {
                    break;
                }
            }
        }
        replicas
    }
}

/// Source of keyspaces and their strategies.
pub trait ReplicationStrategyProvider: Send + Sync + Debug {
    /// Keyspaces whose data is distributed across the ring.
    fn non_system_keyspaces(&self) -> Vec<String>;

    /// Strategy for a keyspace.
    fn strategy(&self, keyspace: &str) -> Option<Arc<dyn ReplicationStrategy>>;
}

/// In-memory keyspace registry.
#[derive(Debug, Default)]
pub struct Keyspaces {
    keyspaces: RwLock<BTreeMap<String, Arc<dyn ReplicationStrategy>>>,
}

impl Keyspaces {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keyspace while building.
    pub fn with_keyspace(
        self,
        name: impl Into<String>,
        strategy: Arc<dyn ReplicationStrategy>,
    ) -> Self {
        self.add_keyspace(name, strategy);
        self
    }

    /// Register or replace a keyspace.
    pub fn add_keyspace(&self, name: impl Into<String>, strategy: Arc<dyn ReplicationStrategy>) {
        self.keyspaces.write().insert(name.into(), strategy);
    }

    /// Drop a keyspace.
    pub fn remove_keyspace(&self, name: &str) -> bool {
        self.keyspaces.write().remove(name).is_some()
    }

    /// Every registered keyspace, system ones included.
    pub fn all_keyspaces(&self) -> Vec<String> {
        self.keyspaces.read().keys().cloned().collect()
    }
}

impl ReplicationStrategyProvider for Keyspaces {
    fn non_system_keyspaces(&self) -> Vec<String> {
        self.keyspaces
            .read()
            .keys()
            .filter(|name| !is_system_keyspace(name))
            .cloned()
            .collect()
    }

    fn strategy(&self, keyspace: &str) -> Option<Arc<dyn ReplicationStrategy>> {
        self.keyspaces.read().get(keyspace).cloned()
    }
}
