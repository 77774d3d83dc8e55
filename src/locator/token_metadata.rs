//! The authoritative ring view: who owns which token, and which ranges are
//! promised to endpoints that are still joining.
//!
//! Topology changes go through a single writer and publish a fresh
//! [`RingSnapshot`]. Readers clone the current `Arc` and work on it for as
//! long as they like; a later mutation never changes a snapshot already
//! handed out.

use crate::dht::{Range, Token};
use crate::types::Endpoint;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One occupied ring position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    pub token: Token,
    pub endpoint: Endpoint,
}

/// Immutable point-in-time copy of the ring.
///
/// Entries are kept sorted by token in a flat arena and addressed by index,
/// so a snapshot is one allocation for the ring plus the reverse index.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    entries: Vec<RingEntry>,
    ownership: HashMap<Endpoint, BTreeSet<Token>>,
}

impl RingSnapshot {
    /// Build a snapshot from token assignments. Later assignments of the
    /// same token win.
    pub fn from_assignments<I>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (Token, Endpoint)>,
    {
        let mut snapshot = Self::default();
        for (token, endpoint) in assignments {
            snapshot.assign(token, endpoint);
        }
        snapshot
    }

    /// Number of tokens on the ring.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no tokens are assigned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owner of a token, if any.
    pub fn get_endpoint(&self, token: &Token) -> Option<Endpoint> {
        self.entries
            .binary_search_by(|entry| entry.token.cmp(token))
            .ok()
            .map(|idx| self.entries[idx].endpoint)
    }

    /// Entry at an arena index.
    pub fn entry(&self, idx: usize) -> Option<&RingEntry> {
        self.entries.get(idx)
    }

    /// All entries in ring order.
    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// All tokens in ring order.
    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.entries.iter().map(|e| e.token).collect()
    }

    /// Tokens held by an endpoint.
    pub fn tokens_for(&self, endpoint: &Endpoint) -> Vec<Token> {
        self.ownership
            .get(endpoint)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Check if an endpoint holds at least one token.
    pub fn is_member(&self, endpoint: &Endpoint) -> bool {
        self.ownership.contains_key(endpoint)
    }

    /// All endpoints holding tokens, sorted.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.ownership.keys().copied().collect();
        endpoints.sort();
        endpoints
    }

    /// Index of the first entry whose token is `>= token`, wrapping to zero
    /// past the last entry. `None` on an empty ring.
    pub fn successor_index(&self, token: &Token) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|entry| entry.token < *token);
        Some(if idx == self.entries.len() { 0 } else { idx })
    }

    /// Walk the ring clockwise once, starting at the successor of `token`.
    pub fn ring_iter_from(&self, token: &Token) -> impl Iterator<Item = &RingEntry> + '_ {
        let start = self.successor_index(token).unwrap_or(0);
        let len = self.entries.len();
        (0..len).map(move |step| &self.entries[(start + step) % len])
    }

    /// Token immediately before `token` on the ring.
    pub fn predecessor(&self, token: &Token) -> Option<Token> {
        let below = self.entries.partition_point(|entry| entry.token < *token);
        let idx = below.checked_sub(1).or_else(|| self.entries.len().checked_sub(1))?;
        Some(self.entries[idx].token)
    }

    /// Range owned by a token that is on the ring: `(predecessor, token]`.
    pub fn primary_range_for(&self, token: &Token) -> Option<Range> {
        self.get_endpoint(token)?;
        let left = self.predecessor(token)?;
        Some(Range::new(left, *token))
    }

    /// Primary ranges of every token held by an endpoint.
    pub fn primary_ranges_for(&self, endpoint: &Endpoint) -> Vec<Range> {
        self.tokens_for(endpoint)
            .iter()
            .filter_map(|t| self.primary_range_for(t))
            .collect()
    }

    /// Copy of this snapshot with `tokens` assigned to `endpoint`.
    pub fn with_tokens(&self, tokens: &[Token], endpoint: Endpoint) -> RingSnapshot {
        let mut next = self.clone();
        for &token in tokens {
            next.assign(token, endpoint);
        }
        next
    }

    fn assign(&mut self, token: Token, endpoint: Endpoint) {
        match self.entries.binary_search_by(|entry| entry.token.cmp(&token)) {
            Ok(idx) => {
                let previous = self.entries[idx].endpoint;
                if previous == endpoint {
                    return;
                }
                self.entries[idx].endpoint = endpoint;
                self.release(&previous, &token);
            }
            Err(idx) => self.entries.insert(idx, RingEntry { token, endpoint }),
        }
        self.ownership.entry(endpoint).or_default().insert(token);
    }

    fn release(&mut self, endpoint: &Endpoint, token: &Token) {
        if let Some(tokens) = self.ownership.get_mut(endpoint) {
            tokens.remove(token);
            if tokens.is_empty() {
                self.ownership.remove(endpoint);
            }
        }
    }

    fn remove_endpoint(&mut self, endpoint: &Endpoint) -> usize {
        let Some(tokens) = self.ownership.remove(endpoint) else {
            return 0;
        };
        self.entries.retain(|entry| entry.endpoint != *endpoint);
        tokens.len()
    }
}

/// A range promised to an endpoint that has not received it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingRange {
    pub range: Range,
    pub endpoint: Endpoint,
}

/// Process-wide ring metadata.
pub struct TokenMetadata {
    /// Current ring, replaced wholesale on every topology change.
    ring: RwLock<Arc<RingSnapshot>>,

    /// Pending ranges per keyspace.
    pending: RwLock<HashMap<String, Vec<PendingRange>>>,

    /// Serializes topology writers.
    writer: Mutex<()>,

    /// Bumped on every ring mutation.
    ring_version: AtomicU64,
}

impl TokenMetadata {
    /// Create empty ring metadata.
    pub fn new() -> Self {
        Self::with_snapshot(RingSnapshot::default())
    }

    /// Create metadata seeded with a ring.
    pub fn with_snapshot(snapshot: RingSnapshot) -> Self {
        Self {
            ring: RwLock::new(Arc::new(snapshot)),
            pending: RwLock::new(HashMap::new()),
            writer: Mutex::new(()),
            ring_version: AtomicU64::new(0),
        }
    }

    /// Owner of a token in the current ring.
    pub fn get_endpoint(&self, token: &Token) -> Option<Endpoint> {
        self.ring.read().get_endpoint(token)
    }

    /// Point-in-time copy of the ring for multi-step computations.
    pub fn clone_ring_snapshot(&self) -> Arc<RingSnapshot> {
        Arc::clone(&self.ring.read())
    }

    /// Current ring version.
    pub fn ring_version(&self) -> u64 {
        self.ring_version.load(Ordering::Acquire)
    }

    /// Tokens held by an endpoint.
    pub fn tokens_for(&self, endpoint: &Endpoint) -> Vec<Token> {
        self.ring.read().tokens_for(endpoint)
    }

    /// Check if an endpoint holds tokens.
    pub fn is_member(&self, endpoint: &Endpoint) -> bool {
        self.ring.read().is_member(endpoint)
    }

    /// All ring members.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.ring.read().endpoints()
    }

    /// All tokens in ring order.
    pub fn sorted_tokens(&self) -> Vec<Token> {
        self.ring.read().sorted_tokens()
    }

    /// Assign tokens to an endpoint. A token already held by someone else
    /// moves to `endpoint`.
    pub fn update_normal_tokens(&self, tokens: &[Token], endpoint: Endpoint) {
        if tokens.is_empty() {
            return;
        }
        self.mutate_ring(|ring| ring.with_tokens(tokens, endpoint));
        info!(%endpoint, tokens = tokens.len(), "Updated normal tokens");
    }

    /// Drop an endpoint from the ring along with any pending ranges
    /// promised to it.
    pub fn remove_endpoint(&self, endpoint: &Endpoint) {
        let writer = self.writer.lock();
        let mut next = (*self.clone_ring_snapshot()).clone();
        let removed = next.remove_endpoint(endpoint);

        {
            let mut pending = self.pending.write();
            for entries in pending.values_mut() {
                entries.retain(|p| p.endpoint != *endpoint);
            }
            pending.retain(|_, entries| !entries.is_empty());
        }
        self.publish(&writer, next);

        info!(%endpoint, tokens = removed, "Removed endpoint from ring");
    }

    /// Promise `range` in `keyspace` to `endpoint`.
    pub fn add_pending_range(&self, keyspace: &str, range: Range, endpoint: Endpoint) {
        let _writer = self.writer.lock();
        let mut pending = self.pending.write();
        let entries = pending.entry(keyspace.to_string()).or_default();
        let entry = PendingRange { range, endpoint };
        if !entries.contains(&entry) {
            entries.push(entry);
            debug!(keyspace, %range, %endpoint, "Added pending range");
        }
    }

    /// Drop every pending range in `keyspace` promised to `endpoint`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_pending_ranges_for(&self, keyspace: &str, endpoint: &Endpoint) -> usize {
        let _writer = self.writer.lock();
        let mut pending = self.pending.write();
        let Some(entries) = pending.get_mut(keyspace) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|p| p.endpoint != *endpoint);
        let removed = before - entries.len();
        if entries.is_empty() {
            pending.remove(keyspace);
        }
        debug!(keyspace, %endpoint, removed, "Removed pending ranges");
        removed
    }

    /// All pending ranges in a keyspace.
    pub fn pending_ranges(&self, keyspace: &str) -> Vec<PendingRange> {
        self.pending.read().get(keyspace).cloned().unwrap_or_default()
    }

    /// Pending ranges in a keyspace promised to one endpoint.
    pub fn pending_ranges_for(&self, keyspace: &str, endpoint: &Endpoint) -> Vec<Range> {
        self.pending
            .read()
            .get(keyspace)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|p| p.endpoint == *endpoint)
                    .map(|p| p.range)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Endpoints with a pending claim on `token` in `keyspace`.
    pub fn pending_endpoints_for(&self, keyspace: &str, token: &Token) -> Vec<Endpoint> {
        let pending = self.pending.read();
        let mut endpoints: Vec<Endpoint> = pending
            .get(keyspace)
            .into_iter()
            .flatten()
            .filter(|p| p.range.contains(*token))
            .map(|p| p.endpoint)
            .collect();
        endpoints.sort();
        endpoints.dedup();
        endpoints
    }

    /// Total pending entries across keyspaces.
    pub fn pending_count(&self) -> usize {
        self.pending.read().values().map(Vec::len).sum()
    }

    fn mutate_ring<F>(&self, f: F)
    where
        F: FnOnce(&RingSnapshot) -> RingSnapshot,
    {
        let writer = self.writer.lock();
        let current = self.clone_ring_snapshot();
        self.publish(&writer, f(&current));
    }

    /// Swap in `next`. Only called with the writer lock held.
    fn publish(&self, _writer: &MutexGuard<'_, ()>, next: RingSnapshot) {
        *self.ring.write() = Arc::new(next);
        self.ring_version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for TokenMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMetadata")
            .field("tokens", &self.ring.read().len())
            .field("pending", &self.pending_count())
            .field("ring_version", &self.ring_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn two_node_metadata() -> (TokenMetadata, Endpoint, Endpoint) {
        let a = addr("10.0.0.1:7000");
        let b = addr("10.0.0.2:7000");
        let metadata = TokenMetadata::new();
        metadata.update_normal_tokens(&[Token::new(10)], a);
        metadata.update_normal_tokens(&[Token::new(50)], b);
        (metadata, a, b)
    }

    #[test]
    fn test_get_endpoint_before_and_after_assignment() {
        let metadata = TokenMetadata::new();
        let a = addr("10.0.0.1:7000");

        assert_eq!(metadata.get_endpoint(&Token::new(10)), None);
        metadata.update_normal_tokens(&[Token::new(10)], a);
        assert_eq!(metadata.get_endpoint(&Token::new(10)), Some(a));
        assert_eq!(metadata.get_endpoint(&Token::new(11)), None);
    }

    #[test]
    fn test_vnodes_per_endpoint() {
        let metadata = TokenMetadata::new();
        let a = addr("10.0.0.1:7000");
        metadata.update_normal_tokens(&[Token::new(30), Token::new(10), Token::new(70)], a);

        assert_eq!(
            metadata.tokens_for(&a),
            vec![Token::new(10), Token::new(30), Token::new(70)]
        );
        assert_eq!(metadata.sorted_tokens().len(), 3);
        assert!(metadata.is_member(&a));
    }

    #[test]
    fn test_reassigned_token_moves_owner() {
        let (metadata, a, b) = two_node_metadata();

        metadata.update_normal_tokens(&[Token::new(10)], b);

        assert_eq!(metadata.get_endpoint(&Token::new(10)), Some(b));
        assert!(metadata.tokens_for(&a).is_empty());
        assert!(!metadata.is_member(&a));
        assert_eq!(metadata.tokens_for(&b), vec![Token::new(10), Token::new(50)]);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutation() {
        let (metadata, _, b) = two_node_metadata();
        let snapshot = metadata.clone_ring_snapshot();
        let version = metadata.ring_version();

        let c = addr("10.0.0.3:7000");
        metadata.update_normal_tokens(&[Token::new(80)], c);
        metadata.remove_endpoint(&b);

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get_endpoint(&Token::new(50)), Some(b));
        assert_eq!(snapshot.get_endpoint(&Token::new(80)), None);
        assert_eq!(metadata.ring_version(), version + 2);
    }

    #[test]
    fn test_successor_and_predecessor_wrap() {
        let (metadata, a, b) = two_node_metadata();
        let ring = metadata.clone_ring_snapshot();

        assert_eq!(ring.successor_index(&Token::new(5)), Some(0));
        assert_eq!(ring.successor_index(&Token::new(10)), Some(0));
        assert_eq!(ring.successor_index(&Token::new(11)), Some(1));
        assert_eq!(ring.successor_index(&Token::new(60)), Some(0));

        assert_eq!(ring.predecessor(&Token::new(10)), Some(Token::new(50)));
        assert_eq!(ring.predecessor(&Token::new(50)), Some(Token::new(10)));
        assert_eq!(ring.predecessor(&Token::new(30)), Some(Token::new(10)));
        assert_eq!(ring.predecessor(&Token::new(5)), Some(Token::new(50)));
        assert_eq!(ring.predecessor(&Token::new(70)), Some(Token::new(50)));

        let walk: Vec<Endpoint> = ring
            .ring_iter_from(&Token::new(60))
            .map(|e| e.endpoint)
            .collect();
        assert_eq!(walk, vec![a, b]);
    }

    #[test]
    fn test_primary_ranges() {
        let (metadata, a, b) = two_node_metadata();
        let ring = metadata.clone_ring_snapshot();

        assert_eq!(
            ring.primary_ranges_for(&a),
            vec![Range::new(Token::new(50), Token::new(10))]
        );
        assert_eq!(
            ring.primary_ranges_for(&b),
            vec![Range::new(Token::new(10), Token::new(50))]
        );
        assert_eq!(ring.primary_range_for(&Token::new(30)), None);
    }

    #[test]
    fn test_single_token_owns_full_ring() {
        let a = addr("10.0.0.1:7000");
        let ring = RingSnapshot::from_assignments([(Token::new(10), a)]);
        let range = ring.primary_range_for(&Token::new(10)).unwrap();
        assert!(range.is_full_ring());
    }

    #[test]
    fn test_with_tokens_leaves_original_untouched() {
        let (metadata, _, _) = two_node_metadata();
        let ring = metadata.clone_ring_snapshot();
        let c = addr("10.0.0.3:7000");

        let projected = ring.with_tokens(&[Token::new(30)], c);

        assert_eq!(projected.get_endpoint(&Token::new(30)), Some(c));
        assert_eq!(ring.get_endpoint(&Token::new(30)), None);
    }

    #[test]
    fn test_pending_ranges_bookkeeping() {
        let (metadata, a, _) = two_node_metadata();
        let c = addr("10.0.0.3:7000");
        let r1 = Range::new(Token::new(10), Token::new(30));
        let r2 = Range::new(Token::new(50), Token::new(70));

        metadata.add_pending_range("ks1", r1, c);
        metadata.add_pending_range("ks1", r1, c);
        metadata.add_pending_range("ks1", r2, c);
        metadata.add_pending_range("ks1", r2, a);
        metadata.add_pending_range("ks2", r1, c);

        assert_eq!(metadata.pending_count(), 4);
        assert_eq!(metadata.pending_ranges_for("ks1", &c), vec![r1, r2]);
        assert_eq!(metadata.pending_endpoints_for("ks1", &Token::new(60)), {
            let mut both = vec![a, c];
            both.sort();
            both
        });

        assert_eq!(metadata.remove_pending_ranges_for("ks1", &c), 2);
        assert!(metadata.pending_ranges_for("ks1", &c).is_empty());
        assert_eq!(metadata.pending_ranges("ks1").len(), 1);
        assert_eq!(metadata.pending_ranges_for("ks2", &c), vec![r1]);
        assert_eq!(metadata.remove_pending_ranges_for("missing", &c), 0);
    }

    #[test]
    fn test_remove_endpoint_drops_pending() {
        let (metadata, a, b) = two_node_metadata();
        let c = addr("10.0.0.3:7000");
        metadata.add_pending_range("ks1", Range::new(Token::new(10), Token::new(30)), c);

        metadata.remove_endpoint(&c);
        metadata.remove_endpoint(&a);

        assert_eq!(metadata.pending_count(), 0);
        assert_eq!(metadata.endpoints(), vec![b]);
        assert_eq!(metadata.get_endpoint(&Token::new(10)), None);
    }

    #[test]
    fn test_remove_endpoint_is_one_ring_change() {
        let (metadata, a, b) = two_node_metadata();
        metadata.add_pending_range("ks1", Range::new(Token::new(10), Token::new(30)), a);
        let version = metadata.ring_version();

        metadata.remove_endpoint(&a);

        assert_eq!(metadata.ring_version(), version + 1);
        assert!(!metadata.is_member(&a));
        assert!(metadata.pending_ranges_for("ks1", &a).is_empty());
        assert_eq!(metadata.endpoints(), vec![b]);
    }

    #[test]
    fn test_concurrent_removals_leave_no_pending_behind() {
        let metadata = Arc::new(TokenMetadata::new());
        let endpoints: Vec<Endpoint> = (1..=8)
            .map(|n| addr(&format!("10.0.0.{}:7000", n)))
            .collect();
        for (i, endpoint) in endpoints.iter().enumerate() {
            metadata.update_normal_tokens(&[Token::new(i as u64 * 10)], *endpoint);
            metadata.add_pending_range("ks1", Range::new(Token::new(0), Token::new(5)), *endpoint);
        }
        let version = metadata.ring_version();

        let handles: Vec<_> = endpoints
            .iter()
            .copied()
            .map(|endpoint| {
                let metadata = Arc::clone(&metadata);
                std::thread::spawn(move || metadata.remove_endpoint(&endpoint))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metadata.ring_version(), version + endpoints.len() as u64);
        assert!(metadata.endpoints().is_empty());
        assert_eq!(metadata.pending_count(), 0);
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let metadata = Arc::new(TokenMetadata::new());
        let a = addr("10.0.0.1:7000");

        let writer = {
            let metadata = Arc::clone(&metadata);
            std::thread::spawn(move || {
                for i in 0..200u64 {
                    metadata.update_normal_tokens(&[Token::new(i * 2)], a);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let metadata = Arc::clone(&metadata);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snapshot = metadata.clone_ring_snapshot();
                        let tokens = snapshot.sorted_tokens();
                        assert!(tokens.windows(2).all(|w| w[0] < w[1]));
                        assert_eq!(snapshot.tokens_for(&a).len(), tokens.len());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(metadata.sorted_tokens().len(), 200);
    }
}
