//! Testing utilities for ring admission.
//!
//! In-memory stand-ins for the collaborators a bootstrap needs, so that
//! joins can be driven end to end inside one process:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     TestRing fixture                         │
//! │                                                              │
//! │   TokenMetadata ◄── RecordingMembership (finish_bootstrapping) │
//! │        │                                                     │
//! │        ▼                                                     │
//! │   Keyspaces ──► RangeStreamer ──► ScriptedTransport (sources) │
//! │                      │                                       │
//! │                      ├──► StaticFailureDetector (liveness)   │
//! │                      ▼                                       │
//! │                 MemoryStore (local rows)                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`ScriptedTransport`] serves rows per (source, keyspace) and can be told
//!   to fail or stall for a source.
//! - [`MemoryStore`] records every applied row.
//! - [`RecordingMembership`] records `finish_bootstrapping` calls and can
//!   refuse them.
//! - [`StaticFailureDetector`] is a settable liveness table.


use crate::bootstrap::Collaborators;
use crate::cluster::{ClusterMembership, FailureDetector};
use crate::dht::{Partitioner, Range, RingPartitioner, Token};
use crate::error::{BootstrapFailure, StreamError};
use crate::locator::{Keyspaces, ReplicationStrategy, SimpleStrategy, TokenMetadata};
use crate::streaming::{LocalStore, RowBatch, StreamCursor, StreamTransport, StreamedRow};
use crate::types::Endpoint;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Address for test node `n` (`10.0.0.n:7000`).
pub fn endpoint(n: u8) -> Endpoint {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 7000)
}

/// Transport serving preloaded rows.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    /// Rows each source holds, per keyspace.
    rows: RwLock<HashMap<(Endpoint, String), Vec<StreamedRow>>>,

    /// Sources whose fetches fail, with the reported reason.
    failing: RwLock<HashMap<Endpoint, String>>,

    /// Sources whose fetches never complete.
    stalled: RwLock<HashSet<Endpoint>>,

    /// Artificial latency per fetch.
    delay: Mutex<Option<Duration>>,

    /// Every fetch issued: (source, keyspace, range).
    fetches: Mutex<Vec<(Endpoint, String, Range)>>,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sequence: AtomicU64,
}

impl ScriptedTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `source` rows for `keyspace`.
    pub fn insert_rows(
        &self,
        source: Endpoint,
        keyspace: &str,
        rows: impl IntoIterator<Item = StreamedRow>,
    ) {
        let mut all = self.rows.write();
        let held = all.entry((source, keyspace.to_string())).or_default();
        held.extend(rows);
        held.sort_by(|a, b| (a.token, &a.key).cmp(&(b.token, &b.key)));
        held.dedup_by(|a, b| a.token == b.token && a.key == b.key);
    }

    /// Give `source` one row per token, keyed by the token's decimal form.
    pub fn insert_token_rows(
        &self,
        source: Endpoint,
        keyspace: &str,
        tokens: impl IntoIterator<Item = u64>,
    ) {
        self.insert_rows(
            source,
            keyspace,
            tokens.into_iter().map(|t| {
                StreamedRow::new(
                    Token::new(t),
                    t.to_string().into_bytes(),
                    format!("row-{}", t).into_bytes(),
                )
            }),
        );
    }

    /// Make fetches from `source` fail.
    pub fn fail_source(&self, source: Endpoint, reason: impl Into<String>) {
        self.failing.write().insert(source, reason.into());
    }

    /// Make fetches from `source` hang.
    pub fn stall_source(&self, source: Endpoint) {
        self.stalled.write().insert(source);
    }

    /// Delay every fetch.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Fetches issued so far.
    pub fn fetches(&self) -> Vec<(Endpoint, String, Range)> {
        self.fetches.lock().clone()
    }

    /// Highest number of fetches that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_batch(
        &self,
        source: Endpoint,
        keyspace: &str,
        range: &Range,
        resume_after: Option<&StreamCursor>,
        batch_size: usize,
    ) -> RowBatch {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let all = self.rows.read();
        let Some(held) = all.get(&(source, keyspace.to_string())) else {
            return RowBatch::empty_final(sequence);
        };

        let remaining: Vec<&StreamedRow> = held
            .iter()
            .filter(|row| range.contains(row.token))
            .filter(|row| resume_after.map_or(true, |cursor| cursor.is_before(row)))
            .collect();
        let is_final = remaining.len() <= batch_size;
        let rows = remaining.into_iter().take(batch_size).cloned().collect();
        RowBatch::new(sequence, rows, is_final)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn fetch_batch(
        &self,
        source: Endpoint,
        keyspace: &str,
        range: &Range,
        resume_after: Option<&StreamCursor>,
        batch_size: usize,
    ) -> Result<RowBatch, StreamError> {
        self.fetches.lock().push((source, keyspace.to_string(), *range));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let stalled = self.stalled.read().contains(&source);
        if stalled {
            std::future::pending::<()>().await;
        }

        let failure = self.failing.read().get(&source).cloned();
        if let Some(reason) = failure {
            return Err(StreamError::Transfer {
                endpoint: source,
                keyspace: keyspace.to_string(),
                range: *range,
                reason,
            });
        }

        Ok(self.next_batch(source, keyspace, range, resume_after, batch_size))
    }
}

/// Local store keeping rows in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, Vec<StreamedRow>>>,
    batches: AtomicU64,
    failing: RwLock<HashSet<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse batches for `keyspace`.
    pub fn fail_keyspace(&self, keyspace: &str) {
        self.failing.write().insert(keyspace.to_string());
    }

    /// Tokens of every row stored for `keyspace`, sorted.
    pub fn tokens(&self, keyspace: &str) -> Vec<u64> {
        let mut tokens: Vec<u64> = self
            .rows
            .lock()
            .get(keyspace)
            .map(|rows| rows.iter().map(|r| r.token.value()).collect())
            .unwrap_or_default();
        tokens.sort_unstable();
        tokens
    }

    /// Number of rows stored for `keyspace`.
    pub fn row_count(&self, keyspace: &str) -> usize {
        self.rows.lock().get(keyspace).map_or(0, Vec::len)
    }

    /// Number of batches applied.
    pub fn batches_applied(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn apply_batch(
        &self,
        keyspace: &str,
        range: &Range,
        batch: &RowBatch,
    ) -> Result<u64, StreamError> {
        if self.failing.read().contains(keyspace) {
            return Err(StreamError::Apply {
                keyspace: keyspace.to_string(),
                range: *range,
                reason: "store is read-only".to_string(),
            });
        }
        self.rows
            .lock()
            .entry(keyspace.to_string())
            .or_default()
            .extend(batch.rows.iter().cloned());
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(batch.len() as u64)
    }
}

/// Membership recording announcements.
#[derive(Debug)]
pub struct RecordingMembership {
    partitioner: Arc<dyn Partitioner>,
    joining: Mutex<Vec<(Endpoint, Vec<Token>)>>,
    finished: Mutex<Vec<(Endpoint, Vec<Token>)>>,
    refusal: Mutex<Option<String>>,
}

impl RecordingMembership {
    /// Create membership over `partitioner`.
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            partitioner,
            joining: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            refusal: Mutex::new(None),
        }
    }

    /// Refuse every `finish_bootstrapping` call.
    pub fn refuse(&self, reason: impl Into<String>) {
        *self.refusal.lock() = Some(reason.into());
    }

    /// `announce_joining` calls so far.
    pub fn joining(&self) -> Vec<(Endpoint, Vec<Token>)> {
        self.joining.lock().clone()
    }

    /// `finish_bootstrapping` calls so far, including refused ones.
    pub fn finished(&self) -> Vec<(Endpoint, Vec<Token>)> {
        self.finished.lock().clone()
    }
}

#[async_trait]
impl ClusterMembership for RecordingMembership {
    fn partitioner(&self) -> Arc<dyn Partitioner> {
        self.partitioner.clone()
    }

    async fn announce_joining(&self, endpoint: Endpoint, tokens: &[Token]) {
        self.joining.lock().push((endpoint, tokens.to_vec()));
    }

    async fn finish_bootstrapping(
        &self,
        endpoint: Endpoint,
        tokens: &[Token],
    ) -> Result<(), BootstrapFailure> {
        self.finished.lock().push((endpoint, tokens.to_vec()));
        match self.refusal.lock().clone() {
            Some(reason) => Err(BootstrapFailure::Membership(reason)),
            None => Ok(()),
        }
    }
}

/// Failure detector with a settable live set.
#[derive(Debug, Default)]
pub struct StaticFailureDetector {
    alive: RwLock<HashSet<Endpoint>>,
}

impl StaticFailureDetector {
    /// Create a detector reporting `alive` as live.
    pub fn new(alive: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            alive: RwLock::new(alive.into_iter().collect()),
        }
    }

    /// Report `endpoint` as down.
    pub fn mark_down(&self, endpoint: Endpoint) {
        self.alive.write().remove(&endpoint);
    }

    /// Report `endpoint` as live.
    pub fn mark_up(&self, endpoint: Endpoint) {
        self.alive.write().insert(endpoint);
    }
}

impl FailureDetector for StaticFailureDetector {
    fn is_alive(&self, endpoint: &Endpoint) -> bool {
        self.alive.read().contains(endpoint)
    }
}

/// A small ring with in-memory collaborators.
///
/// Endpoints `A` (`10.0.0.1`) and `B` (`10.0.0.2`) own tokens 10 and 50 on a
/// ring of size 100 and are live. Keyspace `users` replicates twice, so any
/// range a third node takes needs data from both of them.
pub struct TestRing {
    pub partitioner: Arc<RingPartitioner>,
    pub metadata: Arc<TokenMetadata>,
    pub keyspaces: Arc<Keyspaces>,
    pub membership: Arc<RecordingMembership>,
    pub detector: Arc<StaticFailureDetector>,
    pub transport: Arc<ScriptedTransport>,
    pub store: Arc<MemoryStore>,
}

impl TestRing {
    /// Keyspace replicated on every ring member.
    pub const KEYSPACE: &'static str = "users";

    /// First existing member.
    pub fn a() -> Endpoint {
        endpoint(1)
    }

    /// Second existing member.
    pub fn b() -> Endpoint {
        endpoint(2)
    }

    /// The joining node.
    pub fn c() -> Endpoint {
        endpoint(3)
    }

    /// Build the fixture. Each of A and B holds a row at every token.
    pub fn new() -> Self {
        let partitioner = Arc::new(RingPartitioner::with_ring_size(100));
        let metadata = Arc::new(TokenMetadata::new());
        metadata.update_normal_tokens(&[Token::new(10)], Self::a());
        metadata.update_normal_tokens(&[Token::new(50)], Self::b());

        let strategy: Arc<dyn ReplicationStrategy> = Arc::new(SimpleStrategy::new(2));
        let keyspaces = Arc::new(
            Keyspaces::new()
                .with_keyspace("system", Arc::new(SimpleStrategy::new(1)))
                .with_keyspace(Self::KEYSPACE, strategy),
        );

        let transport = Arc::new(ScriptedTransport::new());
        transport.insert_token_rows(Self::a(), Self::KEYSPACE, 0..100);
        transport.insert_token_rows(Self::b(), Self::KEYSPACE, 0..100);

        Self {
            membership: Arc::new(RecordingMembership::new(partitioner.clone())),
            partitioner,
            metadata,
            keyspaces,
            detector: Arc::new(StaticFailureDetector::new([Self::a(), Self::b()])),
            transport,
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Collaborators for a bootstrapper joining this ring.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            membership: self.membership.clone(),
            strategies: self.keyspaces.clone(),
            failure_detector: self.detector.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
        }
    }
}

impl Default for TestRing {
    fn default() -> Self {
        Self::new()
    }
}
