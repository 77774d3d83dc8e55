//! Fetches ranges from live replicas into local storage.
//!
//! A streamer is loaded with (keyspace, range) requirements and source
//! filters, then [`RangeStreamer::fetch`] picks one source per requirement
//! and copies the rows over, several ranges at a time. The whole fetch
//! succeeds only if every range arrives; the first failure aborts the rest.

use crate::cluster::FailureDetector;
use crate::config::StreamingConfig;
use crate::dht::Range;
use crate::error::StreamError;
use crate::locator::{ReplicationStrategyProvider, RingSnapshot};
use crate::streaming::source_filter::SourceFilter;
use crate::streaming::transfer::{StreamCursor, StreamProgress, StreamRequirement};
use crate::streaming::transport::{LocalStore, StreamTransport};
use crate::types::Endpoint;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A requirement paired with the replica chosen to serve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransfer {
    /// What to fetch.
    pub requirement: StreamRequirement,

    /// Where to fetch it from.
    pub source: Endpoint,
}

/// Source assignment for every requirement of a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchPlan {
    transfers: Vec<PlannedTransfer>,
}

impl FetchPlan {
    /// Transfers in the order requirements were added.
    pub fn transfers(&self) -> &[PlannedTransfer] {
        &self.transfers
    }

    /// Number of transfers.
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Check if there is nothing to fetch.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Requirements grouped by source.
    pub fn by_source(&self) -> BTreeMap<Endpoint, Vec<StreamRequirement>> {
        let mut grouped: BTreeMap<Endpoint, Vec<StreamRequirement>> = BTreeMap::new();
        for transfer in &self.transfers {
            grouped
                .entry(transfer.source)
                .or_default()
                .push(transfer.requirement.clone());
        }
        grouped
    }

    /// Source chosen for a requirement.
    pub fn source_for(&self, keyspace: &str, range: &Range) -> Option<Endpoint> {
        self.transfers
            .iter()
            .find(|t| t.requirement.keyspace == keyspace && t.requirement.range == *range)
            .map(|t| t.source)
    }
}

/// Totals of a completed fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Fetch session id.
    pub session_id: Uuid,

    /// Ranges transferred.
    pub transfers: usize,

    /// Rows applied locally.
    pub rows: u64,

    /// Payload bytes applied locally.
    pub bytes: u64,
}

/// State shared with transfer tasks.
#[derive(Clone)]
struct TransferContext {
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn LocalStore>,
    detector: Arc<dyn FailureDetector>,
    progress: Arc<Mutex<Vec<StreamProgress>>>,
    cancellation: CancellationToken,
    batch_size: usize,
    liveness_check_interval: Duration,
}

/// Streams ranges owned by other replicas to the local node.
pub struct RangeStreamer {
    /// This node; never chosen as a source.
    local: Endpoint,

    /// Ring the sources are computed against.
    ring: Arc<RingSnapshot>,

    /// Replication strategy lookup.
    strategies: Arc<dyn ReplicationStrategyProvider>,

    /// Liveness used to watch in-flight sources.
    detector: Arc<dyn FailureDetector>,

    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn LocalStore>,
    config: StreamingConfig,

    /// Correlates every log line of one fetch.
    session_id: Uuid,

    requirements: Vec<StreamRequirement>,
    filters: Vec<Arc<dyn SourceFilter>>,

    /// Per-transfer progress, indexed like the fetch plan.
    progress: Arc<Mutex<Vec<StreamProgress>>>,

    cancellation: CancellationToken,
}

impl RangeStreamer {
    /// Create a streamer for `local` working from `ring`.
    pub fn new(
        local: Endpoint,
        ring: Arc<RingSnapshot>,
        strategies: Arc<dyn ReplicationStrategyProvider>,
        detector: Arc<dyn FailureDetector>,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn LocalStore>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            local,
            ring,
            strategies,
            detector,
            transport,
            store,
            config,
            session_id: Uuid::new_v4(),
            requirements: Vec::new(),
            filters: Vec::new(),
            progress: Arc::new(Mutex::new(Vec::new())),
            cancellation: CancellationToken::new(),
        }
    }

    /// Use `token` to cancel the fetch.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Get the session id.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Require `ranges` of `keyspace`.
    pub fn add_ranges(&mut self, keyspace: &str, ranges: impl IntoIterator<Item = Range>) {
        for range in ranges {
            let requirement = StreamRequirement::new(keyspace, range);
            if !self.requirements.contains(&requirement) {
                debug!(session_id = %self.session_id, %requirement, "Adding range to fetch");
                self.requirements.push(requirement);
            }
        }
    }

    /// Only stream from sources `filter` accepts.
    pub fn add_source_filter(&mut self, filter: Arc<dyn SourceFilter>) {
        self.filters.push(filter);
    }

    /// Requirements added so far.
    pub fn requirements(&self) -> &[StreamRequirement] {
        &self.requirements
    }

    /// Progress of each transfer of the current or last fetch.
    pub fn progress(&self) -> Vec<StreamProgress> {
        self.progress.lock().clone()
    }

    /// Cancel an in-flight fetch.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Choose a source for every requirement.
    ///
    /// Candidates are tried in the strategy's preference order; the first
    /// one passing every filter wins. Fails if any requirement is left
    /// without a source.
    pub fn fetch_plan(&self) -> Result<FetchPlan, StreamError> {
        let mut transfers = Vec::with_capacity(self.requirements.len());
        for requirement in &self.requirements {
            let source = self.select_source(requirement)?;
            debug!(session_id = %self.session_id, %requirement, %source, "Selected stream source");
            transfers.push(PlannedTransfer {
                requirement: requirement.clone(),
                source,
            });
        }
        Ok(FetchPlan { transfers })
    }

    fn select_source(&self, requirement: &StreamRequirement) -> Result<Endpoint, StreamError> {
        let no_source = || StreamError::NoLiveSource {
            keyspace: requirement.keyspace.clone(),
            range: requirement.range,
        };

        let Some(strategy) = self.strategies.strategy(&requirement.keyspace) else {
            warn!(keyspace = %requirement.keyspace, "No replication strategy for keyspace");
            return Err(no_source());
        };

        strategy
            .range_sources(&self.ring, &requirement.range)
            .into_iter()
            .filter(|candidate| *candidate != self.local)
            .find(|candidate| {
                self.filters.iter().all(|filter| {
                    let keep = filter.should_include(candidate);
                    if !keep {
                        debug!(%candidate, filter = filter.name(), "Source rejected");
                    }
                    keep
                })
            })
            .ok_or_else(no_source)
    }

    /// Stream every required range.
    ///
    /// Runs at most `max_concurrent_transfers` transfers at once. Rows
    /// already applied are kept if the fetch fails.
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id, local = %self.local))]
    pub async fn fetch(&self) -> Result<StreamSummary, StreamError> {
        let plan = self.fetch_plan()?;
        if self.cancellation.is_cancelled() {
            return Err(StreamError::Cancelled);
        }

        *self.progress.lock() = plan
            .transfers()
            .iter()
            .map(|t| StreamProgress::new(self.session_id, t.requirement.clone(), t.source))
            .collect();

        info!(
            transfers = plan.len(),
            sources = plan.by_source().len(),
            "Starting range fetch"
        );

        let ctx = TransferContext {
            transport: self.transport.clone(),
            store: self.store.clone(),
            detector: self.detector.clone(),
            progress: self.progress.clone(),
            cancellation: self.cancellation.clone(),
            batch_size: self.config.batch_size,
            liveness_check_interval: self.config.liveness_check_interval,
        };

        let max_concurrent = self.config.max_concurrent_transfers.max(1);
        let mut join_set = JoinSet::new();

        for (index, transfer) in plan.transfers.into_iter().enumerate() {
            // Limit concurrency by awaiting when at max
            if join_set.len() >= max_concurrent {
                if let Some(result) = join_set.join_next().await {
                    if let Err(e) = Self::check(result) {
                        return Err(self.abort(join_set, e).await);
                    }
                }
            }

            let ctx = ctx.clone();
            join_set.spawn(run_transfer(ctx, index, transfer));
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(e) = Self::check(result) {
                return Err(self.abort(join_set, e).await);
            }
        }

        let progress = self.progress.lock();
        let summary = StreamSummary {
            session_id: self.session_id,
            transfers: progress.len(),
            rows: progress.iter().map(|p| p.rows).sum(),
            bytes: progress.iter().map(|p| p.bytes).sum(),
        };
        info!(
            transfers = summary.transfers,
            rows = summary.rows,
            bytes = summary.bytes,
            "Range fetch complete"
        );
        Ok(summary)
    }

    fn check(result: Result<Result<(), StreamError>, JoinError>) -> Result<(), StreamError> {
        match result {
            Ok(outcome) => outcome,
            Err(e) => Err(StreamError::Task(e.to_string())),
        }
    }

    /// Stop every remaining transfer after `cause`.
    async fn abort(
        &self,
        mut join_set: JoinSet<Result<(), StreamError>>,
        cause: StreamError,
    ) -> StreamError {
        error!(
            error = %cause,
            remaining = join_set.len(),
            "Range fetch failed, aborting remaining transfers"
        );
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}

        for progress in self.progress.lock().iter_mut() {
            if !progress.complete {
                progress.mark_failed("aborted");
            }
        }
        cause
    }
}

impl std::fmt::Debug for RangeStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeStreamer")
            .field("local", &self.local)
            .field("session_id", &self.session_id)
            .field("requirements", &self.requirements.len())
            .field("filters", &self.filters)
            .finish()
    }
}

/// Copy one range, failing early if the source dies or the fetch is cancelled.
async fn run_transfer(
    ctx: TransferContext,
    index: usize,
    transfer: PlannedTransfer,
) -> Result<(), StreamError> {
    let PlannedTransfer { requirement, source } = transfer;

    let result = tokio::select! {
        biased;
        _ = ctx.cancellation.cancelled() => Err(StreamError::Cancelled),
        _ = watch_source(ctx.detector.as_ref(), source, ctx.liveness_check_interval) => {
            warn!(%source, %requirement, "Stream source convicted mid-transfer");
            Err(StreamError::SourceDown {
                endpoint: source,
                keyspace: requirement.keyspace.clone(),
                range: requirement.range,
            })
        }
        result = copy_range(&ctx, index, &requirement, source) => result,
    };

    let mut progress = ctx.progress.lock();
    if let Some(entry) = progress.get_mut(index) {
        match &result {
            Ok(()) => entry.mark_complete(),
            Err(e) => entry.mark_failed(e.to_string()),
        }
    }
    result
}

/// Resolves once `source` is no longer alive.
async fn watch_source(detector: &dyn FailureDetector, source: Endpoint, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !detector.is_alive(&source) {
            return;
        }
    }
}

async fn copy_range(
    ctx: &TransferContext,
    index: usize,
    requirement: &StreamRequirement,
    source: Endpoint,
) -> Result<(), StreamError> {
    let mut cursor: Option<StreamCursor> = None;
    loop {
        let batch = ctx
            .transport
            .fetch_batch(
                source,
                &requirement.keyspace,
                &requirement.range,
                cursor.as_ref(),
                ctx.batch_size,
            )
            .await?;

        let applied = if batch.is_empty() {
            0
        } else {
            ctx.store
                .apply_batch(&requirement.keyspace, &requirement.range, &batch)
                .await?
        };

        if let Some(entry) = ctx.progress.lock().get_mut(index) {
            entry.update(applied, batch.byte_size() as u64);
        }
        debug!(
            %source,
            %requirement,
            sequence = batch.sequence,
            rows = applied,
            is_final = batch.is_final,
            "Applied batch"
        );

        if batch.is_final {
            return Ok(());
        }
        match batch.cursor() {
            Some(next) => cursor = Some(next),
            None => {
                return Err(StreamError::Transfer {
                    endpoint: source,
                    keyspace: requirement.keyspace.clone(),
                    range: requirement.range,
                    reason: "source sent an empty non-final batch".to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::Token;
    use crate::locator::{Keyspaces, SimpleStrategy};
    use crate::streaming::source_filter::{ExcludeEndpointsFilter, FailureDetectorSourceFilter};
    use crate::testing::{endpoint, MemoryStore, ScriptedTransport, StaticFailureDetector};
    use test_log::test;

    const KS: &str = "users";

    fn range(left: u64, right: u64) -> Range {
        Range::new(Token::new(left), Token::new(right))
    }

    struct Fixture {
        ring: Arc<RingSnapshot>,
        keyspaces: Arc<Keyspaces>,
        detector: Arc<StaticFailureDetector>,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        /// A at 10, B at 50, keyspace replicated twice.
        fn new() -> Self {
            let ring = RingSnapshot::from_assignments([
                (Token::new(10), endpoint(1)),
                (Token::new(50), endpoint(2)),
            ]);
            let transport = Arc::new(ScriptedTransport::new());
            transport.insert_token_rows(endpoint(1), KS, 0..100);
            transport.insert_token_rows(endpoint(2), KS, 0..100);
            Self {
                ring: Arc::new(ring),
                keyspaces: Arc::new(
                    Keyspaces::new().with_keyspace(KS, Arc::new(SimpleStrategy::new(2))),
                ),
                detector: Arc::new(StaticFailureDetector::new([endpoint(1), endpoint(2)])),
                transport,
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn streamer(&self, config: StreamingConfig) -> RangeStreamer {
            let mut streamer = RangeStreamer::new(
                endpoint(3),
                self.ring.clone(),
                self.keyspaces.clone(),
                self.detector.clone(),
                self.transport.clone(),
                self.store.clone(),
                config,
            );
            streamer.add_source_filter(Arc::new(FailureDetectorSourceFilter::new(
                self.detector.clone(),
            )));
            streamer
        }
    }

    fn fast_config() -> StreamingConfig {
        StreamingConfig::default()
            .with_batch_size(4)
            .with_liveness_check_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_plan_prefers_strategy_order() {
        let fixture = Fixture::new();
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges(KS, [range(10, 30), range(50, 10), range(10, 30)]);
        assert_eq!(streamer.requirements().len(), 2);

        let plan = streamer.fetch_plan().unwrap();
        assert_eq!(plan.source_for(KS, &range(10, 30)), Some(endpoint(2)));
        assert_eq!(plan.source_for(KS, &range(50, 10)), Some(endpoint(1)));
        assert_eq!(plan.by_source().len(), 2);
    }

    #[test]
    fn test_plan_falls_back_to_next_live_replica() {
        let fixture = Fixture::new();
        fixture.detector.mark_down(endpoint(2));
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges(KS, [range(10, 30)]);

        let plan = streamer.fetch_plan().unwrap();
        assert_eq!(plan.source_for(KS, &range(10, 30)), Some(endpoint(1)));
    }

    #[test]
    fn test_plan_never_picks_local_endpoint() {
        let fixture = Fixture::new();
        let mut streamer = RangeStreamer::new(
            endpoint(2),
            fixture.ring.clone(),
            fixture.keyspaces.clone(),
            fixture.detector.clone(),
            fixture.transport.clone(),
            fixture.store.clone(),
            fast_config(),
        );
        streamer.add_ranges(KS, [range(10, 30)]);
        assert_eq!(
            streamer.fetch_plan().unwrap().source_for(KS, &range(10, 30)),
            Some(endpoint(1))
        );
    }

    #[test(tokio::test)]
    async fn test_no_live_source_fails_before_transfer() {
        let fixture = Fixture::new();
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_source_filter(Arc::new(ExcludeEndpointsFilter::new([endpoint(1)])));
        fixture.detector.mark_down(endpoint(2));
        streamer.add_ranges(KS, [range(10, 30), range(50, 10)]);

        let err = streamer.fetch().await.unwrap_err();
        assert_eq!(
            err,
            StreamError::NoLiveSource {
                keyspace: KS.to_string(),
                range: range(10, 30)
            }
        );
        assert!(fixture.transport.fetches().is_empty());
    }

    #[test(tokio::test)]
    async fn test_unknown_keyspace_has_no_source() {
        let fixture = Fixture::new();
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges("missing", [range(10, 30)]);
        assert!(matches!(streamer.fetch().await, Err(StreamError::NoLiveSource { .. })));
    }

    #[test(tokio::test)]
    async fn test_fetch_streams_all_rows_in_batches() {
        let fixture = Fixture::new();
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges(KS, [range(10, 30), range(50, 10)]);

        let summary = streamer.fetch().await.unwrap();
        assert_eq!(summary.transfers, 2);
        assert_eq!(summary.session_id, streamer.session_id());

        // (10,30] holds 11..=30, (50,10] holds 51..=99 and 0..=10
        let expected: Vec<u64> = (0..=30).chain(51..100).collect();
        assert_eq!(fixture.store.tokens(KS), expected);
        assert_eq!(summary.rows, expected.len() as u64);

        let progress = streamer.progress();
        assert!(progress.iter().all(StreamProgress::succeeded));
        let first = progress.iter().find(|p| p.requirement.range == range(10, 30)).unwrap();
        assert_eq!(first.source, endpoint(2));
        assert_eq!(first.rows, 20);
        assert_eq!(first.batches, 5);
    }

    #[test(tokio::test)]
    async fn test_empty_plan_succeeds() {
        let fixture = Fixture::new();
        let streamer = fixture.streamer(fast_config());
        let summary = streamer.fetch().await.unwrap();
        assert_eq!(summary.transfers, 0);
        assert_eq!(summary.rows, 0);
    }

    #[test(tokio::test)]
    async fn test_transfer_failure_fails_fetch() {
        let fixture = Fixture::new();
        fixture.transport.fail_source(endpoint(2), "connection reset");
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges(KS, [range(10, 30)]);

        let err = streamer.fetch().await.unwrap_err();
        assert!(matches!(err, StreamError::Transfer { endpoint: e, .. } if e == endpoint(2)));
        assert!(streamer.progress()[0].error.is_some());
    }

    #[test(tokio::test)]
    async fn test_apply_failure_fails_fetch() {
        let fixture = Fixture::new();
        fixture.store.fail_keyspace(KS);
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges(KS, [range(10, 30)]);

        assert!(matches!(streamer.fetch().await, Err(StreamError::Apply { .. })));
    }

    #[test(tokio::test)]
    async fn test_source_down_mid_transfer() {
        let fixture = Fixture::new();
        fixture.transport.stall_source(endpoint(2));
        let mut streamer = fixture.streamer(fast_config());
        streamer.add_ranges(KS, [range(10, 30), range(50, 10)]);

        let detector = fixture.detector.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            detector.mark_down(endpoint(2));
        });

        let err = streamer.fetch().await.unwrap_err();
        assert_eq!(
            err,
            StreamError::SourceDown {
                endpoint: endpoint(2),
                keyspace: KS.to_string(),
                range: range(10, 30)
            }
        );
        assert!(streamer.progress().iter().all(|p| p.complete));
    }

    #[test(tokio::test)]
    async fn test_cancel_stops_fetch() {
        let fixture = Fixture::new();
        fixture.transport.stall_source(endpoint(1));
        fixture.transport.stall_source(endpoint(2));
        let token = CancellationToken::new();
        let mut streamer = fixture.streamer(fast_config()).with_cancellation(token.clone());
        streamer.add_ranges(KS, [range(10, 30), range(50, 10)]);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        assert_eq!(streamer.fetch().await.unwrap_err(), StreamError::Cancelled);
    }

    #[test(tokio::test)]
    async fn test_concurrency_is_bounded() {
        let fixture = Fixture::new();
        fixture.transport.set_delay(Duration::from_millis(5));
        let mut streamer = fixture.streamer(
            fast_config()
                .with_max_concurrent_transfers(2)
                .with_batch_size(100),
        );
        streamer.add_ranges(
            KS,
            [range(10, 20), range(20, 30), range(30, 40), range(40, 50), range(50, 60)],
        );

        let summary = streamer.fetch().await.unwrap();
        assert_eq!(summary.transfers, 5);
        assert!(fixture.transport.max_in_flight() <= 2);
        assert_eq!(fixture.store.row_count(KS), 50);
    }
}
