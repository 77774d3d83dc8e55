//! Token resolution and the admission state machine.

use crate::cluster::{ClusterMembership, FailureDetector};
use crate::config::{BootstrapConfig, StreamingConfig};
use crate::dht::{Partitioner, Token};
use crate::error::{BootstrapFailure, ConfigurationError, Result, StreamError};
use crate::locator::{ReplicationStrategyProvider, TokenMetadata};
use crate::streaming::{
    FailureDetectorSourceFilter, LocalStore, RangeStreamer, StreamProgress, StreamSummary,
    StreamTransport,
};
use crate::types::{BootstrapState, Endpoint};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolve the tokens a joining node will own.
///
/// Explicit tokens from `config` win over the vnode count. Every explicit
/// token must parse and be unowned, otherwise the whole list is rejected.
/// Without explicit tokens, `num_tokens` random unowned tokens are drawn.
pub fn get_bootstrap_tokens(
    metadata: &TokenMetadata,
    partitioner: &dyn Partitioner,
    config: &BootstrapConfig,
) -> std::result::Result<Vec<Token>, ConfigurationError> {
    if config.has_initial_tokens() {
        let mut tokens = Vec::with_capacity(config.initial_tokens.len());
        let mut seen = HashSet::with_capacity(config.initial_tokens.len());
        for raw in &config.initial_tokens {
            let token = partitioner
                .token_from_string(raw)
                .map_err(|source| ConfigurationError::InvalidToken {
                    token: raw.clone(),
                    source,
                })?;
            if let Some(owner) = metadata.get_endpoint(&token) {
                return Err(ConfigurationError::TokenAlreadyOwned { token, owner });
            }
            if !seen.insert(token) {
                return Err(ConfigurationError::DuplicateToken(token));
            }
            tokens.push(token);
        }
        info!(tokens = tokens.len(), "Using explicit initial tokens");
        return Ok(tokens);
    }

    let num_tokens = config.num_tokens;
    if num_tokens < 1 {
        return Err(ConfigurationError::InvalidNumTokens(num_tokens));
    }
    if num_tokens == 1 {
        warn!("Picking a random token for a single vnode; set initial tokens to control placement");
    }

    let tokens = get_random_tokens(metadata, partitioner, num_tokens)?;
    info!(tokens = tokens.len(), "Generated random tokens");
    Ok(tokens)
}

/// Draw `n` distinct tokens nobody owns, in ring order.
///
/// Candidates are checked against the live ring when drawn, so a token
/// taken by a concurrent local writer is never returned. Another node may
/// still pick the same token at the same time; that is only caught when
/// the join is announced.
///
/// Fails if the ring does not have `n` free positions.
pub fn get_random_tokens(
    metadata: &TokenMetadata,
    partitioner: &dyn Partitioner,
    n: usize,
) -> std::result::Result<Vec<Token>, ConfigurationError> {
    let owned = metadata.sorted_tokens().len() as u128;
    if n as u128 > partitioner.ring_size().saturating_sub(owned) {
        return Err(ConfigurationError::InvalidNumTokens(n));
    }

    let mut tokens = BTreeSet::new();
    while tokens.len() < n {
        let token = partitioner.random_token();
        if metadata.get_endpoint(&token).is_none() {
            tokens.insert(token);
        }
    }
    Ok(tokens.into_iter().collect())
}

/// Services a bootstrap depends on.
#[derive(Clone)]
pub struct Collaborators {
    /// Announces the node once it has its data.
    pub membership: Arc<dyn ClusterMembership>,

    /// Keyspaces and their replication strategies.
    pub strategies: Arc<dyn ReplicationStrategyProvider>,

    /// Liveness of stream sources.
    pub failure_detector: Arc<dyn FailureDetector>,

    /// Pulls rows from sources.
    pub transport: Arc<dyn StreamTransport>,

    /// Receives rows locally.
    pub store: Arc<dyn LocalStore>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("strategies", &self.strategies)
            .field("failure_detector", &self.failure_detector)
            .finish_non_exhaustive()
    }
}

/// Drives one admission attempt for a joining node.
///
/// ```text
/// Joining ──► Streaming ──► Normal
///    │            │
///    └────────────┴──► Failed
/// ```
///
/// A bootstrapper runs once. After a failure the pending ranges it
/// registered stay in place and a new attempt needs a new bootstrapper.
pub struct BootStrapper {
    address: Endpoint,
    tokens: Vec<Token>,
    metadata: Arc<TokenMetadata>,
    collaborators: Collaborators,
    streaming: StreamingConfig,

    /// Every state entered, in order.
    transitions: Mutex<Vec<BootstrapState>>,

    /// Progress of the last fetch.
    progress: Mutex<Vec<StreamProgress>>,

    started: AtomicBool,
    cancellation: CancellationToken,
}

impl BootStrapper {
    /// Create a bootstrapper for `address` taking `tokens`.
    pub fn new(
        address: Endpoint,
        tokens: Vec<Token>,
        metadata: Arc<TokenMetadata>,
        collaborators: Collaborators,
    ) -> std::result::Result<Self, ConfigurationError> {
        if tokens.is_empty() {
            return Err(ConfigurationError::NoTokens);
        }
        let mut seen = HashSet::with_capacity(tokens.len());
        if let Some(duplicate) = tokens.iter().find(|t| !seen.insert(**t)) {
            return Err(ConfigurationError::DuplicateToken(*duplicate));
        }

        Ok(Self {
            address,
            tokens,
            metadata,
            collaborators,
            streaming: StreamingConfig::default(),
            transitions: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        })
    }

    /// Set streaming configuration.
    pub fn with_streaming_config(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Get the joining address.
    pub fn address(&self) -> Endpoint {
        self.address
    }

    /// Get the tokens being bootstrapped.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Current state, or `None` before `bootstrap` is called.
    pub fn state(&self) -> Option<BootstrapState> {
        self.transitions.lock().last().copied()
    }

    /// Every state entered so far.
    pub fn transitions(&self) -> Vec<BootstrapState> {
        self.transitions.lock().clone()
    }

    /// Per-range progress of the fetch.
    pub fn progress(&self) -> Vec<StreamProgress> {
        self.progress.lock().clone()
    }

    /// Abort the bootstrap. An in-flight or later `bootstrap` call fails
    /// with [`BootstrapFailure::Interrupted`].
    pub fn interrupt(&self) {
        info!(address = %self.address, "Interrupting bootstrap");
        self.cancellation.cancel();
    }

    fn enter(&self, next: BootstrapState) {
        let mut transitions = self.transitions.lock();
        if let Some(current) = transitions.last() {
            if !current.can_transition_to(next) {
                warn!(%current, %next, "Ignoring illegal bootstrap transition");
                return;
            }
        }
        debug!(address = %self.address, state = %next, "Bootstrap state change");
        transitions.push(next);
    }

    /// Stream every range this node will own, then announce it as normal.
    pub async fn bootstrap(&self) -> std::result::Result<StreamSummary, BootstrapFailure> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BootstrapFailure::AlreadyStarted);
        }

        self.enter(BootstrapState::Joining);
        info!(address = %self.address, tokens = self.tokens.len(), "Beginning bootstrap");

        match self.run().await {
            Ok(summary) => {
                self.enter(BootstrapState::Normal);
                info!(
                    address = %self.address,
                    ranges = summary.transfers,
                    rows = summary.rows,
                    "Bootstrap complete"
                );
                Ok(summary)
            }
            Err(e) => {
                self.enter(BootstrapState::Failed);
                error!(address = %self.address, error = %e, "Bootstrap failed");
                Err(e)
            }
        }
    }

    async fn run(&self) -> std::result::Result<StreamSummary, BootstrapFailure> {
        let Collaborators {
            membership,
            strategies,
            failure_detector,
            transport,
            store,
        } = &self.collaborators;

        membership.announce_joining(self.address, &self.tokens).await;

        let ring = self.metadata.clone_ring_snapshot();
        let mut streamer = RangeStreamer::new(
            self.address,
            ring.clone(),
            strategies.clone(),
            failure_detector.clone(),
            transport.clone(),
            store.clone(),
            self.streaming.clone(),
        )
        .with_cancellation(self.cancellation.clone());

        // Nobody holds any data yet, so there is nothing to stream.
        let keyspaces = if ring.is_empty() {
            info!(address = %self.address, "Ring is empty, joining without streaming");
            Vec::new()
        } else {
            strategies.non_system_keyspaces()
        };
        for keyspace in &keyspaces {
            let Some(strategy) = strategies.strategy(keyspace) else {
                warn!(%keyspace, "Keyspace has no replication strategy, skipping");
                continue;
            };
            let ranges = strategy.pending_ranges_for(&ring, &self.tokens, self.address);
            debug!(%keyspace, ranges = ranges.len(), "Computed ranges to fetch");
            for range in &ranges {
                self.metadata.add_pending_range(keyspace, *range, self.address);
            }
            streamer.add_ranges(keyspace, ranges);
        }
        streamer.add_source_filter(Arc::new(FailureDetectorSourceFilter::new(
            failure_detector.clone(),
        )));

        self.enter(BootstrapState::Streaming);
        let fetched = streamer.fetch().await;
        *self.progress.lock() = streamer.progress();
        let summary = fetched.map_err(|e| match e {
            StreamError::Cancelled => BootstrapFailure::Interrupted,
            other => BootstrapFailure::Stream(other),
        })?;

        if self.cancellation.is_cancelled() {
            return Err(BootstrapFailure::Interrupted);
        }

        membership
            .finish_bootstrapping(self.address, &self.tokens)
            .await?;

        for keyspace in &keyspaces {
            self.metadata
                .remove_pending_ranges_for(keyspace, &self.address);
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for BootStrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootStrapper")
            .field("address", &self.address)
            .field("tokens", &self.tokens.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Admit `address` to the ring: resolve its tokens, stream its data and
/// announce it. Returns the tokens it now owns.
pub async fn join_ring(
    address: Endpoint,
    config: &BootstrapConfig,
    metadata: Arc<TokenMetadata>,
    collaborators: Collaborators,
) -> Result<Vec<Token>> {
    config.validate()?;

    let partitioner = collaborators.membership.partitioner();
    let tokens = get_bootstrap_tokens(&metadata, partitioner.as_ref(), config)?;

    let bootstrapper = BootStrapper::new(address, tokens.clone(), metadata, collaborators)?
        .with_streaming_config(config.streaming.clone());
    bootstrapper.bootstrap().await?;
    Ok(tokens)
}
