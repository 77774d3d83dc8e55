//! Contracts for moving rows between nodes.
//!
//! The wire protocol and storage engine live outside this crate; streaming
//! only needs to pull batches from a source and hand them to local storage.

use crate::dht::Range;
use crate::error::StreamError;
use crate::streaming::transfer::{RowBatch, StreamCursor};
use crate::types::Endpoint;
use async_trait::async_trait;

/// Pulls rows of a range from a remote replica.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Fetch up to `batch_size` rows of `range` from `source`, starting after
    /// `resume_after` (or at the start of the range when `None`).
    ///
    /// The returned batch has `is_final` set once the source has no more
    /// rows for the range.
    async fn fetch_batch(
        &self,
        source: Endpoint,
        keyspace: &str,
        range: &Range,
        resume_after: Option<&StreamCursor>,
        batch_size: usize,
    ) -> Result<RowBatch, StreamError>;
}

/// Local storage receiving streamed rows.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Apply a batch, returning the number of rows written.
    async fn apply_batch(
        &self,
        keyspace: &str,
        range: &Range,
        batch: &RowBatch,
    ) -> Result<u64, StreamError>;
}
