//! Range streaming for joining nodes.
//!
//! # Flow
//!
//! ```text
//! requirements ──► fetch_plan ──► one source per (keyspace, range)
//!                                    │
//!                                    ▼
//!                  ┌──────── JoinSet (bounded) ────────┐
//!                  │ fetch_batch ──► apply_batch ──► … │ until is_final
//!                  │ watch source liveness             │
//!                  └───────────────────────────────────┘
//!                                    │
//!                         all ok ──► StreamSummary
//!                      first err ──► abort the rest
//! ```

mod range_streamer;
mod source_filter;
mod transfer;
mod transport;

pub use range_streamer::{FetchPlan, PlannedTransfer, RangeStreamer, StreamSummary};
pub use source_filter::{ExcludeEndpointsFilter, FailureDetectorSourceFilter, SourceFilter};
pub use transfer::{RowBatch, StreamCursor, StreamProgress, StreamRequirement, StreamedRow};
pub use transport::{LocalStore, StreamTransport};
