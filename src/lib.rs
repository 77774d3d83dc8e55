//! Node admission for a partitioned, consistent-hashing data store.
//!
//! This crate decides which slice of the ring a joining node will own and
//! moves the data for that slice from the current replicas before the node
//! is allowed to serve traffic:
//! - **Token allocation** from explicit operator tokens or random vnodes
//! - **Ring metadata** with copy-on-write snapshots and pending ranges
//! - **Range streaming** from live replicas with bounded concurrency
//! - **Admission state machine** (`Joining → Streaming → Normal | Failed`)
//!
//! # Example
//!
//! ```rust,no_run
//! use ringjoin::bootstrap::{join_ring, Collaborators};
//! use ringjoin::cluster::{GossipFailureDetector, RingMembership};
//! use ringjoin::dht::RingPartitioner;
//! use ringjoin::locator::{Keyspaces, SimpleStrategy, TokenMetadata};
//! use ringjoin::streaming::{LocalStore, StreamTransport};
//! use ringjoin::BootstrapConfig;
//! use std::sync::Arc;
//!
//! async fn join(
//!     transport: Arc<dyn StreamTransport>,
//!     store: Arc<dyn LocalStore>,
//! ) -> ringjoin::Result<()> {
//!     let metadata = Arc::new(TokenMetadata::new());
//!     let (membership, _events) =
//!         RingMembership::new(metadata.clone(), Arc::new(RingPartitioner::full()));
//!     let detector = Arc::new(GossipFailureDetector::default());
//!     membership.add_listener(detector.clone());
//!
//!     let keyspaces = Keyspaces::new().with_keyspace("users", Arc::new(SimpleStrategy::new(3)));
//!     let collaborators = Collaborators {
//!         membership,
//!         strategies: Arc::new(keyspaces),
//!         failure_detector: detector,
//!         transport,
//!         store,
//!     };
//!
//!     let config = BootstrapConfig::default().with_num_tokens(16);
//!     let address = "10.0.0.3:7000".parse().unwrap();
//!     let tokens = join_ring(address, &config, metadata, collaborators).await?;
//!     println!("joined with {} tokens", tokens.len());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          join_ring / BootStrapper           │
//! │  • get_bootstrap_tokens                     │
//! │  • bootstrap() state machine                │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │ Cluster │   │ Locator  │   │  Streaming  │
//! │membership│  │ metadata │   │RangeStreamer│
//! │ liveness│   │ strategy │   │             │
//! └─────────┘   └──────────┘   └─────────────┘
//!                     │
//!                     ▼
//!               ┌──────────┐
//!               │   DHT    │
//!               │ tokens   │
//!               └──────────┘
//! ```
//!
//! # Failure Model
//!
//! - **Configuration errors** are returned before anything is streamed
//! - **Streaming errors** leave the node non-normal with its pending ranges
//!   registered; a new attempt starts from token resolution
//! - Two nodes drawing the same random token at once is only detected when
//!   the second one is announced

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod dht;
pub mod error;
pub mod locator;
pub mod network;
pub mod streaming;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use bootstrap::{join_ring, BootStrapper, Collaborators};
pub use config::{BootstrapConfig, FailureDetectorConfig, StreamingConfig};
pub use error::{
    BootstrapFailure, CodecError, ConfigurationError, Error, ParseError, Result, StreamError,
};
pub use types::{BootstrapState, Endpoint};

// Re-export ring types
pub use dht::{Partitioner, Range, RingPartitioner, Token};
pub use locator::{RingSnapshot, TokenMetadata};

// Re-export cluster types
pub use cluster::{ClusterMembership, EndpointEvent, FailureDetector};

// Re-export streaming types
pub use streaming::{RangeStreamer, StreamProgress};
