//! Ring ownership and replica placement.
//!
//! [`TokenMetadata`] is the process-wide ring: token ownership plus the
//! ranges promised to joining endpoints. Replica placement is delegated to a
//! [`ReplicationStrategy`] per keyspace, looked up through a
//! [`ReplicationStrategyProvider`].
//!
//! # Example
//!
//! ```rust
//! use ringjoin::dht::{Range, Token};
//! use ringjoin::locator::{ReplicationStrategy, SimpleStrategy, TokenMetadata};
//!
//! let metadata = TokenMetadata::new();
//! metadata.update_normal_tokens(&[Token::new(10)], "10.0.0.1:7000".parse().unwrap());
//! metadata.update_normal_tokens(&[Token::new(50)], "10.0.0.2:7000".parse().unwrap());
//!
//! let ring = metadata.clone_ring_snapshot();
//! let joining = "10.0.0.3:7000".parse().unwrap();
//! let ranges = SimpleStrategy::new(1).pending_ranges_for(&ring, &[Token::new(30)], joining);
//! assert_eq!(ranges, vec![Range::new(Token::new(10), Token::new(30))]);
//! ```

mod replication;
mod token_metadata;

pub use replication::{
    is_system_keyspace, Keyspaces, ReplicationStrategy, ReplicationStrategyProvider,
    SimpleStrategy, SYSTEM_KEYSPACES,
};
pub use token_metadata::{PendingRange, RingEntry, RingSnapshot, TokenMetadata};
