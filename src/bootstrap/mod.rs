//! Admission of a new node into the ring.
//!
//! [`join_ring`] is the entry point: it resolves the node's tokens with
//! [`get_bootstrap_tokens`], then a [`BootStrapper`] registers the ranges the
//! node will take over as pending, streams them from their current owners
//! and finally announces the node as normal.

mod bootstrapper;

pub use bootstrapper::{
    get_bootstrap_tokens, get_random_tokens, join_ring, BootStrapper, Collaborators,
};
