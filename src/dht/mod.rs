//! Ring positions, intervals, and partitioners.
//!
//! The ring is a circular, totally ordered space of [`Token`]s. Every ring
//! member owns one or more tokens; a token owns the [`Range`] between its
//! predecessor (exclusive) and itself (inclusive).
//!
//! ```text
//!            0
//!        ┌───●───┐           token 10 → A   owns (50, 10]
//!     90 ●       ● 10 (A)    token 50 → B   owns (10, 50]
//!        │       │
//!     70 ●       ● 30
//!        └───●───┘
//!           50 (B)
//! ```

mod partitioner;
mod token;

pub use partitioner::{Partitioner, RingPartitioner};
pub use token::{Range, Token};
