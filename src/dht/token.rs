//! Ring positions and the intervals between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position on the ring.
///
/// Tokens are plain ordered integers; the partitioner that produced them
/// decides how much of the `u64` space is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(u64);

impl Token {
    /// Create a token at the given ring position.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw ring position.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Clockwise distance from `self` to `other`.
    ///
    /// Unused space above a bounded partitioner's maximum sits between the
    /// top of the ring and zero, so modular `u64` distance preserves the
    /// clockwise order of every token the partitioner can produce.
    pub fn distance_to(&self, other: Token) -> u64 {
        other.0.wrapping_sub(self.0)
    }
}

impl From<u64> for Token {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A `(left, right]` interval on the ring.
///
/// When `left >= right` the interval wraps past the top of the ring back to
/// the bottom; `left == right` covers the whole ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    pub left: Token,
    pub right: Token,
}

impl Range {
    /// Create a range `(left, right]`.
    pub fn new(left: Token, right: Token) -> Self {
        Self { left, right }
    }

    /// Check if the range crosses the top of the ring.
    pub fn is_wrap_around(&self) -> bool {
        self.left >= self.right
    }

    /// Check if the range covers the whole ring.
    pub fn is_full_ring(&self) -> bool {
        self.left == self.right
    }

    /// Check if a token falls inside the range.
    pub fn contains(&self, token: Token) -> bool {
        if self.is_full_ring() {
            true
        } else if self.is_wrap_around() {
            token > self.left || token <= self.right
        } else {
            token > self.left && token <= self.right
        }
    }

    /// Check if `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &Range) -> bool {
        if self.is_full_ring() {
            return true;
        }
        if other.is_full_ring() {
            return false;
        }
        let left_ok = other.left == self.left || self.contains(other.left);
        left_ok
            && self.contains(other.right)
            && self.left.distance_to(other.left) <= self.left.distance_to(other.right)
    }

    /// Check if the two ranges share at least one token.
    ///
    /// Walking clockwise from any shared token, whichever right bound comes
    /// first lies inside both ranges.
    pub fn intersects(&self, other: &Range) -> bool {
        self.contains(other.right) || other.contains(self.right)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{}]", self.left, self.right)
    }
}
