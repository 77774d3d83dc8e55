//! Token generation and the canonical token text format.

use crate::dht::token::Token;
use crate::error::ParseError;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Produces tokens and converts them to and from their wire form.
///
/// Mapping data keys onto tokens is the storage layer's business and is not
/// part of this trait.
pub trait Partitioner: Send + Sync + Debug {
    /// Draw a token uniformly from the whole ring.
    fn random_token(&self) -> Token;

    /// Decode a token from its canonical string.
    fn token_from_string(&self, s: &str) -> Result<Token, ParseError>;

    /// Encode a token as its canonical string.
    fn token_to_string(&self, token: &Token) -> String;

    /// Lowest position on the ring.
    fn min_token(&self) -> Token;

    /// Highest position on the ring.
    fn max_token(&self) -> Token;

    /// Number of distinct positions on the ring.
    fn ring_size(&self) -> u128 {
        (self.max_token().value() - self.min_token().value()) as u128 + 1
    }

    /// Fraction of the ring covered by each token's primary range.
    ///
    /// `sorted_tokens` must be in ring order. Each token owns the span from
    /// its predecessor (exclusive) up to itself, and the first token also
    /// covers the wrap from the last.
    fn describe_ownership(&self, sorted_tokens: &[Token]) -> BTreeMap<Token, f64> {
        let mut ownership = BTreeMap::new();
        let Some(&last) = sorted_tokens.last() else {
            return ownership;
        };
        if sorted_tokens.len() == 1 {
            ownership.insert(last, 1.0);
            return ownership;
        }

        let size = self.ring_size() as f64;
        let mut previous = last;
        for &token in sorted_tokens {
            let span = if token > previous {
                (token.value() - previous.value()) as u128
            } else {
                self.ring_size() - (previous.value() - token.value()) as u128
            };
            ownership.insert(token, span as f64 / size);
            previous = token;
        }
        ownership
    }
}

/// Integer partitioner over `[0, max]`.
///
/// [`RingPartitioner::full`] uses the whole `u64` space; a bounded ring is
/// mostly useful for small clusters and tests where token values should be
/// readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPartitioner {
    max: u64,
}

impl RingPartitioner {
    /// Partitioner spanning every `u64` value.
    pub fn full() -> Self {
        Self { max: u64::MAX }
    }

    /// Partitioner with `ring_size` positions, `[0, ring_size)`.
    ///
    /// A zero size is treated as one position.
    pub fn with_ring_size(ring_size: u64) -> Self {
        Self {
            max: ring_size.saturating_sub(1),
        }
    }
}

impl Default for RingPartitioner {
    fn default() -> Self {
        Self::full()
    }
}

impl Partitioner for RingPartitioner {
    fn random_token(&self) -> Token {
        Token::new(rand::rng().random_range(0..=self.max))
    }

    fn token_from_string(&self, s: &str) -> Result<Token, ParseError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }
        // `u64::from_str` accepts a leading '+', the canonical form does not.
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidDigits {
                input: s.to_string(),
            });
        }
        let value: u64 = trimmed.parse().map_err(|_| ParseError::OutOfRange {
            input: s.to_string(),
            max: self.max,
        })?;
        if value > self.max {
            return Err(ParseError::OutOfRange {
                input: s.to_string(),
                max: self.max,
            });
        }
        Ok(Token::new(value))
    }

    fn token_to_string(&self, token: &Token) -> String {
        token.value().to_string()
    }

    fn min_token(&self) -> Token {
        Token::new(0)
    }

    fn max_token(&self) -> Token {
        Token::new(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_extremes_and_interior() {
        let partitioner = RingPartitioner::full();
        let mut samples = vec![partitioner.min_token(), partitioner.max_token()];
        samples.extend((0..100).map(|_| partitioner.random_token()));

        for token in samples {
            let encoded = partitioner.token_to_string(&token);
            assert_eq!(partitioner.token_from_string(&encoded).unwrap(), token);
        }
    }

    #[test]
    fn test_bounded_round_trip() {
        let partitioner = RingPartitioner::with_ring_size(100);
        assert_eq!(partitioner.max_token(), Token::new(99));
        for value in [0, 1, 50, 99] {
            let token = Token::new(value);
            let encoded = partitioner.token_to_string(&token);
            assert_eq!(partitioner.token_from_string(&encoded).unwrap(), token);
        }
    }

    #[test]
    fn test_random_tokens_stay_on_ring() {
        let partitioner = RingPartitioner::with_ring_size(100);
        for _ in 0..1000 {
            assert!(partitioner.random_token().value() < 100);
        }
    }

    #[test]
    fn test_malformed_strings() {
        let partitioner = RingPartitioner::with_ring_size(100);

        assert_eq!(partitioner.token_from_string(""), Err(ParseError::Empty));
        assert_eq!(partitioner.token_from_string("  "), Err(ParseError::Empty));
        assert!(matches!(
            partitioner.token_from_string("abc"),
            Err(ParseError::InvalidDigits { .. })
        ));
        assert!(matches!(
            partitioner.token_from_string("-5"),
            Err(ParseError::InvalidDigits { .. })
        ));
        assert!(matches!(
            partitioner.token_from_string("+5"),
            Err(ParseError::InvalidDigits { .. })
        ));
        assert!(matches!(
            partitioner.token_from_string("100"),
            Err(ParseError::OutOfRange { max: 99, .. })
        ));
        assert!(matches!(
            RingPartitioner::full().token_from_string("18446744073709551616"),
            Err(ParseError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let partitioner = RingPartitioner::full();
        assert_eq!(partitioner.token_from_string(" 42 ").unwrap(), Token::new(42));
    }

    #[test]
    fn test_describe_ownership() {
        let partitioner = RingPartitioner::with_ring_size(100);
        let ownership = partitioner.describe_ownership(&[Token::new(10), Token::new(50)]);

        assert!((ownership[&Token::new(10)] - 0.6).abs() < 1e-9);
        assert!((ownership[&Token::new(50)] - 0.4).abs() < 1e-9);

        let single = partitioner.describe_ownership(&[Token::new(10)]);
        assert_eq!(single[&Token::new(10)], 1.0);
        assert!(partitioner.describe_ownership(&[]).is_empty());
    }
}
