//! Error types for ring admission.

use crate::dht::{Range, Token};
use crate::types::Endpoint;
use thiserror::Error;

/// Result type alias for ring admission operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A token string could not be decoded.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// The join was rejected before any data moved.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// The join failed after streaming may have started.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapFailure),

    /// A range transfer failed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// A wire payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Failure to decode a token from its canonical string form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input was empty or all whitespace.
    #[error("empty token string")]
    Empty,

    /// The input contained something other than decimal digits.
    #[error("invalid token {input:?}: expected decimal digits")]
    InvalidDigits { input: String },

    /// The value does not fit on this partitioner's ring.
    #[error("token {input:?} is outside the ring [0, {max}]")]
    OutOfRange { input: String, max: u64 },
}

/// Pre-flight rejection of a join attempt. Nothing has been streamed and no
/// ring state has been touched when one of these is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// An explicit initial token failed to parse.
    #[error("invalid initial token {token:?}: {source}")]
    InvalidToken {
        token: String,
        #[source]
        source: ParseError,
    },

    /// An explicit initial token is already owned by a ring member.
    #[error(
        "bootstrapping to existing token {token} owned by {owner} is not allowed \
         (decommission or remove the old node first)"
    )]
    TokenAlreadyOwned { token: Token, owner: Endpoint },

    /// The same token was listed more than once.
    #[error("initial token {0} listed more than once")]
    DuplicateToken(Token),

    /// The vnode count is below one.
    #[error("num_tokens must be >= 1, got {0}")]
    InvalidNumTokens(usize),

    /// A bootstrapper was built without any tokens.
    #[error("no tokens to bootstrap with")]
    NoTokens,

    /// A streaming setting is unusable.
    #[error("invalid streaming config: {0}")]
    InvalidStreaming(String),

    /// A failure detector setting is unusable.
    #[error("invalid failure detector config: {0}")]
    InvalidFailureDetector(String),
}

/// Failure of a single range transfer or of planning the transfers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Every candidate replica for the range was filtered out.
    #[error("no live source for range {range} in keyspace {keyspace}")]
    NoLiveSource { keyspace: String, range: Range },

    /// The failure detector convicted the source mid-transfer.
    #[error("source {endpoint} went down while streaming {range} of {keyspace}")]
    SourceDown {
        endpoint: Endpoint,
        keyspace: String,
        range: Range,
    },

    /// The transport reported a failure fetching from the source.
    #[error("fetching {range} of {keyspace} from {endpoint} failed: {reason}")]
    Transfer {
        endpoint: Endpoint,
        keyspace: String,
        range: Range,
        reason: String,
    },

    /// Local storage refused a batch.
    #[error("applying {range} of {keyspace} locally failed: {reason}")]
    Apply {
        keyspace: String,
        range: Range,
        reason: String,
    },

    /// The streaming task panicked or was aborted.
    #[error("stream task failed: {0}")]
    Task(String),

    /// The fetch was cancelled.
    #[error("stream cancelled")]
    Cancelled,
}

/// Failure of a bootstrap attempt. The node is left non-normal and a new
/// attempt has to start from token resolution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapFailure {
    /// A range could not be streamed.
    #[error("error during bootstrap: {0}")]
    Stream(#[from] StreamError),

    /// The bootstrap was interrupted by the operator.
    #[error("interrupted while waiting on bootstrap to complete; bootstrap will have to be restarted")]
    Interrupted,

    /// The cluster refused to mark the node normal.
    #[error("announcing bootstrap completion failed: {0}")]
    Membership(String),

    /// `bootstrap` was already called on this bootstrapper.
    #[error("bootstrap already started")]
    AlreadyStarted,
}

/// Errors from the length-prefixed wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The encoded string does not fit a two-byte length prefix.
    #[error("encoded string is {len} bytes, max is {max}")]
    TooLong { len: usize, max: usize },

    /// The buffer ended early.
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The payload is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// The payload decoded but is not a valid token.
    #[error("invalid token payload: {0}")]
    Token(#[from] ParseError),

    /// bincode failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_message() {
        let err = ConfigurationError::TokenAlreadyOwned {
            token: Token::new(10),
            owner: "10.0.0.1:7000".parse().unwrap(),
        };
        let msg = err.to_string();
        assert!(msg.contains("existing token 10"));
        assert!(msg.contains("10.0.0.1:7000"));
    }

    #[test]
    fn test_error_conversions() {
        let err: Error = ConfigurationError::InvalidNumTokens(0).into();
        assert!(matches!(err, Error::Configuration(ConfigurationError::InvalidNumTokens(0))));

        let err: Error = BootstrapFailure::from(StreamError::Cancelled).into();
        assert!(matches!(err, Error::Bootstrap(BootstrapFailure::Stream(StreamError::Cancelled))));
    }
}
