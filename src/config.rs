//! Configuration types for node admission.

use crate::error::ConfigurationError;
use std::time::Duration;

/// Default number of vnodes per endpoint.
pub const DEFAULT_NUM_TOKENS: usize = 256;

/// Configuration for bootstrapping a node into the ring.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Explicit tokens in canonical string form.
    /// When non-empty this takes precedence over `num_tokens`.
    pub initial_tokens: Vec<String>,

    /// Number of random tokens to generate when no explicit tokens are given.
    pub num_tokens: usize,

    /// Streaming configuration.
    pub streaming: StreamingConfig,

    /// Failure detector configuration.
    pub failure_detector: FailureDetectorConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            initial_tokens: Vec::new(),
            num_tokens: DEFAULT_NUM_TOKENS,
            streaming: StreamingConfig::default(),
            failure_detector: FailureDetectorConfig::default(),
        }
    }
}

impl BootstrapConfig {
    /// Set explicit initial tokens.
    pub fn with_initial_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.initial_tokens = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Set explicit initial tokens from the operator's comma-separated list.
    ///
    /// Whitespace around entries is ignored and empty entries are dropped,
    /// so `""` means "no explicit tokens".
    pub fn with_initial_tokens_csv(mut self, csv: &str) -> Self {
        self.initial_tokens = csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self
    }

    /// Set the vnode count.
    pub fn with_num_tokens(mut self, num_tokens: usize) -> Self {
        self.num_tokens = num_tokens;
        self
    }

    /// Set streaming configuration.
    pub fn with_streaming_config(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set failure detector configuration.
    pub fn with_failure_detector_config(mut self, failure_detector: FailureDetectorConfig) -> Self {
        self.failure_detector = failure_detector;
        self
    }

    /// Check if explicit tokens were supplied.
    pub fn has_initial_tokens(&self) -> bool {
        !self.initial_tokens.is_empty()
    }

    /// Validate the configuration.
    ///
    /// The vnode count is only checked when it will be used.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.has_initial_tokens() && self.num_tokens < 1 {
            return Err(ConfigurationError::InvalidNumTokens(self.num_tokens));
        }
        self.streaming.validate()?;
        self.failure_detector.validate()
    }
}

/// Range streaming configuration.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Maximum number of ranges transferred at once.
    pub max_concurrent_transfers: usize,

    /// Rows requested per batch.
    pub batch_size: usize,

    /// How often the source of an in-flight transfer is checked for liveness.
    pub liveness_check_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            batch_size: 1000,
            liveness_check_interval: Duration::from_secs(1),
        }
    }
}

impl StreamingConfig {
    /// Set the transfer concurrency limit.
    pub fn with_max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    /// Set the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the liveness check interval.
    pub fn with_liveness_check_interval(mut self, interval: Duration) -> Self {
        self.liveness_check_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_transfers == 0 {
            return Err(ConfigurationError::InvalidStreaming(
                "max_concurrent_transfers must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::InvalidStreaming(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.liveness_check_interval.is_zero() {
            return Err(ConfigurationError::InvalidStreaming(
                "liveness_check_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Failure detector configuration.
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// Consecutive missed probes before an endpoint is convicted.
    pub failure_confirmations: usize,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            failure_confirmations: 3,
        }
    }
}

impl FailureDetectorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_confirmations == 0 {
            return Err(ConfigurationError::InvalidFailureDetector(
                "failure_confirmations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
