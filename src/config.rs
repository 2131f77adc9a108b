//! Configuration for the streaming parser
//!
//! Tuning parameters are validated once, at parser construction. An
//! invalid configuration is a fatal error and is never retried.

use std::time::Duration;

/// Default configuration constants
pub mod defaults {
    use std::time::Duration;

    /// Default chunk size in bytes (512KB)
    pub const CHUNK_SIZE: usize = 512 * 1024;

    /// Minimum chunk size in bytes (16KB)
    pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

    /// Maximum chunk size in bytes (8MB)
    pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

    /// Default memory budget in bytes (256MB)
    pub const MAX_MEMORY_USAGE: usize = 256 * 1024 * 1024;

    /// Default time-to-live for cached objects
    pub const CACHE_TTL: Duration = Duration::from_secs(300);

    /// Bytes processed between forwarded progress callbacks
    pub const PROGRESS_INTERVAL: usize = 64 * 1024;
}

/// Immutable tuning parameters for a streaming parse
#[derive(Debug, Clone)]
pub struct StreamingParserConfig {
    /// Target chunk size when the caller does not supply one
    pub default_chunk_size: usize,

    /// Lower bound for adaptive chunk sizing
    pub min_chunk_size: usize,

    /// Upper bound for adaptive chunk sizing
    pub max_chunk_size: usize,

    /// Memory budget in bytes enforced by the memory manager
    pub max_memory_usage: usize,

    /// Whether chunk results may be cached
    pub enable_cache: bool,

    /// Time-to-live for cached objects
    pub cache_ttl: Duration,

    /// Minimum number of processed bytes between forwarded
    /// progress callbacks
    pub progress_interval: usize,

    /// Number of worker threads for parallel chunk processing
    pub worker_threads: usize,
}

impl Default for StreamingParserConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: defaults::CHUNK_SIZE,
            min_chunk_size: defaults::MIN_CHUNK_SIZE,
            max_chunk_size: defaults::MAX_CHUNK_SIZE,
            max_memory_usage: defaults::MAX_MEMORY_USAGE,
            enable_cache: true,
            cache_ttl: defaults::CACHE_TTL,
            progress_interval: defaults::PROGRESS_INTERVAL,
            worker_threads: 1,
        }
    }
}

impl StreamingParserConfig {
    /// Creates a new builder for StreamingParserConfig
    pub fn builder() -> StreamingParserConfigBuilder {
        StreamingParserConfigBuilder::new()
    }

    /// Configuration tuned for multi-gigabyte inputs
    pub fn for_large_files() -> Self {
        Self {
            default_chunk_size: 4 * 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            max_memory_usage: 512 * 1024 * 1024,
            ..Default::default()
        }
    }

    /// Configuration tuned for memory-constrained hosts
    pub fn low_memory() -> Self {
        Self {
            default_chunk_size: 64 * 1024,
            max_chunk_size: 256 * 1024,
            max_memory_usage: 32 * 1024 * 1024,
            enable_cache: false,
            ..Default::default()
        }
    }

    /// Checks the configuration and returns every violation found.
    ///
    /// An empty list means the configuration is usable. Messages name
    /// the offending fields so they can be reported directly.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.min_chunk_size == 0 {
            violations.push("min_chunk_size must be greater than 0".to_string());
        }

        if self.min_chunk_size > self.max_chunk_size {
            violations.push(format!(
                "min_chunk_size ({}) must not exceed max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            ));
        }

        if self.default_chunk_size < self.min_chunk_size {
            violations.push(format!(
                "default_chunk_size ({}) must be at least min_chunk_size ({})",
                self.default_chunk_size, self.min_chunk_size
            ));
        }

        if self.default_chunk_size > self.max_chunk_size {
            violations.push(format!(
                "default_chunk_size ({}) must not exceed max_chunk_size ({})",
                self.default_chunk_size, self.max_chunk_size
            ));
        }

        if self.max_memory_usage < 2 * self.max_chunk_size {
            violations.push(format!(
                "max_memory_usage ({}) must be at least twice max_chunk_size ({})",
                self.max_memory_usage, self.max_chunk_size
            ));
        }

        if self.worker_threads == 0 {
            violations.push("worker_threads must be at least 1".to_string());
        }

        violations
    }
}

/// Builder for StreamingParserConfig with fluent API
#[derive(Debug, Clone)]
pub struct StreamingParserConfigBuilder {
    config: StreamingParserConfig,
}

impl StreamingParserConfigBuilder {
    /// Creates a new builder with default values
    pub fn new() -> Self {
        Self {
            config: StreamingParserConfig::default(),
        }
    }

    /// Sets the default chunk size in bytes
    pub fn default_chunk_size(mut self, size: usize) -> Self {
        self.config.default_chunk_size = size;
        self
    }

    /// Sets the minimum chunk size in bytes
    pub fn min_chunk_size(mut self, size: usize) -> Self {
        self.config.min_chunk_size = size;
        self
    }

    /// Sets the maximum chunk size in bytes
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.config.max_chunk_size = size;
        self
    }

    /// Sets the memory budget in bytes
    pub fn max_memory_usage(mut self, bytes: usize) -> Self {
        self.config.max_memory_usage = bytes;
        self
    }

    /// Enables or disables result caching
    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.config.enable_cache = enabled;
        self
    }

    /// Sets the time-to-live for cached objects
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Sets the progress reporting interval in bytes
    pub fn progress_interval(mut self, bytes: usize) -> Self {
        self.config.progress_interval = bytes;
        self
    }

    /// Sets the number of worker threads
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Uses one worker per available CPU core
    pub fn all_cores(mut self) -> Self {
        self.config.worker_threads = num_cpus::get();
        self
    }

    /// Builds the configuration, validating parameters
    pub fn build(self) -> crate::error::Result<StreamingParserConfig> {
        let violations = self.config.validate();
        if !violations.is_empty() {
            return Err(crate::error::ParserError::from_violations(violations));
        }
        Ok(self.config)
    }

    /// Builds the configuration without validation (for testing)
    pub fn build_unchecked(self) -> StreamingParserConfig {
        self.config
    }
}

impl Default for StreamingParserConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StreamingParserConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.default_chunk_size, defaults::CHUNK_SIZE);
        assert_eq!(config.worker_threads, 1);
    }

    #[test]
    fn test_inverted_bounds_mention_both_fields() {
        let config = StreamingParserConfig {
            min_chunk_size: 1000,
            max_chunk_size: 500,
            ..Default::default()
        };

        let violations = config.validate();
        assert!(!violations.is_empty());
        let joined = violations.join("; ");
        assert!(joined.contains("min_chunk_size"));
        assert!(joined.contains("max_chunk_size"));
    }

    #[test]
    fn test_memory_budget_rule() {
        let config = StreamingParserConfig {
            max_chunk_size: 8 * 1024 * 1024,
            max_memory_usage: 8 * 1024 * 1024,
            ..Default::default()
        };

        let violations = config.validate();
        assert!(violations.iter().any(|v| v.contains("max_memory_usage")));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = StreamingParserConfig::builder().worker_threads(0).build();
        assert!(matches!(
            result,
            Err(crate::error::ParserError::Configuration(_))
        ));
    }

    #[test]
    fn test_builder_round_trip() {
        let config = StreamingParserConfig::builder()
            .default_chunk_size(128 * 1024)
            .min_chunk_size(32 * 1024)
            .max_chunk_size(1024 * 1024)
            .worker_threads(4)
            .build()
            .unwrap();

        assert_eq!(config.default_chunk_size, 128 * 1024);
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(StreamingParserConfig::for_large_files()
            .validate()
            .is_empty());
        assert!(StreamingParserConfig::low_memory().validate().is_empty());
    }
}
