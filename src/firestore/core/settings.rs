//! Client configuration.
//!
//! Every field has a default, so settings can be deserialized from a partial
//! document and tuned further with the `with_*` builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Disables LRU garbage collection when used as the cache size.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Heuristic deciding when a query is worth a client-side field index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexAutoCreation {
    pub enabled: bool,
    /// Full scans reading fewer documents never create an index.
    pub min_collection_size: usize,
    /// An index is created when a full scan reads more than this many
    /// documents per result.
    pub relative_index_read_cost_per_document: f64,
}

impl IndexAutoCreation {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for IndexAutoCreation {
    fn default() -> Self {
        Self {
            enabled: true,
            min_collection_size: 100,
            relative_index_read_cost_per_document: 8.0,
        }
    }
}

/// Exponential backoff used when reopening streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirestoreSettings {
    /// Cache size that triggers garbage collection, in bytes, or
    /// [`CACHE_SIZE_UNLIMITED`].
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    pub index_auto_creation: IndexAutoCreation,
    pub retry: RetrySettings,
    /// How long the client waits for a stream to come up before reporting
    /// itself offline.
    pub online_state_timeout: Duration,
    /// Streams with nothing to do are closed after this long.
    pub idle_timeout: Duration,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            index_auto_creation: IndexAutoCreation::default(),
            retry: RetrySettings::default(),
            online_state_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            gc_initial_delay: Duration::from_secs(60),
            gc_regular_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl FirestoreSettings {
    pub fn with_cache_size_bytes(mut self, cache_size_bytes: i64) -> Self {
        self.cache_size_bytes = cache_size_bytes;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_index_auto_creation(mut self, index_auto_creation: IndexAutoCreation) -> Self {
        self.index_auto_creation = index_auto_creation;
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_gc_delays(mut self, initial: Duration, regular: Duration) -> Self {
        self.gc_initial_delay = initial;
        self.gc_regular_delay = regular;
        self
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED
            && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES
        {
            return Err(invalid_argument(format!(
                "cache_size_bytes must be at least {MINIMUM_CACHE_SIZE_BYTES}"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid_argument("retry multiplier must be at least 1.0"));
        }
        Ok(())
    }

    pub fn lru_params(&self) -> LruParams {
        LruParams::with_cache_size(self.cache_size_bytes)
    }
}

/// Tuning of the LRU garbage collector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size in bytes above which a collection pass runs;
    /// [`CACHE_SIZE_UNLIMITED`] turns collection off.
    pub cache_size_collection_threshold: i64,
    /// Share of sequence numbers to collect per pass, in percent.
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != CACHE_SIZE_UNLIMITED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_in_defaults() {
        let settings: FirestoreSettings = serde_json::from_value(serde_json::json!({
            "cache_size_bytes": -1,
            "index_auto_creation": { "enabled": false }
        }))
        .unwrap();
        assert_eq!(settings.cache_size_bytes, CACHE_SIZE_UNLIMITED);
        assert!(!settings.index_auto_creation.enabled);
        assert_eq!(settings.index_auto_creation.min_collection_size, 100);
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert!(!settings.lru_params().is_enabled());
    }

    #[test]
    fn validate_rejects_tiny_cache() {
        let err = FirestoreSettings::default()
            .with_cache_size_bytes(1024)
            .validate()
            .unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::InvalidArgument);
        assert!(FirestoreSettings::default().validate().is_ok());
        assert!(FirestoreSettings::default()
            .with_cache_size_bytes(CACHE_SIZE_UNLIMITED)
            .validate()
            .is_ok());
    }
}
