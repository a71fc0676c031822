use std::time::Duration;

pub const DEFAULT_HOST: &str = "firestore.googleapis.com";

/// Passing this as the cache size turns off LRU garbage collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;

const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

/// Which reference delegate the memory persistence uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GarbageCollectorKind {
    /// Drop documents as soon as nothing references them.
    #[default]
    Eager,
    /// Keep documents until the cache exceeds `cache_size_bytes`.
    Lru,
}

/// Exponential backoff tuning for stream reconnects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the current delay applied as +/- jitter.
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1_000),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(60_000),
            jitter_factor: 0.5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LruParams {
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
    pub initial_collection_delay: Duration,
    pub regular_collection_delay: Duration,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1_000,
            initial_collection_delay: Duration::from_secs(60),
            regular_collection_delay: Duration::from_secs(300),
        }
    }
}

/// Client configuration. Built once and handed to every component that needs it.
#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    pub host: String,
    pub ssl: bool,
    pub experimental_force_long_polling: bool,
    pub cache_size_bytes: i64,
    pub garbage_collector: GarbageCollectorKind,
    pub max_concurrent_limbo_resolutions: usize,
    pub max_pending_writes: usize,
    pub online_state_timeout: Duration,
    pub idle_stream_timeout: Duration,
    pub health_check_timeout: Duration,
    pub backoff: BackoffSettings,
    pub lru: LruParams,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            ssl: true,
            experimental_force_long_polling: false,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            garbage_collector: GarbageCollectorKind::Eager,
            max_concurrent_limbo_resolutions: 100,
            max_pending_writes: 10,
            online_state_timeout: Duration::from_secs(10),
            idle_stream_timeout: Duration::from_secs(60),
            health_check_timeout: Duration::from_secs(10),
            backoff: BackoffSettings::default(),
            lru: LruParams::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn with_host(mut self, host: impl Into<String>, ssl: bool) -> Self {
        self.host = host.into();
        self.ssl = ssl;
        self
    }

    pub fn with_long_polling(mut self, enabled: bool) -> Self {
        self.experimental_force_long_polling = enabled;
        self
    }

    /// Enables LRU collection with the given threshold, clamped to at least 1 MiB.
    pub fn with_lru_cache_size(mut self, cache_size_bytes: i64) -> Self {
        self.garbage_collector = GarbageCollectorKind::Lru;
        self.cache_size_bytes = if cache_size_bytes == CACHE_SIZE_UNLIMITED {
            CACHE_SIZE_UNLIMITED
        } else {
            cache_size_bytes.max(MINIMUM_CACHE_SIZE_BYTES)
        };
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = max.max(1);
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_idle_stream_timeout(mut self, timeout: Duration) -> Self {
        self.idle_stream_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn lru_enabled(&self) -> bool {
        self.garbage_collector == GarbageCollectorKind::Lru
            && self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend_tuning() {
        let settings = FirestoreSettings::default();
        assert_eq!(settings.max_pending_writes, 10);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.backoff.max_delay, Duration::from_secs(60));
        assert!(!settings.lru_enabled());
    }

    #[test]
    fn lru_cache_size_is_clamped() {
        let settings = FirestoreSettings::default().with_lru_cache_size(10);
        assert_eq!(settings.cache_size_bytes, MINIMUM_CACHE_SIZE_BYTES);
        assert!(settings.lru_enabled());
        let unlimited = FirestoreSettings::default().with_lru_cache_size(CACHE_SIZE_UNLIMITED);
        assert!(!unlimited.lru_enabled());
    }
}
