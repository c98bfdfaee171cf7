//! Centralized configuration for a kadnet node
//!
//! Every protocol tunable lives here so tests can shrink timeouts and
//! deployments can widen them without touching the engine. Defaults follow
//! the Kademlia paper values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// DHT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Maximum contacts per k-bucket and result width of lookups
    pub k: usize,
    /// Concurrency factor for lookup waves
    pub alpha: usize,
    /// Bucket-split depth modulus: a bucket away from our own id may only
    /// split while its depth is not a multiple of this
    pub split_depth_modulus: u32,
    /// Per-RPC timeout
    pub request_timeout: Duration,
    /// Worker pool size for the parallel router
    pub max_threads: usize,
    /// Default expiration applied to primary-storage writes, in seconds
    pub expiration_secs: u64,
    /// Refresh buckets untouched for this long
    pub bucket_refresh_interval: Duration,
    /// Republish interval for values we originally published
    pub originator_republish_interval: Duration,
    /// Republish interval for values held on behalf of others
    pub key_value_republish_interval: Duration,
    /// How often the expiration sweep runs
    pub expiration_scan_interval: Duration,
    /// Watchdog bounding each parallel lookup wave
    pub query_time: Duration,
    /// Pause between parallel lookup scheduling passes
    pub response_wait: Duration,
    /// Transient failures tolerated before a contact is evicted
    pub eviction_limit: u32,
    /// Seed for the node's RNG; `None` seeds from the OS
    pub rng_seed: Option<u64>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            split_depth_modulus: 5,
            request_timeout: Duration::from_millis(500),
            max_threads: 4,
            expiration_secs: 86_400,
            bucket_refresh_interval: Duration::from_secs(3_600),
            originator_republish_interval: Duration::from_secs(86_400),
            key_value_republish_interval: Duration::from_secs(3_600),
            expiration_scan_interval: Duration::from_secs(600),
            query_time: Duration::from_millis(500),
            response_wait: Duration::from_millis(10),
            eviction_limit: 5,
            rng_seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = DhtConfig::default();
        assert_eq!(config.k, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.split_depth_modulus, 5);
        assert_eq!(config.request_timeout, Duration::from_millis(500));
        assert_eq!(config.expiration_secs, 86_400);
        assert_eq!(config.eviction_limit, 5);
        assert!(config.rng_seed.is_none());
    }
}
