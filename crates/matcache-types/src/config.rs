//! Recognized configuration options for the materialization cache.

/// Default weight budget: 2 GiB of materialized data.
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default identity for background catalog operations.
pub const DEFAULT_CACHING_USER: &str = "cte-cache";

/// Configuration for the CTE materialization cache.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master on/off switch. When false every cache operation is a no-op
    /// and lookups always miss.
    pub enabled: bool,
    /// Weight budget in bytes over committed materializations.
    pub max_total_bytes: u64,
    /// User identity under which background table drops are performed.
    pub caching_user: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            caching_user: DEFAULT_CACHING_USER.to_string(),
        }
    }
}
