//! Process-wide cache tuning, threaded through root construction.
//!
//! The embedding builds one `CacheConfig` at startup and shares it across
//! every root it creates. Nothing here is ambient global state, so tests
//! can run several independent configurations in one process.

/// Tuning knobs for the property caches.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum specialized entries per site before the chain collapses to
    /// the single generic entry.
    pub property_cache_limit: usize,

    /// Whether to collapse two layout-compatible shapes into one
    /// combined-shape entry instead of growing the chain.
    pub merge_shapes: bool,

    /// Whether prototype-chain entries may use assumption tokens instead of
    /// physically re-walking the chain. Requires `single_realm`.
    pub prototype_assumptions: bool,

    /// Whether the embedding runs a single realm. Assumption-shortcut
    /// entries are not realm-parameterized and are skipped on multi-realm
    /// embeddings.
    pub single_realm: bool,
}

impl CacheConfig {
    /// The default polymorphic entry limit.
    pub const DEFAULT_CACHE_LIMIT: usize = 4;

    /// Configuration for a single-realm embedding with all speedups on.
    pub fn new() -> Self {
        Self {
            property_cache_limit: Self::DEFAULT_CACHE_LIMIT,
            merge_shapes: true,
            prototype_assumptions: true,
            single_realm: true,
        }
    }

    /// Configuration for a multi-realm embedding: assumption shortcuts off,
    /// prototype chains are physically traversed.
    pub fn multi_realm() -> Self {
        Self {
            single_realm: false,
            prototype_assumptions: false,
            ..Self::new()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.property_cache_limit, 4);
        assert!(config.merge_shapes);
        assert!(config.prototype_assumptions);
        assert!(config.single_realm);
    }

    #[test]
    fn test_multi_realm_disables_assumption_shortcuts() {
        let config = CacheConfig::multi_realm();
        assert!(!config.single_realm);
        assert!(!config.prototype_assumptions);
        assert!(config.merge_shapes);
    }
}
