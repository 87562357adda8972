//! Cache-site statistics and classification.

/// Specialization state of a cache site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// No entries yet.
    Uninitialized,
    /// A single specialized entry.
    Monomorphic,
    /// Two or more specialized entries, within the configured limit.
    Polymorphic,
    /// The single generic fallback entry. Terminal for this chain.
    Megamorphic,
}

impl CacheState {
    /// Check if this site still has room to specialize.
    #[inline]
    pub const fn can_specialize(self) -> bool {
        !matches!(self, Self::Megamorphic)
    }
}

/// Snapshot of one cache root's counters.
#[derive(Debug, Clone, Copy)]
pub struct RootStats {
    /// Current specialization state.
    pub state: CacheState,
    /// Current chain length (0 when uninitialized).
    pub entries: usize,
    /// Accesses served by an existing entry.
    pub hits: u64,
    /// Accesses that entered the specialization path.
    pub misses: u64,
    /// Chain rebuilds performed.
    pub rebuilds: u64,
}

impl RootStats {
    /// Hit rate in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
