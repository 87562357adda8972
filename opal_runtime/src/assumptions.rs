//! Assumption tokens for cache invalidation.
//!
//! An assumption token is a shared flag standing for a fact the cache relies
//! on ("this shape is still current", "no object of this shape has changed
//! property `x`"). Cache entries hold non-owning clones of the token;
//! mutators invalidate it. Invalidation is monotonic: a token that has been
//! invalidated never becomes valid again. A reader that races an
//! invalidation may observe the stale `true` exactly once more, which is
//! sound because the guarded fact was still true when the token was read.
//!
//! Ownership: shape-level tokens (validity, stable prototype) live on the
//! `Shape` itself; per-(shape, key) tokens live in the
//! [`PropertyAssumptionRegistry`]. When a registry token is invalidated it
//! is also removed from the table, so the next specialization that asks for
//! the same fact receives a fresh, valid token derived from current state.

use opal_core::InternedString;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::object::shape::ShapeId;

// =============================================================================
// Assumption Cell
// =============================================================================

/// A shared, monotonic validity flag.
///
/// Cloning produces another handle to the same flag.
#[derive(Debug, Clone)]
pub struct AssumptionCell {
    valid: Arc<AtomicBool>,
}

impl AssumptionCell {
    /// Create a new, valid assumption.
    #[inline]
    pub fn new() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Create an assumption that is already invalid.
    #[inline]
    pub fn invalid() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check validity. Cheap, never blocks, safe from any thread.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Invalidate the assumption. Idempotent; immediately visible to all
    /// holders.
    #[inline]
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    /// Check whether two handles refer to the same underlying flag.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.valid, &other.valid)
    }
}

impl Default for AssumptionCell {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Property Assumption Registry
// =============================================================================

/// Registry of per-(shape, key) assumption tokens.
///
/// A token for `(S, k)` stands for: "since this token was handed out, no
/// object whose shape is `S` has added, deleted, or reconfigured property
/// `k`, and no such object has changed its prototype behind `k`'s back."
/// Assumption-based prototype-chain checks hold these tokens instead of
/// re-walking the chain on every access.
#[derive(Debug, Default)]
pub struct PropertyAssumptionRegistry {
    cells: RwLock<FxHashMap<(u32, u32), AssumptionCell>>,
    invalidation_count: AtomicU64,
}

impl PropertyAssumptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the token for `(shape, key)`, minting a fresh valid one if none
    /// is outstanding.
    ///
    /// Callers must acquire the token *before* reading the fact it guards:
    /// a mutation that completes after the token is acquired invalidates
    /// it, and a mutation that completes before is reflected in the
    /// subsequent read. Either way the (token, fact) pair is coherent.
    pub fn token(&self, shape: ShapeId, key: &InternedString) -> AssumptionCell {
        let entry = (shape.raw(), key.symbol());
        if let Some(cell) = self.cells.read().get(&entry) {
            return cell.clone();
        }
        let mut cells = self.cells.write();
        cells.entry(entry).or_insert_with(AssumptionCell::new).clone()
    }

    /// Invalidate the outstanding token for `(shape, key)`, if any.
    ///
    /// The dead token is removed from the table; a later [`Self::token`]
    /// call mints a fresh one.
    pub fn invalidate(&self, shape: ShapeId, key: &InternedString) {
        let entry = (shape.raw(), key.symbol());
        let removed = self.cells.write().remove(&entry);
        if let Some(cell) = removed {
            cell.invalidate();
            self.invalidation_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of invalidations performed so far.
    #[inline]
    pub fn invalidation_count(&self) -> u64 {
        self.invalidation_count.load(Ordering::Relaxed)
    }

    /// Number of outstanding tokens.
    pub fn outstanding(&self) -> usize {
        self.cells.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::intern;

    #[test]
    fn test_assumption_cell_starts_valid() {
        let cell = AssumptionCell::new();
        assert!(cell.is_valid());
    }

    #[test]
    fn test_assumption_cell_invalidate_is_monotonic() {
        let cell = AssumptionCell::new();
        cell.invalidate();
        assert!(!cell.is_valid());
        // Idempotent.
        cell.invalidate();
        assert!(!cell.is_valid());
    }

    #[test]
    fn test_assumption_cell_shared_across_clones() {
        let cell = AssumptionCell::new();
        let other = cell.clone();
        cell.invalidate();
        assert!(!other.is_valid());
        assert!(cell.ptr_eq(&other));
    }

    #[test]
    fn test_registry_token_is_stable_until_invalidated() {
        let registry = PropertyAssumptionRegistry::new();
        let key = intern("x");
        let a = registry.token(ShapeId(1), &key);
        let b = registry.token(ShapeId(1), &key);
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn test_registry_invalidate_mints_fresh_token() {
        let registry = PropertyAssumptionRegistry::new();
        let key = intern("y");
        let old = registry.token(ShapeId(2), &key);
        registry.invalidate(ShapeId(2), &key);

        assert!(!old.is_valid());
        let fresh = registry.token(ShapeId(2), &key);
        assert!(fresh.is_valid());
        assert!(!fresh.ptr_eq(&old));
        assert_eq!(registry.invalidation_count(), 1);
    }

    #[test]
    fn test_registry_invalidate_without_token_is_noop() {
        let registry = PropertyAssumptionRegistry::new();
        registry.invalidate(ShapeId(9), &intern("nothing"));
        assert_eq!(registry.invalidation_count(), 0);
    }

    #[test]
    fn test_registry_keys_are_per_shape_and_per_key() {
        let registry = PropertyAssumptionRegistry::new();
        let x = intern("x");
        let a = registry.token(ShapeId(1), &x);
        let _b = registry.token(ShapeId(2), &x);
        let _c = registry.token(ShapeId(1), &intern("z"));

        registry.invalidate(ShapeId(2), &x);
        assert!(a.is_valid());
        assert_eq!(registry.outstanding(), 2);
    }

    #[test]
    fn test_concurrent_invalidation_visible() {
        use std::thread;

        let cell = AssumptionCell::new();
        let writer = cell.clone();
        let handle = thread::spawn(move || writer.invalidate());
        handle.join().unwrap();
        assert!(!cell.is_valid());
    }
}
