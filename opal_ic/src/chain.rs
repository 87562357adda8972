//! Cache entry chains.
//!
//! A chain is a singly-linked list of immutable entries, most-specific
//! first, shared through `Arc` so a rebuild publishes a whole new chain
//! while concurrent readers keep walking the old one. A generic entry has
//! no receiver check and is always the only entry of its chain.

use opal_core::Value;
use opal_runtime::object::heap::ObjectHeap;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::receiver_check::ReceiverCheck;

bitflags::bitflags! {
    /// Specialization flags of one cache entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// Valid only in single-realm embeddings (assumption-shortcut
        /// receiver checks are not realm-parameterized).
        const SINGLE_REALM = 1 << 0;
        /// Bound to one fixed receiver object; evicted when another object
        /// with a matching shape shows up.
        const CONSTANT_OBJECT = 1 << 1;
    }
}

/// One specialized (or generic) cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<Op> {
    /// The guard; `None` marks the generic fallback entry.
    check: Option<ReceiverCheck>,
    /// Specialization flags.
    flags: EntryFlags,
    /// The leaf operation.
    op: Op,
    /// The less-specific entry behind this one.
    next: Option<Arc<CacheEntry<Op>>>,
}

impl<Op: Clone> CacheEntry<Op> {
    /// Create a specialized entry in front of `next`.
    pub fn specialized(
        check: ReceiverCheck,
        flags: EntryFlags,
        op: Op,
        next: Option<Arc<CacheEntry<Op>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            check: Some(check),
            flags,
            op,
            next,
        })
    }

    /// Create the generic fallback entry. It terminates its chain.
    pub fn generic(op: Op) -> Arc<Self> {
        Arc::new(Self {
            check: None,
            flags: EntryFlags::empty(),
            op,
            next: None,
        })
    }

    /// Check if this is the generic fallback entry.
    #[inline]
    pub fn is_generic(&self) -> bool {
        self.check.is_none()
    }

    /// The receiver check (None for the generic entry).
    #[inline]
    pub fn check(&self) -> Option<&ReceiverCheck> {
        self.check.as_ref()
    }

    /// Specialization flags.
    #[inline]
    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    /// The leaf operation.
    #[inline]
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// The next, less-specific entry.
    #[inline]
    pub fn next(&self) -> Option<&Arc<CacheEntry<Op>>> {
        self.next.as_ref()
    }

    /// Token validity of this entry under the given configuration.
    ///
    /// This never touches the candidate receiver; an entry whose tokens
    /// have died must not be trusted regardless of what `accept` says.
    pub fn is_valid(&self, config: &CacheConfig) -> bool {
        match &self.check {
            None => true,
            Some(check) => {
                if self.flags.contains(EntryFlags::SINGLE_REALM) && !config.single_realm {
                    return false;
                }
                check.is_valid()
            }
        }
    }

    /// Receiver acceptance (generic entries accept everything).
    pub fn accepts(&self, heap: &ObjectHeap, receiver: Value) -> bool {
        match &self.check {
            None => true,
            Some(check) => check.accept(heap, receiver),
        }
    }

    /// Check whether this is a constant-object entry observed with a
    /// receiver that matches structurally but is not the pinned object.
    /// Such an entry must be evicted, not retried.
    pub fn is_unexpected_constant(&self, heap: &ObjectHeap, receiver: Value) -> bool {
        if !self.flags.contains(EntryFlags::CONSTANT_OBJECT) {
            return false;
        }
        match &self.check {
            Some(ReceiverCheck::ConstantObject(co)) => {
                receiver.as_object() != Some(co.expected) && co.inner.accept(heap, receiver)
            }
            _ => false,
        }
    }
}

/// Length of a chain.
pub fn chain_len<Op>(head: &Option<Arc<CacheEntry<Op>>>) -> usize {
    let mut n = 0;
    let mut cur = head.as_ref();
    while let Some(e) = cur {
        n += 1;
        cur = e.next.as_ref();
    }
    n
}

/// Rebuild a chain keeping only entries that are still valid and are not
/// constant-object entries evicted by the current receiver. Order is
/// preserved.
pub fn filter_chain<Op: Clone>(
    head: &Option<Arc<CacheEntry<Op>>>,
    config: &CacheConfig,
    heap: &ObjectHeap,
    receiver: Value,
) -> Option<Arc<CacheEntry<Op>>> {
    let mut survivors: Vec<&CacheEntry<Op>> = Vec::new();
    let mut cur = head.as_ref();
    while let Some(e) = cur {
        if e.is_valid(config) && !e.is_unexpected_constant(heap, receiver) {
            survivors.push(e);
        }
        cur = e.next();
    }

    let mut rebuilt: Option<Arc<CacheEntry<Op>>> = None;
    for e in survivors.into_iter().rev() {
        rebuilt = Some(match e.check.clone() {
            None => CacheEntry::generic(e.op.clone()),
            Some(check) => CacheEntry::specialized(check, e.flags, e.op.clone(), rebuilt),
        });
    }
    rebuilt
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver_check::ShapeCheck;
    use opal_runtime::assumptions::AssumptionCell;
    use opal_runtime::object::shape::{ShapeId, ShapeRegistry};

    fn check(shape: u32) -> (ReceiverCheck, AssumptionCell) {
        let cell = AssumptionCell::new();
        (
            ReceiverCheck::Shape(ShapeCheck {
                shape: ShapeId(shape),
                validity: cell.clone(),
            }),
            cell,
        )
    }

    fn test_heap() -> ObjectHeap {
        ObjectHeap::new(std::sync::Arc::new(ShapeRegistry::new()))
    }

    #[test]
    fn test_chain_construction_and_len() {
        let (c1, _) = check(1);
        let (c2, _) = check(2);
        let head = CacheEntry::specialized(c2, EntryFlags::empty(), 2u32, None);
        let head = CacheEntry::specialized(c1, EntryFlags::empty(), 1u32, Some(head));

        assert_eq!(chain_len(&Some(head.clone())), 2);
        assert_eq!(*head.op(), 1);
        assert_eq!(*head.next().unwrap().op(), 2);
        assert!(!head.is_generic());
    }

    #[test]
    fn test_generic_entry_terminates_chain() {
        let head: Arc<CacheEntry<u32>> = CacheEntry::generic(0);
        assert!(head.is_generic());
        assert!(head.next().is_none());
        assert!(head.is_valid(&CacheConfig::default()));
    }

    #[test]
    fn test_single_realm_entries_invalid_in_multi_realm() {
        let (c, _) = check(1);
        let entry = CacheEntry::specialized(c, EntryFlags::SINGLE_REALM, 1u32, None);

        assert!(entry.is_valid(&CacheConfig::default()));
        assert!(!entry.is_valid(&CacheConfig::multi_realm()));
    }

    #[test]
    fn test_filter_chain_drops_invalidated_entries() {
        let heap = test_heap();
        let config = CacheConfig::default();
        let (c1, t1) = check(1);
        let (c2, _t2) = check(2);
        let (c3, t3) = check(3);

        let chain = CacheEntry::specialized(c3, EntryFlags::empty(), 3u32, None);
        let chain = CacheEntry::specialized(c2, EntryFlags::empty(), 2u32, Some(chain));
        let chain = CacheEntry::specialized(c1, EntryFlags::empty(), 1u32, Some(chain));
        let head = Some(chain);

        t1.invalidate();
        t3.invalidate();

        let filtered = filter_chain(&head, &config, &heap, Value::undefined());
        assert_eq!(chain_len(&filtered), 1);
        assert_eq!(*filtered.unwrap().op(), 2);
    }

    #[test]
    fn test_filter_chain_empty_when_all_dead() {
        let heap = test_heap();
        let config = CacheConfig::default();
        let (c1, t1) = check(1);
        let head = Some(CacheEntry::specialized(c1, EntryFlags::empty(), 1u32, None));
        t1.invalidate();
        assert!(filter_chain(&head, &config, &heap, Value::undefined()).is_none());
    }
}
