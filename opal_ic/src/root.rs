//! Shared cache-root machinery: the hot scan loop and the specialization
//! state machine driving Uninitialized → Monomorphic → Polymorphic →
//! Megamorphic.
//!
//! The read and write roots share everything here; they differ only in
//! their leaf operations, supplied through [`Specializer`].

use opal_core::{InternedString, ObjectId, Value};
use opal_runtime::object::heap::ObjectHeap;
use opal_runtime::object::ordinary::MAX_PROTOTYPE_DEPTH;
use opal_runtime::object::shape::{PropertyDescriptor, Shape};
use opal_runtime::realm::Realm;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::RootOptions;
use crate::chain::{CacheEntry, EntryFlags, chain_len, filter_chain};
use crate::config::CacheConfig;
use crate::receiver_check::{
    AssumptionChainCheck, CombinedShapeCheck, ConstantObjectCheck, PrimitiveKind,
    PrimitiveWrapperCheck, ReceiverCheck, ShapeCheck, TraverseChainCheck,
};
use crate::stats::{CacheState, RootStats};

/// Bound on restarts of the specialization loop before giving up and
/// installing the generic entry (which is always correct).
const MAX_SPECIALIZE_ATTEMPTS: usize = 8;

// =============================================================================
// Operation Traits
// =============================================================================

/// A leaf operation type (read side or write side).
pub(crate) trait CacheOperation: Clone {
    /// Whether this operation applies to the value being written. Entries
    /// whose storage kind cannot represent the value must signal "does not
    /// apply" here rather than truncate. Read-side operations always apply.
    fn accepts_value(&self, value: Option<Value>) -> bool {
        let _ = value;
        true
    }

    /// The slot descriptor this operation reads or writes, if it is a
    /// plain slot operation. Used for combined-shape merge decisions.
    fn merge_descriptor(&self) -> Option<&PropertyDescriptor> {
        None
    }
}

/// Outcome of asking a [`Specializer`] for a leaf operation.
pub(crate) enum Found<Op> {
    /// Build an entry with this operation.
    Op(Op),
    /// The receiver cannot be usefully specialized; demote to generic.
    Generic,
    /// Object layout was adjusted (e.g. storage widening); re-derive the
    /// specialization from current state.
    Retry,
}

/// Side-specific specialization callbacks.
pub(crate) trait Specializer {
    type Op: CacheOperation;

    /// Writes cannot specialize primitive receivers (there is nothing to
    /// store into); reads can.
    fn supports_primitive_receivers(&self) -> bool;

    /// Operation for `undefined`/`null` receivers.
    fn op_for_nullish(&self) -> Self::Op;

    /// Operation for proxy receivers.
    fn op_for_proxy(&self) -> Self::Op;

    /// The generic fallback operation.
    fn generic_op(&self) -> Self::Op;

    /// Operation for a property found at `holder` at `depth`.
    fn op_for_found(
        &self,
        cx: &SpecCx,
        receiver: Value,
        holder: ObjectId,
        depth: usize,
        desc: &PropertyDescriptor,
        value: Option<Value>,
    ) -> Found<Self::Op>;

    /// Operation for a property absent along the walked chain.
    fn op_for_absent(&self, cx: &SpecCx, receiver: Value, value: Option<Value>) -> Found<Self::Op>;
}

/// Outcome of executing an entry's leaf operation.
pub(crate) enum Exec<T> {
    /// The access completed with this result.
    Done(T),
    /// The entry no longer applies (layout moved under it); the caller
    /// discards the chain and retries.
    Respecialize,
}

/// Context threaded through specialization.
pub(crate) struct SpecCx<'a> {
    pub heap: &'a ObjectHeap,
    pub realm: &'a Realm,
    pub config: &'a CacheConfig,
    pub options: RootOptions,
    pub key: &'a InternedString,
}

// =============================================================================
// Scan
// =============================================================================

/// Outcome of the lock-free chain scan.
pub(crate) enum Scan<Op> {
    /// A specialized entry accepted the receiver and the whole chain was
    /// confirmed clean.
    Use(Arc<CacheEntry<Op>>),
    /// The chain is the generic terminal entry.
    Generic(Arc<CacheEntry<Op>>),
    /// No entry matched; specialization is needed.
    Miss,
    /// An invalidated or evicted entry was observed; the chain must be
    /// rebuilt before anything in it is trusted.
    Invalid,
}

// =============================================================================
// Root Core
// =============================================================================

/// State shared by [`crate::PropertyGetCache`] and
/// [`crate::PropertySetCache`].
pub(crate) struct RootCore<Op> {
    pub(crate) key: InternedString,
    pub(crate) options: RootOptions,
    pub(crate) config: Arc<CacheConfig>,
    /// Current chain head. Readers take the read lock only long enough to
    /// clone the `Arc`; rebuilds publish a complete chain through the
    /// write lock, which gives the required release ordering.
    chain: RwLock<Option<Arc<CacheEntry<Op>>>>,
    /// Serializes rebuilds of this root without blocking readers.
    rebuild_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
}

impl<Op: CacheOperation> RootCore<Op> {
    pub(crate) fn new(key: InternedString, options: RootOptions, config: Arc<CacheConfig>) -> Self {
        Self {
            key,
            options,
            config,
            chain: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<Arc<CacheEntry<Op>>> {
        self.chain.read().clone()
    }

    #[inline]
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Discard the whole chain. The next access re-specializes from
    /// scratch; this is also the only way out of the megamorphic state.
    pub(crate) fn discard_chain(&self) {
        *self.chain.write() = None;
    }

    /// Current specialization state.
    pub(crate) fn state(&self) -> CacheState {
        let head = self.head();
        match &head {
            None => CacheState::Uninitialized,
            Some(e) if e.is_generic() => CacheState::Megamorphic,
            Some(e) if e.next().is_none() => CacheState::Monomorphic,
            Some(_) => CacheState::Polymorphic,
        }
    }

    /// Counter and state snapshot.
    pub(crate) fn stats(&self) -> RootStats {
        RootStats {
            state: self.state(),
            entries: chain_len(&self.head()),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }

    /// The hot-path scan, implementing the accept-and-keep-scanning rule:
    /// a matching entry is remembered but the scan continues, so an
    /// invalidated or evicted entry anywhere in the chain forces the slow
    /// path before anything is executed.
    pub(crate) fn scan(&self, heap: &ObjectHeap, receiver: Value, value: Option<Value>) -> Scan<Op> {
        let head = self.head();
        let mut candidate: Option<Arc<CacheEntry<Op>>> = None;
        let mut cur = head.as_ref();
        while let Some(entry) = cur {
            if entry.is_generic() {
                // The generic entry is always the only entry of its chain.
                return Scan::Generic(Arc::clone(entry));
            }
            if !entry.is_valid(&self.config) {
                return Scan::Invalid;
            }
            if entry.is_unexpected_constant(heap, receiver) {
                return Scan::Invalid;
            }
            if candidate.is_none()
                && entry.accepts(heap, receiver)
                && entry.op().accepts_value(value)
            {
                candidate = Some(Arc::clone(entry));
            }
            cur = entry.next();
        }
        match candidate {
            Some(entry) => Scan::Use(entry),
            None => Scan::Miss,
        }
    }

    /// The slow path. Serialized per root; always terminates in some cache
    /// state (the generic entry is always constructible and correct).
    pub(crate) fn specialize<S: Specializer<Op = Op>>(
        &self,
        cx: &SpecCx<'_>,
        receiver: Value,
        value: Option<Value>,
        spec: &S,
    ) -> Arc<CacheEntry<Op>> {
        let _guard = self.rebuild_lock.lock();
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        for _ in 0..MAX_SPECIALIZE_ATTEMPTS {
            // Re-validate under the lock: the chain may have changed while
            // we were waiting, and objects may have mutated concurrently.
            match self.scan(cx.heap, receiver, value) {
                Scan::Use(e) | Scan::Generic(e) => return e,
                Scan::Invalid => {
                    let head = self.head();
                    let filtered = filter_chain(&head, cx.config, cx.heap, receiver);
                    *self.chain.write() = filtered;
                    continue;
                }
                Scan::Miss => {}
            }

            let head = self.head();
            let count = chain_len(&head);
            match self.build(cx, receiver, value, count, &head, spec) {
                Build::Retry => continue,
                Build::Generic => return self.install_generic(spec),
                Build::Replace(entry) => {
                    *self.chain.write() = Some(Arc::clone(&entry));
                    return entry;
                }
                Build::Entry { check, flags, op } => {
                    if count >= cx.config.property_cache_limit {
                        return self.install_generic(spec);
                    }
                    let entry = CacheEntry::specialized(check, flags, op, head);
                    *self.chain.write() = Some(Arc::clone(&entry));
                    return entry;
                }
            }
        }

        // Pathological churn: give up on specializing this access pattern.
        self.install_generic(spec)
    }

    fn install_generic<S: Specializer<Op = Op>>(&self, spec: &S) -> Arc<CacheEntry<Op>> {
        let entry = CacheEntry::generic(spec.generic_op());
        *self.chain.write() = Some(Arc::clone(&entry));
        entry
    }

    /// Synthesize one new specialization for the actual receiver.
    fn build<S: Specializer<Op = Op>>(
        &self,
        cx: &SpecCx<'_>,
        receiver: Value,
        value: Option<Value>,
        count: usize,
        head: &Option<Arc<CacheEntry<Op>>>,
        spec: &S,
    ) -> Build<Op> {
        if receiver.is_nullish() {
            return Build::Entry {
                check: ReceiverCheck::Null,
                flags: EntryFlags::empty(),
                op: spec.op_for_nullish(),
            };
        }

        let (start, primitive) = match receiver.as_object() {
            Some(id) => {
                if cx.heap.cell(id).is_proxy() {
                    return Build::Entry {
                        check: ReceiverCheck::Proxy,
                        flags: EntryFlags::empty(),
                        op: spec.op_for_proxy(),
                    };
                }
                if cx.heap.is_dictionary(id) {
                    return Build::Generic;
                }
                (id, None)
            }
            None => {
                if !spec.supports_primitive_receivers() {
                    return Build::Generic;
                }
                let Some(primitive) = PrimitiveKind::of_value(receiver) else {
                    return Build::Generic;
                };
                let Some(proto) = cx.realm.wrapper_prototype(receiver) else {
                    return Build::Generic;
                };
                if cx.heap.is_dictionary(proto) {
                    return Build::Generic;
                }
                (proto, Some(primitive))
            }
        };

        // Sibling shapes differing by an unrelated field are the common
        // source of unnecessary polymorphism; collapse them into one
        // combined-shape entry when configured.
        if primitive.is_none() && cx.config.merge_shapes && count == 1 {
            if let Some(merged) = self.try_merge(cx, receiver, start, value, head, spec) {
                return merged;
            }
        }

        // Walk the prototype chain from the start object.
        let mut chain: ChainVec = SmallVec::new();
        let mut current = start;
        for depth in 0..MAX_PROTOTYPE_DEPTH {
            if depth > 0 && (cx.heap.cell(current).is_proxy() || cx.heap.is_dictionary(current)) {
                // Exotic or dictionary objects mid-chain cannot be guarded.
                return Build::Generic;
            }
            let shape = cx.heap.shape_of(current);
            chain.push((current, Arc::clone(&shape)));

            if let Some(desc) = shape.lookup(cx.key) {
                let desc = desc.clone();
                return match spec.op_for_found(cx, receiver, current, depth, &desc, value) {
                    Found::Op(op) => self.finish(cx, receiver, &chain, depth, primitive, op),
                    Found::Generic => Build::Generic,
                    Found::Retry => Build::Retry,
                };
            }
            if cx.options.contains(RootOptions::OWN_PROPERTY) {
                break;
            }
            match shape.prototype() {
                Some(proto) => current = proto,
                None => break,
            }
        }

        // Absent along the whole (walked) chain; guard everything walked.
        match spec.op_for_absent(cx, receiver, value) {
            Found::Op(op) => self.finish(cx, receiver, &chain, chain.len() - 1, primitive, op),
            Found::Generic => Build::Generic,
            Found::Retry => Build::Retry,
        }
    }

    /// Try to replace a monomorphic chain with one combined-shape entry.
    fn try_merge<S: Specializer<Op = Op>>(
        &self,
        cx: &SpecCx<'_>,
        receiver: Value,
        id: ObjectId,
        value: Option<Value>,
        head: &Option<Arc<CacheEntry<Op>>>,
        spec: &S,
    ) -> Option<Build<Op>> {
        let existing = head.as_ref()?;
        let existing_check = match existing.check()? {
            ReceiverCheck::Shape(c) => c.clone(),
            _ => return None,
        };
        let existing_desc = existing.op().merge_descriptor()?;

        let shape = cx.heap.shape_of(id);
        if shape.id() == existing_check.shape {
            return None;
        }
        let desc = shape.lookup(cx.key)?.clone();
        if &desc != existing_desc {
            // Layouts disagree for this key; the shapes cannot be merged.
            return None;
        }

        let op = match spec.op_for_found(cx, receiver, id, 0, &desc, value) {
            Found::Op(op) => op,
            Found::Generic => return Some(Build::Generic),
            Found::Retry => return Some(Build::Retry),
        };
        if !op.accepts_value(value) {
            return None;
        }

        let check = ReceiverCheck::CombinedShape(CombinedShapeCheck {
            first: existing_check.shape,
            second: shape.id(),
            first_validity: existing_check.validity,
            second_validity: shape.validity().clone(),
        });
        Some(Build::Replace(CacheEntry::specialized(
            check,
            EntryFlags::empty(),
            op,
            None,
        )))
    }

    /// Build the receiver check for a finished specialization.
    fn finish(
        &self,
        cx: &SpecCx<'_>,
        receiver: Value,
        chain: &ChainVec,
        depth: usize,
        primitive: Option<PrimitiveKind>,
        op: Op,
    ) -> Build<Op> {
        let Some((check, flags)) = make_check(cx, chain, depth, primitive, receiver) else {
            return Build::Retry;
        };
        Build::Entry { check, flags, op }
    }
}

type ChainVec = SmallVec<[(ObjectId, Arc<Shape>); 4]>;

/// Result of building one specialization.
enum Build<Op> {
    /// Insert a new entry at the head.
    Entry {
        check: ReceiverCheck,
        flags: EntryFlags,
        op: Op,
    },
    /// Replace the whole chain with this entry (shape merge).
    Replace(Arc<CacheEntry<Op>>),
    /// Replace the whole chain with the generic entry.
    Generic,
    /// Restart the specialization loop.
    Retry,
}

/// Construct the guard for a holder at `depth` along `chain`.
///
/// Returns `None` if a concurrent mutation moved any chained object off
/// its observed shape between the walk and token acquisition; the caller
/// restarts. Tokens are acquired before that re-check, so a mutation that
/// lands after it invalidates the tokens we hold.
fn make_check(
    cx: &SpecCx<'_>,
    chain: &ChainVec,
    depth: usize,
    primitive: Option<PrimitiveKind>,
    receiver: Value,
) -> Option<(ReceiverCheck, EntryFlags)> {
    debug_assert!(depth < chain.len());
    let mut flags = EntryFlags::empty();

    let inner = if depth == 0 {
        let (_, shape) = &chain[0];
        ReceiverCheck::Shape(ShapeCheck {
            shape: shape.id(),
            validity: shape.validity().clone(),
        })
    } else if cx.config.prototype_assumptions && cx.config.single_realm {
        let mut assumptions: SmallVec<[opal_runtime::assumptions::AssumptionCell; 8]> =
            SmallVec::new();
        for i in 0..depth {
            let (_, level_shape) = &chain[i];
            let (_, next_shape) = &chain[i + 1];
            assumptions.push(level_shape.stable_prototype().clone());
            assumptions.push(next_shape.validity().clone());
            assumptions.push(
                cx.heap
                    .registry()
                    .assumptions()
                    .token(next_shape.id(), cx.key),
            );
        }
        // Tokens first, then confirm the chain is still what we walked.
        for (object, shape) in chain.iter().take(depth + 1) {
            if cx.heap.shape_of(*object).id() != shape.id() {
                return None;
            }
        }
        flags |= EntryFlags::SINGLE_REALM;
        ReceiverCheck::AssumptionChain(AssumptionChainCheck {
            receiver_shape: chain[0].1.id(),
            holder: chain[depth].0,
            assumptions,
        })
    } else {
        ReceiverCheck::TraverseChain(TraverseChainCheck {
            receiver_shape: chain[0].1.id(),
            proto_shapes: chain[1..=depth].iter().map(|(_, s)| s.id()).collect(),
            validities: chain[..=depth]
                .iter()
                .map(|(_, s)| s.validity().clone())
                .collect(),
        })
    };

    let check = if let Some(primitive) = primitive {
        ReceiverCheck::PrimitiveWrapper(PrimitiveWrapperCheck {
            primitive,
            proto: chain[0].0,
            inner: Box::new(inner),
        })
    } else if cx.options.contains(RootOptions::GLOBAL) {
        flags |= EntryFlags::CONSTANT_OBJECT;
        ReceiverCheck::ConstantObject(ConstantObjectCheck {
            expected: receiver
                .as_object()
                .expect("constant-object specialization requires an object receiver"),
            inner: Box::new(inner),
        })
    } else {
        inner
    };

    Some((check, flags))
}
