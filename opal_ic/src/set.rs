//! The write-side cache root and its leaf operations.

use opal_core::{EngineError, EngineResult, InternedString, ObjectId, Value};
use opal_runtime::object::exotic::ExoticData;
use opal_runtime::object::heap::ObjectHeap;
use opal_runtime::object::ordinary::{call_setter, ordinary_set};
use opal_runtime::object::shape::{
    ComputedKind, DICTIONARY_THRESHOLD, PropertyDescriptor, PropertyFlags, PropertyKind, Shape,
    StorageKind,
};
use opal_runtime::realm::Realm;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::RootOptions;
use crate::chain::CacheEntry;
use crate::config::CacheConfig;
use crate::root::{CacheOperation, Exec, Found, RootCore, Scan, SpecCx, Specializer};
use crate::stats::{CacheState, RootStats};

/// Bound on execute-discard-retry rounds before falling back to the
/// uncached path for the current access.
const MAX_EXEC_RETRIES: usize = 3;

// =============================================================================
// Write Ops
// =============================================================================

/// Leaf operations of write-side cache entries.
#[derive(Debug, Clone)]
pub enum SetOp {
    /// In-place slot write. The declared storage kind accepts only values
    /// representable without loss; boundary values report "does not
    /// apply", which widens the slot and re-specializes instead of
    /// truncating.
    Slot(PropertyDescriptor),
    /// Cached add transition for a brand-new property: old-shape check,
    /// slot store, shape pointer swap.
    Define {
        /// The shape the receiver must still have.
        old_shape: Arc<Shape>,
        /// The successor shape carrying the new property.
        new_shape: Arc<Shape>,
    },
    /// Accessor write; the setter runs with the original receiver.
    Accessor(PropertyDescriptor),
    /// Non-writable property: TypeError in strict mode, no-op otherwise.
    ReadOnly,
    /// Exotic array length write (shrink/grow, RangeError on bad values).
    ArrayLength,
    /// `undefined`/`null` receiver: always a TypeError.
    NullReceiver,
    /// Proxy trap invocation.
    ProxyTrap,
    /// Full uncached write.
    Generic,
}

impl CacheOperation for SetOp {
    fn accepts_value(&self, value: Option<Value>) -> bool {
        let Some(value) = value else {
            return true;
        };
        match self {
            SetOp::Slot(desc) => desc.storage.accepts(value),
            SetOp::Define { new_shape, .. } => new_shape
                .property()
                .expect("add transition carries a descriptor")
                .storage
                .accepts(value),
            _ => true,
        }
    }

    fn merge_descriptor(&self) -> Option<&PropertyDescriptor> {
        match self {
            SetOp::Slot(desc) => Some(desc),
            _ => None,
        }
    }
}

fn exec_set(
    entry: &CacheEntry<SetOp>,
    heap: &ObjectHeap,
    realm: &Realm,
    key: &InternedString,
    options: RootOptions,
    receiver: Value,
    value: Value,
) -> EngineResult<Exec<()>> {
    let strict = options.contains(RootOptions::STRICT);
    match entry.op() {
        SetOp::Slot(desc) => {
            let holder = entry
                .check()
                .expect("specialized entries carry a receiver check")
                .locate_store(heap, receiver);
            if heap.set_slot_checked(holder, desc, value) {
                Ok(Exec::Done(()))
            } else {
                Ok(Exec::Respecialize)
            }
        }
        SetOp::Define {
            old_shape,
            new_shape,
        } => {
            let id = receiver
                .as_object()
                .expect("define entries only accept objects");
            if heap.apply_cached_add(id, old_shape, new_shape, value) {
                Ok(Exec::Done(()))
            } else {
                Ok(Exec::Respecialize)
            }
        }
        SetOp::Accessor(desc) => {
            let holder = entry
                .check()
                .expect("specialized entries carry a receiver check")
                .locate_store(heap, receiver);
            let accessor = heap.get_slot(holder, desc);
            call_setter(heap, accessor, receiver, value, key, strict).map(Exec::Done)
        }
        SetOp::ReadOnly => {
            if strict {
                Err(EngineError::read_only(key.as_str()))
            } else {
                Ok(Exec::Done(()))
            }
        }
        SetOp::ArrayLength => {
            let id = receiver
                .as_object()
                .expect("array-length entries only accept objects");
            heap.set_array_length(id, value)?;
            Ok(Exec::Done(()))
        }
        SetOp::NullReceiver => Err(EngineError::nullish_receiver("set", key.as_str())),
        SetOp::ProxyTrap => {
            let id = receiver
                .as_object()
                .expect("proxy entries only accept objects");
            exec_proxy_set(heap, id, key, receiver, value, strict).map(Exec::Done)
        }
        SetOp::Generic => ordinary_set(heap, realm, receiver, key, value, strict).map(Exec::Done),
    }
}

fn exec_proxy_set(
    heap: &ObjectHeap,
    id: ObjectId,
    key: &InternedString,
    receiver: Value,
    value: Value,
    strict: bool,
) -> EngineResult<()> {
    let cell = heap.cell(id);
    match cell.exotic() {
        Some(ExoticData::Proxy {
            target,
            handler,
            revoked,
        }) => {
            if revoked.load(Ordering::Acquire) {
                return Err(EngineError::revoked_proxy());
            }
            let ok = handler.clone().set(heap, *target, key, value, receiver)?;
            if !ok && strict {
                return Err(EngineError::read_only(key.as_str()));
            }
            Ok(())
        }
        _ => panic!("proxy entry executed against a non-proxy receiver"),
    }
}

// =============================================================================
// Write Specializer
// =============================================================================

struct SetSpecializer;

impl SetSpecializer {
    /// Build a cached define (shadow or fresh add) on the receiver.
    fn define_op(&self, cx: &SpecCx, receiver: Value, value: Option<Value>) -> Found<SetOp> {
        let Some(id) = receiver.as_object() else {
            return Found::Generic;
        };
        if !cx.heap.is_extensible(id) {
            // Strict/sloppy divergence is handled by the uncached path.
            return Found::Generic;
        }
        let old_shape = cx.heap.shape_of(id);
        if old_shape.property_count() as usize + 1 >= DICTIONARY_THRESHOLD {
            // The add would convert to dictionary mode; don't cache it.
            return Found::Generic;
        }
        let value = value.expect("write specialization carries a value");
        let storage = StorageKind::of_value(value);
        let new_shape = cx.heap.registry().transition_add(
            &old_shape,
            cx.key.clone(),
            PropertyFlags::default(),
            PropertyKind::Data,
            storage,
        );
        Found::Op(SetOp::Define {
            old_shape,
            new_shape,
        })
    }
}

impl Specializer for SetSpecializer {
    type Op = SetOp;

    fn supports_primitive_receivers(&self) -> bool {
        // There is nothing to store into on a primitive; the uncached path
        // handles wrapper-chain setters and strict errors.
        false
    }

    fn op_for_nullish(&self) -> SetOp {
        SetOp::NullReceiver
    }

    fn op_for_proxy(&self) -> SetOp {
        SetOp::ProxyTrap
    }

    fn generic_op(&self) -> SetOp {
        SetOp::Generic
    }

    fn op_for_found(
        &self,
        cx: &SpecCx,
        receiver: Value,
        holder: ObjectId,
        depth: usize,
        desc: &PropertyDescriptor,
        value: Option<Value>,
    ) -> Found<SetOp> {
        match desc.kind {
            PropertyKind::Data => {
                if !desc.is_writable() {
                    return Found::Op(SetOp::ReadOnly);
                }
                if depth > 0 {
                    // Writable data on a prototype: assignment shadows it
                    // with an own property on the receiver.
                    return self.define_op(cx, receiver, value);
                }
                let value = value.expect("write specialization carries a value");
                if desc.storage.accepts(value) {
                    Found::Op(SetOp::Slot(desc.clone()))
                } else {
                    // Widen the slot now, then re-derive against the new
                    // layout. Never truncate into the narrow slot.
                    cx.heap.set_data_value(holder, cx.key, value);
                    Found::Retry
                }
            }
            PropertyKind::Accessor => Found::Op(SetOp::Accessor(desc.clone())),
            PropertyKind::Computed(ComputedKind::ArrayLength)
                if depth == 0 && desc.is_writable() && cx.heap.cell(holder).is_array() =>
            {
                Found::Op(SetOp::ArrayLength)
            }
            PropertyKind::Computed(_) => Found::Op(SetOp::ReadOnly),
        }
    }

    fn op_for_absent(&self, cx: &SpecCx, receiver: Value, value: Option<Value>) -> Found<SetOp> {
        self.define_op(cx, receiver, value)
    }
}

// =============================================================================
// Write Root
// =============================================================================

/// A property-write access site.
pub struct PropertySetCache {
    core: RootCore<SetOp>,
}

impl PropertySetCache {
    /// Create an uninitialized write site for `key`.
    pub fn new(key: InternedString, options: RootOptions, config: Arc<CacheConfig>) -> Self {
        Self {
            core: RootCore::new(key, options, config),
        }
    }

    /// The property key this site writes.
    #[inline]
    pub fn key(&self) -> &InternedString {
        &self.core.key
    }

    /// Current specialization state.
    pub fn state(&self) -> CacheState {
        self.core.state()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RootStats {
        self.core.stats()
    }

    /// Discard the entry chain.
    pub fn invalidate(&self) {
        self.core.discard_chain();
    }

    /// Write `receiver.key = value`.
    pub fn write(
        &self,
        heap: &ObjectHeap,
        realm: &Realm,
        receiver: Value,
        value: Value,
    ) -> EngineResult<()> {
        if self.core.options.contains(RootOptions::CONST) {
            return Err(EngineError::TypeError {
                message: format!(
                    "assignment to constant variable '{}'",
                    self.core.key.as_str()
                ),
            });
        }
        let cx = SpecCx {
            heap,
            realm,
            config: &self.core.config,
            options: self.core.options,
            key: &self.core.key,
        };
        for _ in 0..MAX_EXEC_RETRIES {
            let entry = match self.core.scan(heap, receiver, Some(value)) {
                Scan::Use(e) | Scan::Generic(e) => {
                    self.core.record_hit();
                    e
                }
                Scan::Miss | Scan::Invalid => {
                    self.core.record_miss();
                    self.core
                        .specialize(&cx, receiver, Some(value), &SetSpecializer)
                }
            };
            match exec_set(
                &entry,
                heap,
                realm,
                &self.core.key,
                self.core.options,
                receiver,
                value,
            )? {
                Exec::Done(()) => return Ok(()),
                Exec::Respecialize => self.core.discard_chain(),
            }
        }
        ordinary_set(
            heap,
            realm,
            receiver,
            &self.core.key,
            value,
            self.core.options.contains(RootOptions::STRICT),
        )
    }
}

impl std::fmt::Debug for PropertySetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertySetCache")
            .field("key", &self.core.key.as_str())
            .field("state", &self.core.state())
            .finish()
    }
}
