//! The read-side cache root and its leaf operations.

use opal_core::{EngineError, EngineResult, InternedString, ObjectId, Value};
use opal_runtime::object::exotic::ExoticData;
use opal_runtime::object::heap::ObjectHeap;
use opal_runtime::object::ordinary::{call_getter, compute_property, ordinary_get};
use opal_runtime::object::shape::{ComputedKind, PropertyDescriptor, PropertyKind};
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
// Read Ops
// =============================================================================

/// Leaf operations of read-side cache entries.
#[derive(Debug, Clone)]
pub enum GetOp {
    /// Direct slot read. Typed slots (int/double/bool) report "does not
    /// apply" if the stored value's runtime kind ever disagrees with the
    /// slot's declared kind, falling back to re-specialization.
    Slot(PropertyDescriptor),
    /// Accessor read; the getter runs with the original receiver even when
    /// the accessor lives on a prototype.
    Accessor(PropertyDescriptor),
    /// Computed on demand (array length, string length), never stored.
    Computed(ComputedKind),
    /// Established absent along the guarded chain.
    Absent,
    /// `undefined`/`null` receiver.
    NullReceiver,
    /// Proxy trap invocation.
    ProxyTrap,
    /// Full uncached lookup.
    Generic,
}

impl CacheOperation for GetOp {
    fn merge_descriptor(&self) -> Option<&PropertyDescriptor> {
        match self {
            GetOp::Slot(desc) => Some(desc),
            _ => None,
        }
    }
}

fn exec_get(
    entry: &CacheEntry<GetOp>,
    heap: &ObjectHeap,
    realm: &Realm,
    key: &InternedString,
    options: RootOptions,
    receiver: Value,
) -> EngineResult<Exec<Value>> {
    match entry.op() {
        GetOp::Slot(desc) => {
            let holder = locate(entry, heap, receiver);
            let value = heap.get_slot(holder, desc);
            if desc.storage.accepts(value) {
                Ok(Exec::Done(value))
            } else {
                // Typed leaf observed a foreign representation.
                Ok(Exec::Respecialize)
            }
        }
        GetOp::Accessor(desc) => {
            let holder = locate(entry, heap, receiver);
            let accessor = heap.get_slot(holder, desc);
            call_getter(heap, accessor, receiver).map(Exec::Done)
        }
        GetOp::Computed(kind) => {
            let holder = locate(entry, heap, receiver);
            Ok(Exec::Done(compute_property(heap, holder, *kind, receiver)))
        }
        GetOp::Absent => {
            if options.contains(RootOptions::REQUIRED) {
                Err(EngineError::ReferenceError {
                    name: key.as_str().to_string(),
                })
            } else {
                Ok(Exec::Done(Value::undefined()))
            }
        }
        GetOp::NullReceiver => Err(EngineError::nullish_receiver("read", key.as_str())),
        GetOp::ProxyTrap => {
            let id = receiver
                .as_object()
                .expect("proxy entries only accept objects");
            exec_proxy_get(heap, id, key, receiver).map(Exec::Done)
        }
        GetOp::Generic => ordinary_get(heap, realm, receiver, key).map(Exec::Done),
    }
}

fn locate(entry: &CacheEntry<GetOp>, heap: &ObjectHeap, receiver: Value) -> ObjectId {
    entry
        .check()
        .expect("specialized entries carry a receiver check")
        .locate_store(heap, receiver)
}

fn exec_proxy_get(
    heap: &ObjectHeap,
    id: ObjectId,
    key: &InternedString,
    receiver: Value,
) -> EngineResult<Value> {
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
            handler.clone().get(heap, *target, key, receiver)
        }
        _ => panic!("proxy entry executed against a non-proxy receiver"),
    }
}

// =============================================================================
// Read Specializer
// =============================================================================

struct GetSpecializer;

impl Specializer for GetSpecializer {
    type Op = GetOp;

    fn supports_primitive_receivers(&self) -> bool {
        true
    }

    fn op_for_nullish(&self) -> GetOp {
        GetOp::NullReceiver
    }

    fn op_for_proxy(&self) -> GetOp {
        GetOp::ProxyTrap
    }

    fn generic_op(&self) -> GetOp {
        GetOp::Generic
    }

    fn op_for_found(
        &self,
        _cx: &SpecCx,
        _receiver: Value,
        _holder: ObjectId,
        _depth: usize,
        desc: &PropertyDescriptor,
        _value: Option<Value>,
    ) -> Found<GetOp> {
        match desc.kind {
            PropertyKind::Data => Found::Op(GetOp::Slot(desc.clone())),
            PropertyKind::Accessor => Found::Op(GetOp::Accessor(desc.clone())),
            PropertyKind::Computed(kind) => Found::Op(GetOp::Computed(kind)),
        }
    }

    fn op_for_absent(&self, _cx: &SpecCx, _receiver: Value, _value: Option<Value>) -> Found<GetOp> {
        Found::Op(GetOp::Absent)
    }
}

// =============================================================================
// Read Root
// =============================================================================

/// A property-read access site.
///
/// One instance per static read site; shared freely across threads. The
/// entry chain is rebuilt as receivers are observed, but the root itself
/// lives as long as the compiled code that owns it.
pub struct PropertyGetCache {
    core: RootCore<GetOp>,
}

impl PropertyGetCache {
    /// Create an uninitialized read site for `key`.
    pub fn new(key: InternedString, options: RootOptions, config: Arc<CacheConfig>) -> Self {
        Self {
            core: RootCore::new(key, options, config),
        }
    }

    /// The property key this site reads.
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

    /// Discard the entry chain. The next access re-specializes from
    /// scratch; this is the only path out of the megamorphic state.
    pub fn invalidate(&self) {
        self.core.discard_chain();
    }

    /// Read the property from `receiver`.
    pub fn read(&self, heap: &ObjectHeap, realm: &Realm, receiver: Value) -> EngineResult<Value> {
        let cx = SpecCx {
            heap,
            realm,
            config: &self.core.config,
            options: self.core.options,
            key: &self.core.key,
        };
        for _ in 0..MAX_EXEC_RETRIES {
            let entry = match self.core.scan(heap, receiver, None) {
                Scan::Use(e) | Scan::Generic(e) => {
                    self.core.record_hit();
                    e
                }
                Scan::Miss | Scan::Invalid => {
                    self.core.record_miss();
                    self.core.specialize(&cx, receiver, None, &GetSpecializer)
                }
            };
            match exec_get(&entry, heap, realm, &self.core.key, self.core.options, receiver)? {
                Exec::Done(value) => return Ok(value),
                Exec::Respecialize => self.core.discard_chain(),
            }
        }
        // The layout is churning faster than we can specialize; the
        // uncached path is always correct.
        ordinary_get(heap, realm, receiver, &self.core.key)
    }

    /// Read an int-typed value, or `None` if the property's current value
    /// is not a small integer.
    pub fn try_read_int(
        &self,
        heap: &ObjectHeap,
        realm: &Realm,
        receiver: Value,
    ) -> EngineResult<Option<i64>> {
        Ok(self.read(heap, realm, receiver)?.as_int())
    }

    /// Read a double-typed value (ints widen), or `None` for non-numbers.
    pub fn try_read_double(
        &self,
        heap: &ObjectHeap,
        realm: &Realm,
        receiver: Value,
    ) -> EngineResult<Option<f64>> {
        Ok(self.read(heap, realm, receiver)?.as_number())
    }

    /// Read a boolean value, or `None` for non-booleans.
    pub fn try_read_bool(
        &self,
        heap: &ObjectHeap,
        realm: &Realm,
        receiver: Value,
    ) -> EngineResult<Option<bool>> {
        Ok(self.read(heap, realm, receiver)?.as_bool())
    }
}

impl std::fmt::Debug for PropertyGetCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyGetCache")
            .field("key", &self.core.key.as_str())
            .field("state", &self.core.state())
            .finish()
    }
}
