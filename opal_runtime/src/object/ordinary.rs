//! The uncached reference lookup path.
//!
//! `ordinary_get` / `ordinary_set` / `ordinary_has` implement the full
//! dynamic property-access semantics by walking the prototype chain on
//! every call. The cache core's generic entries execute these directly, and
//! every specialized fast path must be observably equivalent to them.

use opal_core::{EngineError, EngineResult, InternedString, ObjectId, Value};

use crate::object::exotic::ExoticData;
use crate::object::heap::{DictEntry, ObjectHeap};
use crate::object::shape::{ComputedKind, PropertyFlags, PropertyKind};
use crate::realm::Realm;

/// Bound on prototype-chain walks. Chains are user-constructible and a
/// direct cycle must not hang or crash the engine; beyond the bound the
/// property is treated as absent.
pub const MAX_PROTOTYPE_DEPTH: usize = 128;

// =============================================================================
// Get
// =============================================================================

/// Read `receiver.key` with full dynamic semantics.
pub fn ordinary_get(
    heap: &ObjectHeap,
    realm: &Realm,
    receiver: Value,
    key: &InternedString,
) -> EngineResult<Value> {
    if receiver.is_nullish() {
        return Err(EngineError::nullish_receiver("read", key.as_str()));
    }
    let start = match receiver.as_object() {
        Some(id) => id,
        None => match realm.wrapper_prototype(receiver) {
            Some(proto) => proto,
            None => return Ok(Value::undefined()),
        },
    };
    get_from_object(heap, start, key, receiver)
}

/// Read `key` starting the lookup at `start`, with `receiver` as the
/// original receiver (for accessors and computed properties).
pub fn get_from_object(
    heap: &ObjectHeap,
    start: ObjectId,
    key: &InternedString,
    receiver: Value,
) -> EngineResult<Value> {
    let mut current = start;
    for _ in 0..MAX_PROTOTYPE_DEPTH {
        let cell = heap.cell(current);

        if let Some(ExoticData::Proxy {
            target,
            handler,
            revoked,
        }) = cell.exotic()
        {
            if revoked.load(std::sync::atomic::Ordering::Acquire) {
                return Err(EngineError::revoked_proxy());
            }
            return handler.clone().get(heap, *target, key, receiver);
        }

        if heap.is_dictionary(current) {
            if let Some(entry) = heap.dict_lookup(current, key) {
                return read_found_dict(heap, current, &entry, receiver);
            }
        } else {
            let shape = heap.shape_of(current);
            if let Some(desc) = shape.lookup(key) {
                return match desc.kind {
                    PropertyKind::Data => Ok(heap.get_slot(current, desc)),
                    PropertyKind::Accessor => {
                        let slot = heap.get_slot(current, desc);
                        call_getter(heap, slot, receiver)
                    }
                    PropertyKind::Computed(kind) => Ok(compute_property(heap, current, kind, receiver)),
                };
            }
        }

        match heap.prototype_of(current) {
            Some(proto) => current = proto,
            None => break,
        }
    }
    Ok(Value::undefined())
}

fn read_found_dict(
    heap: &ObjectHeap,
    holder: ObjectId,
    entry: &DictEntry,
    receiver: Value,
) -> EngineResult<Value> {
    match entry.kind {
        PropertyKind::Data => Ok(entry.value),
        PropertyKind::Accessor => call_getter(heap, entry.value, receiver),
        PropertyKind::Computed(kind) => Ok(compute_property(heap, holder, kind, receiver)),
    }
}

/// Invoke the getter half of an accessor object with the original receiver.
///
/// An accessor with no getter reads as `undefined`.
pub fn call_getter(heap: &ObjectHeap, accessor: Value, receiver: Value) -> EngineResult<Value> {
    let id = accessor.as_object().expect("accessor slot holds an object");
    let cell = heap.cell(id);
    match cell.exotic() {
        Some(ExoticData::Accessor { get: Some(get), .. }) => get.clone()(heap, receiver),
        Some(ExoticData::Accessor { get: None, .. }) => Ok(Value::undefined()),
        _ => panic!("accessor slot does not hold an accessor object"),
    }
}

/// Evaluate a computed property against its holder and original receiver.
pub fn compute_property(
    heap: &ObjectHeap,
    holder: ObjectId,
    kind: ComputedKind,
    receiver: Value,
) -> Value {
    match kind {
        ComputedKind::ArrayLength => match heap.array_length(holder) {
            Some(len) => Value::int(len as i64).unwrap_or_else(|| Value::double(len as f64)),
            None => Value::undefined(),
        },
        ComputedKind::StringLength => match receiver.as_string() {
            Some(s) => Value::int(s.len() as i64).unwrap_or_else(Value::undefined),
            None => Value::undefined(),
        },
    }
}

// =============================================================================
// Set
// =============================================================================

/// Write `receiver.key = value` with full dynamic semantics.
pub fn ordinary_set(
    heap: &ObjectHeap,
    realm: &Realm,
    receiver: Value,
    key: &InternedString,
    value: Value,
    strict: bool,
) -> EngineResult<()> {
    if receiver.is_nullish() {
        return Err(EngineError::nullish_receiver("set", key.as_str()));
    }
    match receiver.as_object() {
        Some(id) => set_on_object(heap, id, key, value, receiver, strict),
        None => {
            // Primitive receiver: a setter on the wrapper chain still runs;
            // anything else cannot create a property on a primitive.
            if let Some(proto) = realm.wrapper_prototype(receiver) {
                if let Some((holder, found)) = find_property(heap, proto, key) {
                    match found.kind {
                        PropertyKind::Accessor => {
                            return call_setter(
                                heap,
                                found_value(heap, holder, key, &found),
                                receiver,
                                value,
                                key,
                                strict,
                            );
                        }
                        PropertyKind::Data | PropertyKind::Computed(_) => {}
                    }
                }
            }
            if strict {
                Err(EngineError::TypeError {
                    message: format!(
                        "cannot create property '{}' on primitive value",
                        key.as_str()
                    ),
                })
            } else {
                Ok(())
            }
        }
    }
}

/// Write `key` on `start`'s chain with `receiver` as the original receiver.
pub fn set_on_object(
    heap: &ObjectHeap,
    start: ObjectId,
    key: &InternedString,
    value: Value,
    receiver: Value,
    strict: bool,
) -> EngineResult<()> {
    let mut current = start;
    for depth in 0..MAX_PROTOTYPE_DEPTH {
        let cell = heap.cell(current);

        if let Some(ExoticData::Proxy {
            target,
            handler,
            revoked,
        }) = cell.exotic()
        {
            if revoked.load(std::sync::atomic::Ordering::Acquire) {
                return Err(EngineError::revoked_proxy());
            }
            let ok = handler.clone().set(heap, *target, key, value, receiver)?;
            if !ok && strict {
                return Err(EngineError::read_only(key.as_str()));
            }
            return Ok(());
        }

        let found = if heap.is_dictionary(current) {
            heap.dict_lookup(current, key).map(|e| FoundProperty {
                kind: e.kind,
                flags: e.flags,
                dict_value: Some(e.value),
            })
        } else {
            heap.shape_of(current).lookup(key).map(|d| FoundProperty {
                kind: d.kind,
                flags: d.flags,
                dict_value: None,
            })
        };

        if let Some(found) = found {
            return match found.kind {
                PropertyKind::Data => {
                    if !found.flags.contains(PropertyFlags::WRITABLE) {
                        return if strict {
                            Err(EngineError::read_only(key.as_str()))
                        } else {
                            Ok(())
                        };
                    }
                    if depth == 0 {
                        heap.set_data_value(current, key, value);
                        Ok(())
                    } else {
                        // Writable data on a prototype: shadow with an own
                        // property on the receiver.
                        define_on_receiver(heap, receiver, key, value, strict)
                    }
                }
                PropertyKind::Accessor => {
                    let accessor = found_value(heap, current, key, &found);
                    call_setter(heap, accessor, receiver, value, key, strict)
                }
                PropertyKind::Computed(ComputedKind::ArrayLength)
                    if depth == 0 && found.flags.contains(PropertyFlags::WRITABLE) =>
                {
                    heap.set_array_length(current, value)
                }
                PropertyKind::Computed(_) => {
                    if strict {
                        Err(EngineError::read_only(key.as_str()))
                    } else {
                        Ok(())
                    }
                }
            };
        }

        match heap.prototype_of(current) {
            Some(proto) => current = proto,
            None => break,
        }
    }

    // Absent along the whole chain: create an own property.
    define_on_receiver(heap, receiver, key, value, strict)
}

struct FoundProperty {
    kind: PropertyKind,
    flags: PropertyFlags,
    dict_value: Option<Value>,
}

fn found_value(
    heap: &ObjectHeap,
    holder: ObjectId,
    key: &InternedString,
    found: &FoundProperty,
) -> Value {
    match found.dict_value {
        Some(v) => v,
        None => {
            let shape = heap.shape_of(holder);
            let desc = shape.lookup(key).expect("descriptor vanished");
            heap.get_slot(holder, desc)
        }
    }
}

/// Invoke the setter half of an accessor object with the original receiver.
///
/// A missing setter raises in strict mode and is a no-op otherwise.
pub fn call_setter(
    heap: &ObjectHeap,
    accessor: Value,
    receiver: Value,
    value: Value,
    key: &InternedString,
    strict: bool,
) -> EngineResult<()> {
    let id = accessor.as_object().expect("accessor slot holds an object");
    let cell = heap.cell(id);
    match cell.exotic() {
        Some(ExoticData::Accessor { set: Some(set), .. }) => set.clone()(heap, receiver, value),
        Some(ExoticData::Accessor { set: None, .. }) => {
            if strict {
                Err(EngineError::no_setter(key.as_str()))
            } else {
                Ok(())
            }
        }
        _ => panic!("accessor slot does not hold an accessor object"),
    }
}

fn define_on_receiver(
    heap: &ObjectHeap,
    receiver: Value,
    key: &InternedString,
    value: Value,
    strict: bool,
) -> EngineResult<()> {
    let Some(id) = receiver.as_object() else {
        return if strict {
            Err(EngineError::TypeError {
                message: format!(
                    "cannot create property '{}' on primitive value",
                    key.as_str()
                ),
            })
        } else {
            Ok(())
        };
    };
    if !heap.is_extensible(id) {
        return if strict {
            Err(EngineError::TypeError {
                message: format!("cannot add property '{}', object is not extensible", key.as_str()),
            })
        } else {
            Ok(())
        };
    }
    // The receiver may already own the key (e.g. proxy forwarding).
    let owns = if heap.is_dictionary(id) {
        heap.dict_lookup(id, key).is_some()
    } else {
        heap.shape_of(id).lookup(key).is_some()
    };
    if owns {
        set_on_object(heap, id, key, value, receiver, strict)
    } else {
        heap.add_property(id, key.clone(), value, PropertyFlags::default());
        Ok(())
    }
}

// =============================================================================
// Has
// =============================================================================

/// Test `key in receiver` with full dynamic semantics.
pub fn ordinary_has(
    heap: &ObjectHeap,
    realm: &Realm,
    receiver: Value,
    key: &InternedString,
) -> EngineResult<bool> {
    if receiver.is_nullish() {
        return Err(EngineError::nullish_receiver("read", key.as_str()));
    }
    let start = match receiver.as_object() {
        Some(id) => id,
        None => match realm.wrapper_prototype(receiver) {
            Some(proto) => proto,
            None => return Ok(false),
        },
    };
    has_on_object(heap, start, key)
}

/// Test `key` along `start`'s chain.
pub fn has_on_object(
    heap: &ObjectHeap,
    start: ObjectId,
    key: &InternedString,
) -> EngineResult<bool> {
    let mut current = start;
    for _ in 0..MAX_PROTOTYPE_DEPTH {
        let cell = heap.cell(current);
        if let Some(ExoticData::Proxy {
            target,
            handler,
            revoked,
        }) = cell.exotic()
        {
            if revoked.load(std::sync::atomic::Ordering::Acquire) {
                return Err(EngineError::revoked_proxy());
            }
            return handler.clone().has(heap, *target, key);
        }
        let found = if heap.is_dictionary(current) {
            heap.dict_lookup(current, key).is_some()
        } else {
            heap.shape_of(current).lookup(key).is_some()
        };
        if found {
            return Ok(true);
        }
        match heap.prototype_of(current) {
            Some(proto) => current = proto,
            None => return Ok(false),
        }
    }
    Ok(false)
}

// =============================================================================
// Helpers used above that need shape access
// =============================================================================

/// Find the first holder of `key` along `start`'s chain (non-proxy walk).
fn find_property(
    heap: &ObjectHeap,
    start: ObjectId,
    key: &InternedString,
) -> Option<(ObjectId, FoundProperty)> {
    let mut current = start;
    for _ in 0..MAX_PROTOTYPE_DEPTH {
        if heap.is_dictionary(current) {
            if let Some(e) = heap.dict_lookup(current, key) {
                return Some((
                    current,
                    FoundProperty {
                        kind: e.kind,
                        flags: e.flags,
                        dict_value: Some(e.value),
                    },
                ));
            }
        } else if let Some(d) = heap.shape_of(current).lookup(key) {
            return Some((
                current,
                FoundProperty {
                    kind: d.kind,
                    flags: d.flags,
                    dict_value: None,
                },
            ));
        }
        current = heap.prototype_of(current)?;
    }
    None
}
