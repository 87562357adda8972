//! Cache integration tests.
//!
//! End-to-end tests exercising cache roots against the live object model:
//! state transitions, invalidation under mutation, equivalence with the
//! uncached path, and concurrent access.

use opal_core::{EngineError, InternedString, Value, intern};
use opal_runtime::object::exotic::ForwardingHandler;
use opal_runtime::object::heap::ObjectHeap;
use opal_runtime::object::ordinary::{get_from_object, ordinary_get};
use opal_runtime::object::shape::{PropertyFlags, ShapeRegistry};
use opal_runtime::realm::Realm;
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::get::PropertyGetCache;
use crate::set::PropertySetCache;
use crate::stats::CacheState;
use crate::RootOptions;

fn setup() -> (ObjectHeap, Realm) {
    let heap = ObjectHeap::new(Arc::new(ShapeRegistry::new()));
    let realm = Realm::bootstrap(&heap);
    (heap, realm)
}

fn get_site(key: &str) -> PropertyGetCache {
    PropertyGetCache::new(intern(key), RootOptions::empty(), Arc::new(CacheConfig::new()))
}

fn set_site(key: &str) -> PropertySetCache {
    PropertySetCache::new(intern(key), RootOptions::empty(), Arc::new(CacheConfig::new()))
}

fn val(i: i64) -> Value {
    Value::int(i).unwrap()
}

fn obj_with(heap: &ObjectHeap, realm: &Realm, props: &[(&str, Value)]) -> Value {
    let id = heap.alloc(Some(realm.object_prototype));
    for (k, v) in props {
        heap.add_property(id, intern(k), *v, PropertyFlags::default());
    }
    Value::object(id)
}

// =============================================================================
// State Machine
// =============================================================================

/// Repeatedly feeding the same receiver shape must not grow the chain.
#[test]
fn test_monomorphic_idempotence() {
    let (heap, realm) = setup();
    let site = get_site("x");

    for i in 0..100 {
        let receiver = obj_with(&heap, &realm, &[("x", val(i))]);
        assert_eq!(site.read(&heap, &realm, receiver).unwrap(), val(i));
    }

    assert_eq!(site.state(), CacheState::Monomorphic);
    assert_eq!(site.stats().entries, 1);
    // One miss to populate, the rest hits.
    assert!(site.stats().hits >= 99);
}

/// Distinct receiver shapes beyond the limit demote the site to a single
/// generic entry, and it stays there.
#[test]
fn test_boundedness_megamorphic_demotion() {
    let (heap, realm) = setup();
    let config = CacheConfig::new();
    let limit = config.property_cache_limit;
    let site = PropertyGetCache::new(intern("p"), RootOptions::empty(), Arc::new(config));

    for i in 0..(limit + 4) {
        // Different leading property per object forces a distinct shape.
        let id = heap.alloc(Some(realm.object_prototype));
        heap.add_property(id, intern(&format!("filler{i}")), val(0), PropertyFlags::default());
        heap.add_property(id, intern("p"), val(i as i64), PropertyFlags::default());
        assert_eq!(
            site.read(&heap, &realm, Value::object(id)).unwrap(),
            val(i as i64)
        );
        assert!(
            site.stats().entries <= limit,
            "chain exceeded limit: {}",
            site.stats().entries
        );
    }

    assert_eq!(site.state(), CacheState::Megamorphic);
    assert_eq!(site.stats().entries, 1);

    // Megamorphic is terminal under ordinary traffic.
    let receiver = obj_with(&heap, &realm, &[("p", val(7))]);
    assert_eq!(site.read(&heap, &realm, receiver).unwrap(), val(7));
    assert_eq!(site.state(), CacheState::Megamorphic);

    // Only an explicit discard resets the site.
    site.invalidate();
    assert_eq!(site.state(), CacheState::Uninitialized);
    let receiver = obj_with(&heap, &realm, &[("p", val(8))]);
    assert_eq!(site.read(&heap, &realm, receiver).unwrap(), val(8));
    assert_eq!(site.state(), CacheState::Monomorphic);
}

/// Sibling shapes with a compatible layout for the key collapse into one
/// combined entry instead of growing the chain.
#[test]
fn test_shape_merge_keeps_site_monomorphic() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let a = obj_with(&heap, &realm, &[("x", val(1)), ("y", val(2))]);
    let b = obj_with(&heap, &realm, &[("x", val(3)), ("z", val(4))]);

    assert_eq!(site.read(&heap, &realm, a).unwrap(), val(1));
    assert_eq!(site.read(&heap, &realm, b).unwrap(), val(3));

    // Both shapes hold x at the same slot with the same storage; merged.
    assert_eq!(site.stats().entries, 1);
    assert_eq!(site.read(&heap, &realm, a).unwrap(), val(1));
    assert_eq!(site.read(&heap, &realm, b).unwrap(), val(3));
}

// =============================================================================
// Spec Scenarios
// =============================================================================

/// Reading `.x` keeps working when a shape transition adds `y`.
#[test]
fn test_shape_growth_no_stale_reads() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let small = obj_with(&heap, &realm, &[("x", val(1))]);
    assert_eq!(site.read(&heap, &realm, small).unwrap(), val(1));

    let big = obj_with(&heap, &realm, &[("x", val(1)), ("y", val(2))]);
    assert_eq!(site.read(&heap, &realm, big).unwrap(), val(1));

    // Growing the first object itself must also keep reading correctly.
    let id = small.as_object().unwrap();
    heap.add_property(id, intern("y"), val(9), PropertyFlags::default());
    assert_eq!(site.read(&heap, &realm, small).unwrap(), val(1));
}

/// A prototype accessor invoked through many children runs with each
/// child's own `this`, and the site stays bounded.
#[test]
fn test_prototype_accessor_receives_original_receiver() {
    let (heap, realm) = setup();
    let site = get_site("doubled");

    let proto = heap.alloc(Some(realm.object_prototype));
    heap.install_accessor(
        proto,
        intern("doubled"),
        Some(Arc::new(|heap: &ObjectHeap, receiver: Value| {
            let id = receiver.as_object().expect("object receiver");
            let v = get_from_object(heap, id, &intern("v"), receiver)?;
            Ok(Value::int(v.as_int().unwrap_or(0) * 2).unwrap())
        })),
        None,
        PropertyFlags::default(),
    );

    let mut children = Vec::new();
    for i in 0..1000 {
        let child = heap.alloc(Some(proto));
        heap.add_property(child, intern("v"), val(i), PropertyFlags::default());
        children.push(child);
    }

    for (i, child) in children.iter().enumerate() {
        assert_eq!(
            site.read(&heap, &realm, Value::object(*child)).unwrap(),
            val(i as i64 * 2)
        );
    }

    // 1000 children share one shape; the site must not hold 1000 entries.
    assert!(site.stats().entries <= 2, "entries: {}", site.stats().entries);
}

/// Writing a double into an int-specialized slot re-specializes instead of
/// truncating.
#[test]
fn test_numeric_widening_never_truncates() {
    let (heap, realm) = setup();
    let write = set_site("len");
    let read = get_site("len");

    let receiver = obj_with(&heap, &realm, &[("len", val(0))]);

    // Warm the write site with integer traffic.
    for i in 1..10 {
        write.write(&heap, &realm, receiver, val(i)).unwrap();
    }
    assert_eq!(read.read(&heap, &realm, receiver).unwrap(), val(9));

    // Boundary value: must widen, never truncate to 3.
    write
        .write(&heap, &realm, receiver, Value::double(3.5))
        .unwrap();
    let got = read.read(&heap, &realm, receiver).unwrap();
    assert_eq!(got.as_double(), Some(3.5));

    // Integers written afterwards live in the widened slot losslessly.
    write.write(&heap, &realm, receiver, val(4)).unwrap();
    assert_eq!(
        read.read(&heap, &realm, receiver).unwrap().as_number(),
        Some(4.0)
    );
}

/// A revoked proxy raises on every access, even after the site served a
/// healthy proxy through its generic-shaped entry.
#[test]
fn test_revoked_proxy_always_raises() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let target = obj_with(&heap, &realm, &[("x", val(1))])
        .as_object()
        .unwrap();
    let healthy = heap.alloc_proxy(target, Arc::new(ForwardingHandler));
    let doomed = heap.alloc_proxy(target, Arc::new(ForwardingHandler));

    assert_eq!(
        site.read(&heap, &realm, Value::object(healthy)).unwrap(),
        val(1)
    );

    heap.revoke_proxy(doomed);
    for _ in 0..3 {
        let err = site.read(&heap, &realm, Value::object(doomed)).unwrap_err();
        assert_eq!(err, EngineError::revoked_proxy());
    }

    // The healthy proxy keeps working through the same site.
    assert_eq!(
        site.read(&heap, &realm, Value::object(healthy)).unwrap(),
        val(1)
    );
}

// =============================================================================
// Invalidation Soundness
// =============================================================================

/// A cached prototype hit must die when the prototype loses the property.
#[test]
fn test_prototype_delete_invalidates_cached_holder() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let proto = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto, intern("x"), val(42), PropertyFlags::default());
    let child = heap.alloc(Some(proto));

    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(42));
    // Cached; now mutate the prototype.
    assert!(heap.delete_property(proto, &intern("x")));

    let got = site.read(&heap, &realm, Value::object(child)).unwrap();
    assert!(got.is_undefined(), "stale prototype hit: {got:?}");
}

/// An absent-property entry must die when the prototype gains the key.
#[test]
fn test_prototype_gain_invalidates_absent_entry() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let proto = heap.alloc(Some(realm.object_prototype));
    let child = heap.alloc(Some(proto));

    assert!(site
        .read(&heap, &realm, Value::object(child))
        .unwrap()
        .is_undefined());

    heap.add_property(proto, intern("x"), val(5), PropertyFlags::default());
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(5));
}

/// Value writes through the prototype are visible through the cached
/// holder without invalidation.
#[test]
fn test_prototype_value_update_visible() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let proto = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto, intern("x"), val(1), PropertyFlags::default());
    let child = heap.alloc(Some(proto));

    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(1));
    heap.set_data_value(proto, &intern("x"), val(2));
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(2));
}

/// Replacing the receiver's prototype redirects reads immediately.
#[test]
fn test_prototype_swap_redirects_lookup() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let proto_a = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto_a, intern("x"), val(1), PropertyFlags::default());
    let proto_b = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto_b, intern("x"), val(2), PropertyFlags::default());

    let child = heap.alloc(Some(proto_a));
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(1));

    heap.set_prototype(child, Some(proto_b));
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(2));
}

/// An invalidated entry behind a matching one still forces a rebuild
/// before the match is used (accept-and-keep-scanning).
#[test]
fn test_invalid_tail_entry_forces_rebuild() {
    let (heap, realm) = setup();
    let site = get_site("x");

    // Entry for shape A lands at the tail once B is inserted at the head.
    // B holds x at a different slot, so the two entries cannot merge.
    let a = obj_with(&heap, &realm, &[("x", val(1))]);
    let b = obj_with(&heap, &realm, &[("extra", Value::bool(true)), ("x", val(2))]);
    assert_eq!(site.read(&heap, &realm, a).unwrap(), val(1));
    assert_eq!(site.read(&heap, &realm, b).unwrap(), val(2));

    // Kill the tail entry's shape by dictionary-converting an A-shaped
    // object (invalidates the shape's validity token).
    heap.convert_to_dictionary_mode(a.as_object().unwrap());

    let rebuilds_before = site.stats().rebuilds;
    // b still matches its own (healthy) entry, but the dead tail entry
    // must push this access through the slow path first.
    assert_eq!(site.read(&heap, &realm, b).unwrap(), val(2));
    assert!(site.stats().rebuilds > rebuilds_before);
}

/// Accessor installation over a cached data property takes effect on the
/// next access.
#[test]
fn test_accessor_install_invalidates_slot_entry() {
    let (heap, realm) = setup();
    let site = get_site("x");

    let proto = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto, intern("x"), val(1), PropertyFlags::default());
    let child = heap.alloc(Some(proto));
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(1));

    heap.install_accessor(
        proto,
        intern("x"),
        Some(Arc::new(|_: &ObjectHeap, _receiver: Value| Ok(val(99)))),
        None,
        PropertyFlags::default(),
    );
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(99));
}

// =============================================================================
// Correctness Under Churn
// =============================================================================

/// Interleaved mutations and cached reads always agree with the uncached
/// reference path.
#[test]
fn test_churn_equivalence_with_uncached_path() {
    let (heap, realm) = setup();
    let site = get_site("k");
    let key = intern("k");

    let proto = heap.alloc(Some(realm.object_prototype));
    let receivers: Vec<Value> = (0..4)
        .map(|_| Value::object(heap.alloc(Some(proto))))
        .collect();

    for round in 0..40i64 {
        // Rotate through a fixed mutation schedule.
        let target = receivers[(round % 4) as usize].as_object().unwrap();
        match round % 5 {
            0 => heap.add_property_or_set(target, key.clone(), val(round)),
            1 => {
                let _ = heap.delete_property(target, &key);
            }
            2 => heap.add_property_or_set(proto, key.clone(), val(round * 10)),
            3 => {
                let _ = heap.delete_property(proto, &key);
            }
            _ => heap.add_property_or_set(target, key.clone(), Value::double(round as f64 + 0.5)),
        }

        for receiver in &receivers {
            let cached = site.read(&heap, &realm, *receiver).unwrap();
            let uncached = ordinary_get(&heap, &realm, *receiver, &key).unwrap();
            assert_eq!(cached, uncached, "divergence at round {round}");
        }
    }
}

// =============================================================================
// Write Side
// =============================================================================

/// Cached add transitions apply to every object sharing the old shape.
#[test]
fn test_cached_define_shares_transition() {
    let (heap, realm) = setup();
    let site = set_site("n");

    let a = heap.alloc(Some(realm.object_prototype));
    let b = heap.alloc(Some(realm.object_prototype));

    site.write(&heap, &realm, Value::object(a), val(1)).unwrap();
    site.write(&heap, &realm, Value::object(b), val(2)).unwrap();

    assert_eq!(heap.shape_of(a).id(), heap.shape_of(b).id());
    assert_eq!(
        ordinary_get(&heap, &realm, Value::object(a), &intern("n")).unwrap(),
        val(1)
    );
    assert_eq!(
        ordinary_get(&heap, &realm, Value::object(b), &intern("n")).unwrap(),
        val(2)
    );
}

/// Strict sites raise on read-only writes; sloppy sites no-op.
#[test]
fn test_read_only_write_semantics() {
    let (heap, realm) = setup();
    let config = Arc::new(CacheConfig::new());
    let strict = PropertySetCache::new(intern("ro"), RootOptions::STRICT, config.clone());
    let sloppy = PropertySetCache::new(intern("ro"), RootOptions::empty(), config);

    let id = heap.alloc(Some(realm.object_prototype));
    heap.add_property(id, intern("ro"), val(1), PropertyFlags::read_only());
    let receiver = Value::object(id);

    for _ in 0..2 {
        let err = strict.write(&heap, &realm, receiver, val(2)).unwrap_err();
        assert_eq!(err, EngineError::read_only("ro"));
    }
    sloppy.write(&heap, &realm, receiver, val(2)).unwrap();
    assert_eq!(
        ordinary_get(&heap, &realm, receiver, &intern("ro")).unwrap(),
        val(1)
    );
}

/// Writes to `undefined`/`null` receivers raise through the cache.
#[test]
fn test_nullish_receiver_write_raises() {
    let (heap, realm) = setup();
    let site = set_site("x");
    for receiver in [Value::undefined(), Value::null()] {
        let err = site.write(&heap, &realm, receiver, val(1)).unwrap_err();
        assert!(matches!(err, EngineError::TypeError { .. }));
    }
    // Reads raise too.
    let get = get_site("x");
    assert!(get.read(&heap, &realm, Value::undefined()).is_err());
}

/// Array length writes go through the exotic shrink/grow path.
#[test]
fn test_array_length_write_through_cache() {
    let (heap, realm) = setup();
    let write = PropertySetCache::new(
        intern("length"),
        RootOptions::empty(),
        Arc::new(CacheConfig::new()),
    );
    let read = get_site("length");

    let arr = heap.alloc_array(Some(realm.array_prototype), vec![val(1), val(2), val(3)]);
    let receiver = Value::object(arr);

    assert_eq!(read.read(&heap, &realm, receiver).unwrap(), val(3));
    write.write(&heap, &realm, receiver, val(1)).unwrap();
    assert_eq!(read.read(&heap, &realm, receiver).unwrap(), val(1));
    write.write(&heap, &realm, receiver, val(5)).unwrap();
    assert_eq!(read.read(&heap, &realm, receiver).unwrap(), val(5));

    let err = write
        .write(&heap, &realm, receiver, Value::double(2.5))
        .unwrap_err();
    assert_eq!(err, EngineError::invalid_array_length());
}

// =============================================================================
// Root Options
// =============================================================================

/// REQUIRED roots raise ReferenceError for absent properties.
#[test]
fn test_required_root_raises_on_absent() {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(
        intern("missing"),
        RootOptions::REQUIRED,
        Arc::new(CacheConfig::new()),
    );
    let receiver = obj_with(&heap, &realm, &[("present", val(1))]);

    for _ in 0..2 {
        let err = site.read(&heap, &realm, receiver).unwrap_err();
        assert_eq!(
            err,
            EngineError::ReferenceError {
                name: "missing".to_string()
            }
        );
    }
}

/// CONST roots reject every write.
#[test]
fn test_const_root_rejects_writes() {
    let (heap, realm) = setup();
    let site = PropertySetCache::new(
        intern("c"),
        RootOptions::CONST,
        Arc::new(CacheConfig::new()),
    );
    let receiver = obj_with(&heap, &realm, &[("c", val(1))]);
    assert!(site.write(&heap, &realm, receiver, val(2)).is_err());
}

/// GLOBAL roots pin the receiver identity; a different object with the
/// same shape evicts the entry and both keep reading correctly.
#[test]
fn test_constant_object_entry_evicted_on_other_receiver() {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(
        intern("g"),
        RootOptions::GLOBAL,
        Arc::new(CacheConfig::new()),
    );

    let global_a = obj_with(&heap, &realm, &[("g", val(1))]);
    let global_b = obj_with(&heap, &realm, &[("g", val(2))]);
    assert_eq!(heap.shape_of(global_a.as_object().unwrap()).id(),
               heap.shape_of(global_b.as_object().unwrap()).id());

    assert_eq!(site.read(&heap, &realm, global_a).unwrap(), val(1));
    assert_eq!(site.read(&heap, &realm, global_b).unwrap(), val(2));
    assert_eq!(site.read(&heap, &realm, global_a).unwrap(), val(1));
}

/// OWN_PROPERTY roots never consult the prototype chain.
#[test]
fn test_own_property_root_skips_prototypes() {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(
        intern("x"),
        RootOptions::OWN_PROPERTY,
        Arc::new(CacheConfig::new()),
    );

    let proto = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto, intern("x"), val(1), PropertyFlags::default());
    let child = heap.alloc(Some(proto));

    assert!(site
        .read(&heap, &realm, Value::object(child))
        .unwrap()
        .is_undefined());
}

/// Hidden keys flow through cache roots like any other key and never
/// collide with user-visible names.
#[test]
fn test_hidden_keys_through_cache() {
    let (heap, realm) = setup();
    let hidden = opal_core::intern_hidden("brand");
    let write = PropertySetCache::new(
        hidden.clone(),
        RootOptions::empty(),
        Arc::new(CacheConfig::new()),
    );
    let read = PropertyGetCache::new(
        hidden.clone(),
        RootOptions::empty(),
        Arc::new(CacheConfig::new()),
    );
    let user_read = get_site("brand");

    let receiver = obj_with(&heap, &realm, &[]);
    write.write(&heap, &realm, receiver, val(1)).unwrap();

    assert_eq!(read.read(&heap, &realm, receiver).unwrap(), val(1));
    // The user-visible name resolves independently.
    assert!(user_read
        .read(&heap, &realm, receiver)
        .unwrap()
        .is_undefined());
}

// =============================================================================
// Primitive Receivers
// =============================================================================

/// String length is computed per receiver through the wrapper prototype.
#[test]
fn test_string_length_through_cache() {
    let (heap, realm) = setup();
    let site = get_site("length");

    assert_eq!(
        site.read(&heap, &realm, Value::string(&intern("abc"))).unwrap(),
        val(3)
    );
    assert_eq!(
        site.read(&heap, &realm, Value::string(&intern(""))).unwrap(),
        val(0)
    );
    assert_eq!(
        site.read(&heap, &realm, Value::string(&intern("four"))).unwrap(),
        val(4)
    );
    assert_eq!(site.stats().entries, 1);
}

/// Number receivers resolve data properties from the number prototype.
#[test]
fn test_number_prototype_property_through_cache() {
    let (heap, realm) = setup();
    let site = get_site("unit");
    heap.add_property(
        realm.number_prototype,
        intern("unit"),
        val(1),
        PropertyFlags::default(),
    );

    assert_eq!(site.read(&heap, &realm, val(7)).unwrap(), val(1));
    assert_eq!(site.read(&heap, &realm, Value::double(1.5)).unwrap(), val(1));
    // Absent on booleans.
    assert!(site
        .read(&heap, &realm, Value::bool(true))
        .unwrap()
        .is_undefined());
}

// =============================================================================
// Multi-Realm Configuration
// =============================================================================

/// Without assumption shortcuts, prototype hits are guarded by physical
/// traversal and still invalidate correctly.
#[test]
fn test_multi_realm_traversal_checks() {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(
        intern("x"),
        RootOptions::empty(),
        Arc::new(CacheConfig::multi_realm()),
    );

    let proto = heap.alloc(Some(realm.object_prototype));
    heap.add_property(proto, intern("x"), val(1), PropertyFlags::default());
    let child = heap.alloc(Some(proto));

    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(1));
    assert_eq!(site.read(&heap, &realm, Value::object(child)).unwrap(), val(1));

    assert!(heap.delete_property(proto, &intern("x")));
    assert!(site
        .read(&heap, &realm, Value::object(child))
        .unwrap()
        .is_undefined());
}

// =============================================================================
// Dictionary Mode
// =============================================================================

/// Dictionary-mode receivers are served by the generic entry and stay
/// correct.
#[test]
fn test_dictionary_receiver_goes_generic() {
    let (heap, realm) = setup();
    let site = get_site("q");

    let id = heap.alloc(Some(realm.object_prototype));
    heap.add_property(id, intern("q"), val(11), PropertyFlags::default());
    heap.convert_to_dictionary_mode(id);

    assert_eq!(site.read(&heap, &realm, Value::object(id)).unwrap(), val(11));
    assert_eq!(site.state(), CacheState::Megamorphic);
}

// =============================================================================
// Concurrency
// =============================================================================

/// Shared sites survive concurrent readers and writers.
#[test]
fn test_concurrent_reads_and_writes() {
    use std::thread;

    let registry = Arc::new(ShapeRegistry::new());
    let heap = Arc::new(ObjectHeap::new(registry));
    let realm = Realm::bootstrap(&heap);
    let read_site = Arc::new(get_site("x"));
    let write_site = Arc::new(set_site("x"));

    let receiver = {
        let id = heap.alloc(Some(realm.object_prototype));
        heap.add_property(id, intern("x"), val(0), PropertyFlags::default());
        Value::object(id)
    };

    let mut handles = Vec::new();
    for t in 0..4 {
        let heap = Arc::clone(&heap);
        let read_site = Arc::clone(&read_site);
        let write_site = Arc::clone(&write_site);
        handles.push(thread::spawn(move || {
            for i in 0..500i64 {
                if t % 2 == 0 {
                    write_site
                        .write(&heap, &realm, receiver, val(i))
                        .unwrap();
                } else {
                    let got = read_site.read(&heap, &realm, receiver).unwrap();
                    assert!(got.is_int(), "unexpected value {got:?}");
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

// =============================================================================
// Helpers on the heap used only by these tests
// =============================================================================

trait AddOrSet {
    fn add_property_or_set(&self, id: opal_core::ObjectId, key: InternedString, value: Value);
}

impl AddOrSet for ObjectHeap {
    fn add_property_or_set(&self, id: opal_core::ObjectId, key: InternedString, value: Value) {
        let exists = if self.is_dictionary(id) {
            self.dict_lookup(id, &key).is_some()
        } else {
            self.shape_of(id).lookup(&key).is_some()
        };
        if exists {
            self.set_data_value(id, &key, value);
        } else {
            self.add_property(id, key, value, PropertyFlags::default());
        }
    }
}
