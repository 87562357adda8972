//! Benchmarks for the cached property read/write hot paths.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use opal_core::{Value, intern};
use opal_ic::{CacheConfig, PropertyGetCache, PropertySetCache, RootOptions};
use opal_runtime::object::heap::ObjectHeap;
use opal_runtime::object::shape::{PropertyFlags, ShapeRegistry};
use opal_runtime::realm::Realm;
use std::sync::Arc;

fn setup() -> (ObjectHeap, Realm) {
    let heap = ObjectHeap::new(Arc::new(ShapeRegistry::new()));
    let realm = Realm::bootstrap(&heap);
    (heap, realm)
}

fn bench_monomorphic_read(c: &mut Criterion) {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(intern("x"), RootOptions::empty(), Arc::new(CacheConfig::new()));

    let id = heap.alloc(Some(realm.object_prototype));
    heap.add_property(id, intern("x"), Value::int(42).unwrap(), PropertyFlags::default());
    let receiver = Value::object(id);

    // Warm the site.
    site.read(&heap, &realm, receiver).unwrap();

    c.bench_function("monomorphic_read", |b| {
        b.iter(|| site.read(&heap, &realm, black_box(receiver)).unwrap())
    });
}

fn bench_polymorphic_read(c: &mut Criterion) {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(intern("x"), RootOptions::empty(), Arc::new(CacheConfig::new()));

    let receivers: Vec<Value> = (0..4)
        .map(|i| {
            let id = heap.alloc(Some(realm.object_prototype));
            for j in 0..i {
                heap.add_property(
                    id,
                    intern(&format!("pad{j}")),
                    Value::int(0).unwrap(),
                    PropertyFlags::default(),
                );
            }
            heap.add_property(id, intern("x"), Value::int(i).unwrap(), PropertyFlags::default());
            Value::object(id)
        })
        .collect();

    for r in &receivers {
        site.read(&heap, &realm, *r).unwrap();
    }

    c.bench_function("polymorphic_read", |b| {
        let mut i = 0;
        b.iter(|| {
            let r = receivers[i & 3];
            i += 1;
            site.read(&heap, &realm, black_box(r)).unwrap()
        })
    });
}

fn bench_prototype_chain_read(c: &mut Criterion) {
    let (heap, realm) = setup();
    let site = PropertyGetCache::new(intern("deep"), RootOptions::empty(), Arc::new(CacheConfig::new()));

    let grandparent = heap.alloc(Some(realm.object_prototype));
    heap.add_property(
        grandparent,
        intern("deep"),
        Value::int(7).unwrap(),
        PropertyFlags::default(),
    );
    let parent = heap.alloc(Some(grandparent));
    let child = heap.alloc(Some(parent));
    let receiver = Value::object(child);

    site.read(&heap, &realm, receiver).unwrap();

    c.bench_function("prototype_chain_read", |b| {
        b.iter(|| site.read(&heap, &realm, black_box(receiver)).unwrap())
    });
}

fn bench_monomorphic_write(c: &mut Criterion) {
    let (heap, realm) = setup();
    let site = PropertySetCache::new(intern("x"), RootOptions::empty(), Arc::new(CacheConfig::new()));

    let id = heap.alloc(Some(realm.object_prototype));
    heap.add_property(id, intern("x"), Value::int(0).unwrap(), PropertyFlags::default());
    let receiver = Value::object(id);

    site.write(&heap, &realm, receiver, Value::int(1).unwrap())
        .unwrap();

    c.bench_function("monomorphic_write", |b| {
        b.iter(|| {
            site.write(&heap, &realm, black_box(receiver), Value::int(2).unwrap())
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_monomorphic_read,
    bench_polymorphic_read,
    bench_prototype_chain_read,
    bench_monomorphic_write
);
criterion_main!(benches);
