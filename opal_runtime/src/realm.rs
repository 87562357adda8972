//! The realm: intrinsic prototype objects.
//!
//! Primitive receivers have no shape of their own; property lookups on them
//! start at the realm's wrapper prototypes. Assumption-shortcut receiver
//! checks are only sound in single-realm embeddings because their tokens
//! are not parameterized per realm; the cache configuration carries that
//! switch.

use opal_core::{ObjectId, Value, ValueKind, intern};

use crate::object::heap::ObjectHeap;
use crate::object::shape::{ComputedKind, PropertyFlags, PropertyKind, StorageKind};

/// Intrinsic prototypes of one realm.
#[derive(Debug, Clone, Copy)]
pub struct Realm {
    /// Prototype of plain objects.
    pub object_prototype: ObjectId,
    /// Prototype for primitive string receivers. Carries the computed
    /// `length` property.
    pub string_prototype: ObjectId,
    /// Prototype for primitive number receivers (int and double).
    pub number_prototype: ObjectId,
    /// Prototype for primitive boolean receivers.
    pub boolean_prototype: ObjectId,
    /// Prototype of array objects.
    pub array_prototype: ObjectId,
}

impl Realm {
    /// Allocate the intrinsic prototypes into `heap`.
    pub fn bootstrap(heap: &ObjectHeap) -> Self {
        let object_prototype = heap.alloc(None);
        let number_prototype = heap.alloc(Some(object_prototype));
        let boolean_prototype = heap.alloc(Some(object_prototype));
        let array_prototype = heap.alloc(Some(object_prototype));

        // The string prototype starts with a computed `length` so primitive
        // string receivers resolve it without a wrapper allocation.
        let string_prototype = {
            let empty = heap
                .registry()
                .empty_shape(Some(object_prototype));
            let shape = heap.registry().transition_add(
                &empty,
                intern("length"),
                PropertyFlags::empty(),
                PropertyKind::Computed(ComputedKind::StringLength),
                StorageKind::Object,
            );
            let id = heap.alloc(Some(object_prototype));
            // Replay the computed property onto the allocated object.
            debug_assert!(shape.lookup(&intern("length")).is_some());
            heap.adopt_shape(id, &shape);
            id
        };

        Self {
            object_prototype,
            string_prototype,
            number_prototype,
            boolean_prototype,
            array_prototype,
        }
    }

    /// The prototype a primitive receiver's lookup starts at, or `None` for
    /// values that have no wrapper (objects resolve through their own
    /// shape; nullish receivers are rejected before this point).
    #[inline]
    pub fn wrapper_prototype(&self, receiver: Value) -> Option<ObjectId> {
        match receiver.kind() {
            ValueKind::Str => Some(self.string_prototype),
            ValueKind::Int | ValueKind::Double => Some(self.number_prototype),
            ValueKind::Bool => Some(self.boolean_prototype),
            _ => None,
        }
    }
}
