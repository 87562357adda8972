//! The dynamic object model: shapes, heap objects, exotic objects, and the
//! uncached reference lookup path.

pub mod exotic;
pub mod heap;
pub mod ordinary;
pub mod shape;

pub use exotic::{AccessorGetter, AccessorSetter, ExoticData, ForwardingHandler, ProxyHandler};
pub use heap::{DictEntry, ObjectCell, ObjectHeap};
pub use shape::{
    ComputedKind, MAX_INLINE_SLOTS, NO_SLOT, PropertyDescriptor, PropertyFlags, PropertyKind,
    Shape, ShapeId, ShapeRegistry, StorageKind,
};
