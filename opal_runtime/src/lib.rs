//! Shape-based object model for the Opal runtime.
//!
//! This crate is the object-model collaborator of the property cache core:
//! shapes (hidden classes) with structurally-shared transitions, dynamic
//! objects with inline/overflow storage, exotic objects (proxies, arrays,
//! primitive wrappers), the assumption/invalidation subsystem, and the
//! uncached reference lookup path that defines the semantics every cache
//! fast path must reproduce.

pub mod assumptions;
pub mod hooks;
pub mod object;
pub mod realm;

pub use assumptions::{AssumptionCell, PropertyAssumptionRegistry};
pub use hooks::{CountingListener, ShapeListener};
pub use object::heap::{ObjectCell, ObjectHeap};
pub use object::ordinary::{
    MAX_PROTOTYPE_DEPTH, call_getter, call_setter, compute_property, ordinary_get, ordinary_has,
    ordinary_set,
};
pub use object::shape::{
    PropertyDescriptor, PropertyFlags, PropertyKind, Shape, ShapeId, ShapeRegistry, StorageKind,
};
pub use realm::Realm;
