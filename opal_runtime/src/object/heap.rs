//! Dynamic objects and the handle-indexed object heap.
//!
//! An object is a shape pointer plus storage: fixed inline slots for the
//! first properties and a lazily-allocated overflow table for the rest.
//! Property adds, deletes, reconfigurations, and prototype changes swap the
//! shape pointer (never reinterpret storage in place); plain value writes do
//! not change the shape.
//!
//! The heap is an arena: it owns every object and hands out `ObjectId`
//! handles. Values hold handles, never pointers; collection is an external
//! collaborator concern and is not performed here.
//!
//! Every mutator that changes what a cache could have assumed about a shape
//! invalidates the corresponding assumption tokens *before* returning:
//!
//! Token invalidation walks the old shape's whole parent lineage: an object
//! may have drifted through add transitions since a cache acquired its
//! tokens against an ancestor shape, so the ancestor's tokens must die with
//! the descendant's. Adds preserve lineage and slot layout, so they only
//! kill the added key's tokens; every layout-breaking mutation kills the
//! tokens of all keys of the lineage it terminates.
//!
//! | mutation                    | invalidated over the old shape lineage  |
//! |-----------------------------|-----------------------------------------|
//! | add property `k`            | (shape, `k`) pairs                      |
//! | delete property `k`         | (shape, key) pairs for all keys         |
//! | reconfigure / widen `k`     | all (shape, key) pairs + shape validity |
//! | install accessor over `k`   | all (shape, key) pairs + shape validity |
//! | change prototype            | stable-prototype tokens                 |
//! | convert to dictionary mode  | all (shape, key) pairs + shape validity |

use opal_core::{EngineError, EngineResult, InternedString, ObjectId, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::object::exotic::{
    AccessorGetter, AccessorSetter, ExoticData, ProxyHandler, validate_array_length,
};
use crate::object::shape::{
    ComputedKind, DICTIONARY_THRESHOLD, MAX_INLINE_SLOTS, PropertyDescriptor, PropertyFlags,
    PropertyKind, Shape, ShapeRegistry, StorageKind,
};

// =============================================================================
// Object State
// =============================================================================

/// A property entry in a dictionary-mode object.
#[derive(Debug, Clone)]
pub struct DictEntry {
    /// Stored value (an accessor object for accessor properties).
    pub value: Value,
    /// Attribute flags.
    pub flags: PropertyFlags,
    /// Data / accessor / computed.
    pub kind: PropertyKind,
}

/// The mutable part of an object.
#[derive(Debug)]
pub struct ObjectState {
    /// Current shape. Swapped on layout changes, never mutated.
    shape: Arc<Shape>,

    /// Fixed inline slots (fast path).
    inline: [Value; MAX_INLINE_SLOTS],

    /// Storage for slots beyond inline capacity, keyed by property.
    overflow: Option<Box<FxHashMap<InternedString, Value>>>,

    /// Dictionary-mode storage. When present, the shape is a per-object
    /// dictionary marker and slot storage is unused.
    dictionary: Option<Box<FxHashMap<InternedString, DictEntry>>>,

    /// Whether new properties may be added.
    extensible: bool,
}

impl ObjectState {
    fn new(shape: Arc<Shape>) -> Self {
        Self {
            shape,
            inline: [Value::undefined(); MAX_INLINE_SLOTS],
            overflow: None,
            dictionary: None,
            extensible: true,
        }
    }

    /// Read the storage cell a descriptor points at.
    fn read_slot(&self, desc: &PropertyDescriptor) -> Value {
        debug_assert!(desc.has_slot(), "computed properties have no slot");
        if desc.is_inline() {
            self.inline[desc.slot as usize]
        } else {
            self.overflow
                .as_ref()
                .and_then(|o| o.get(&desc.key).copied())
                .unwrap_or_default()
        }
    }

    /// Write the storage cell a descriptor points at.
    fn write_slot(&mut self, desc: &PropertyDescriptor, value: Value) {
        debug_assert!(desc.has_slot(), "computed properties have no slot");
        if desc.is_inline() {
            self.inline[desc.slot as usize] = value;
        } else {
            self.overflow
                .get_or_insert_with(Default::default)
                .insert(desc.key.clone(), value);
        }
    }
}

// =============================================================================
// Object Cell
// =============================================================================

/// One heap object: identity, optional exotic payload, mutable state.
#[derive(Debug)]
pub struct ObjectCell {
    id: ObjectId,
    exotic: Option<ExoticData>,
    state: RwLock<ObjectState>,
}

impl ObjectCell {
    /// This object's handle.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The exotic payload, if any.
    #[inline]
    pub fn exotic(&self) -> Option<&ExoticData> {
        self.exotic.as_ref()
    }

    /// Check if this object is a proxy.
    #[inline]
    pub fn is_proxy(&self) -> bool {
        matches!(self.exotic, Some(ExoticData::Proxy { .. }))
    }

    /// Check if this object is an array.
    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self.exotic, Some(ExoticData::Array { .. }))
    }

    /// Current shape (cloned handle).
    #[inline]
    pub fn shape(&self) -> Arc<Shape> {
        Arc::clone(&self.state.read().shape)
    }
}

// =============================================================================
// Lineage Invalidation
// =============================================================================

/// Invalidate the `(shape, key)` token of `shape` and every ancestor.
fn invalidate_key_lineage(registry: &ShapeRegistry, shape: &Arc<Shape>, key: &InternedString) {
    let mut current = Some(Arc::clone(shape));
    while let Some(s) = current {
        registry.assumptions().invalidate(s.id(), key);
        current = s.parent().cloned();
    }
}

/// Invalidate the `(shape, key)` tokens of every key of `shape`, plus
/// `extra`, over the whole lineage. Used for layout-breaking mutations.
fn invalidate_layout_lineage(
    registry: &ShapeRegistry,
    shape: &Arc<Shape>,
    extra: Option<&InternedString>,
) {
    for key in shape.keys() {
        invalidate_key_lineage(registry, shape, &key);
    }
    if let Some(key) = extra {
        invalidate_key_lineage(registry, shape, key);
    }
}

/// Invalidate the stable-prototype token of `shape` and every ancestor.
fn invalidate_prototype_lineage(shape: &Arc<Shape>) {
    let mut current = Some(Arc::clone(shape));
    while let Some(s) = current {
        s.stable_prototype().invalidate();
        current = s.parent().cloned();
    }
}

// =============================================================================
// Object Heap
// =============================================================================

/// The arena that owns all objects.
pub struct ObjectHeap {
    registry: Arc<ShapeRegistry>,
    objects: RwLock<Vec<Arc<ObjectCell>>>,
}

impl ObjectHeap {
    /// Create an empty heap over the given shape registry.
    pub fn new(registry: Arc<ShapeRegistry>) -> Self {
        Self {
            registry,
            objects: RwLock::new(Vec::new()),
        }
    }

    /// The shape registry this heap transitions through.
    #[inline]
    pub fn registry(&self) -> &ShapeRegistry {
        &self.registry
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Check if the heap is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn push(&self, exotic: Option<ExoticData>, shape: Arc<Shape>) -> ObjectId {
        let mut objects = self.objects.write();
        let id = ObjectId(u32::try_from(objects.len()).expect("object heap exhausted"));
        objects.push(Arc::new(ObjectCell {
            id,
            exotic,
            state: RwLock::new(ObjectState::new(shape)),
        }));
        id
    }

    /// Fetch an object cell. A handle not minted by this heap is an engine
    /// bug, not a user condition.
    #[inline]
    pub fn cell(&self, id: ObjectId) -> Arc<ObjectCell> {
        let objects = self.objects.read();
        match objects.get(id.raw() as usize) {
            Some(cell) => Arc::clone(cell),
            None => panic!("dangling object handle #{}", id.raw()),
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a plain object with the given prototype.
    pub fn alloc(&self, prototype: Option<ObjectId>) -> ObjectId {
        let shape = self.registry.empty_shape(prototype);
        self.push(None, shape)
    }

    /// Allocate an array object. `length` is a computed, writable,
    /// non-enumerable, non-configurable property of its shape.
    pub fn alloc_array(&self, prototype: Option<ObjectId>, elements: Vec<Value>) -> ObjectId {
        let empty = self.registry.empty_shape(prototype);
        let shape = self.registry.transition_add(
            &empty,
            opal_core::intern("length"),
            PropertyFlags::WRITABLE,
            PropertyKind::Computed(ComputedKind::ArrayLength),
            StorageKind::Object,
        );
        self.push(
            Some(ExoticData::Array {
                elements: RwLock::new(elements),
            }),
            shape,
        )
    }

    /// Allocate a proxy over `target`.
    pub fn alloc_proxy(&self, target: ObjectId, handler: Arc<dyn ProxyHandler>) -> ObjectId {
        let shape = self.registry.empty_shape(None);
        self.push(
            Some(ExoticData::Proxy {
                target,
                handler,
                revoked: Default::default(),
            }),
            shape,
        )
    }

    /// Allocate an accessor pair object (stored in accessor property slots).
    pub fn alloc_accessor(
        &self,
        get: Option<AccessorGetter>,
        set: Option<AccessorSetter>,
    ) -> ObjectId {
        let shape = self.registry.empty_shape(None);
        self.push(Some(ExoticData::Accessor { get, set }), shape)
    }

    /// Swap an object onto a shape that differs only by slotless (computed)
    /// properties. Used during realm bootstrap to install intrinsics.
    pub fn adopt_shape(&self, id: ObjectId, shape: &Arc<Shape>) {
        let cell = self.cell(id);
        let mut state = cell.state.write();
        debug_assert_eq!(
            state.shape.slot_count(),
            shape.slot_count(),
            "adopt_shape cannot relocate slot storage"
        );
        state.shape = Arc::clone(shape);
    }

    /// Revoke a proxy. Subsequent traps raise the revoked-proxy error.
    pub fn revoke_proxy(&self, id: ObjectId) {
        let cell = self.cell(id);
        match cell.exotic() {
            Some(ExoticData::Proxy { revoked, .. }) => revoked.store(true, Ordering::Release),
            _ => panic!("revoke_proxy on a non-proxy object"),
        }
    }

    // =========================================================================
    // Read-side contract
    // =========================================================================

    /// Current shape of an object.
    #[inline]
    pub fn shape_of(&self, id: ObjectId) -> Arc<Shape> {
        self.cell(id).shape()
    }

    /// Prototype of an object (carried by its shape).
    #[inline]
    pub fn prototype_of(&self, id: ObjectId) -> Option<ObjectId> {
        self.shape_of(id).prototype()
    }

    /// Whether new properties may be added.
    pub fn is_extensible(&self, id: ObjectId) -> bool {
        self.cell(id).state.read().extensible
    }

    /// Forbid further property additions.
    pub fn prevent_extensions(&self, id: ObjectId) {
        self.cell(id).state.write().extensible = false;
    }

    /// Whether the object is in dictionary mode.
    pub fn is_dictionary(&self, id: ObjectId) -> bool {
        self.cell(id).state.read().dictionary.is_some()
    }

    /// Read the slot a descriptor points at.
    pub fn get_slot(&self, id: ObjectId, desc: &PropertyDescriptor) -> Value {
        self.cell(id).state.read().read_slot(desc)
    }

    /// Write the slot a descriptor points at, re-checking under the state
    /// lock that the object's current shape still declares exactly this
    /// descriptor.
    ///
    /// Returns `false` (without writing) if the object moved to an
    /// incompatible shape or to dictionary mode since the caller's receiver
    /// check; the caller re-specializes.
    pub fn set_slot_checked(&self, id: ObjectId, desc: &PropertyDescriptor, value: Value) -> bool {
        let cell = self.cell(id);
        let mut state = cell.state.write();
        if state.dictionary.is_some() {
            return false;
        }
        match state.shape.lookup(&desc.key) {
            Some(current) if current == desc => {}
            _ => return false,
        }
        state.write_slot(desc, desc.storage.normalize(value));
        true
    }

    /// Look up an own property in a dictionary-mode object.
    pub fn dict_lookup(&self, id: ObjectId, key: &InternedString) -> Option<DictEntry> {
        self.cell(id)
            .state
            .read()
            .dictionary
            .as_ref()
            .and_then(|d| d.get(key).cloned())
    }

    /// Current element count of an array object.
    pub fn array_length(&self, id: ObjectId) -> Option<usize> {
        match self.cell(id).exotic() {
            Some(ExoticData::Array { elements }) => Some(elements.read().len()),
            _ => None,
        }
    }

    /// Read an array element (out of bounds reads as `undefined`).
    pub fn array_element(&self, id: ObjectId, index: usize) -> Option<Value> {
        match self.cell(id).exotic() {
            Some(ExoticData::Array { elements }) => {
                Some(elements.read().get(index).copied().unwrap_or_default())
            }
            _ => None,
        }
    }

    // =========================================================================
    // Mutation contract
    // =========================================================================

    /// Update an existing writable data property, widening its storage kind
    /// if the new value is not representable.
    ///
    /// Callers must have established that a writable data property for `key`
    /// exists on this object (shape or dictionary).
    pub fn set_data_value(&self, id: ObjectId, key: &InternedString, value: Value) {
        let cell = self.cell(id);
        let mut state = cell.state.write();

        if let Some(dict) = state.dictionary.as_mut() {
            let entry = dict.get_mut(key).expect("dictionary property vanished");
            debug_assert!(matches!(entry.kind, PropertyKind::Data));
            entry.value = value;
            // A prototype-chain cache may hold a token on this object's
            // marker shape; the stored value is unchanged in kind though,
            // so no token is touched for plain value writes.
            return;
        }

        let old_shape = Arc::clone(&state.shape);
        let desc = old_shape
            .lookup(key)
            .expect("data property vanished")
            .clone();
        debug_assert!(matches!(desc.kind, PropertyKind::Data) && desc.is_writable());

        if desc.storage.accepts(value) {
            state.write_slot(&desc, desc.storage.normalize(value));
            return;
        }

        // Widening: reconfigure the storage kind, then store. Never
        // reinterpret the slot under the old shape.
        let widened = desc.storage.widened_for(value);
        let new_shape = self.registry.transition_reconfigure(
            &old_shape,
            key,
            desc.flags,
            desc.kind,
            widened,
        );
        let new_desc = new_shape.lookup(key).expect("reconfigured key").clone();
        state.shape = Arc::clone(&new_shape);
        state.write_slot(&new_desc, widened.normalize(value));
        drop(state);

        invalidate_layout_lineage(&self.registry, &old_shape, Some(key));
        old_shape.validity().invalidate();
        self.registry
            .listeners()
            .notify_reconfigure(old_shape.id(), key);
    }

    /// Add a brand-new property.
    ///
    /// Callers must have established that `key` is absent and the object is
    /// extensible. Converts to dictionary mode past the property threshold.
    pub fn add_property(
        &self,
        id: ObjectId,
        key: InternedString,
        value: Value,
        flags: PropertyFlags,
    ) {
        let cell = self.cell(id);
        let mut state = cell.state.write();

        if let Some(dict) = state.dictionary.as_mut() {
            dict.insert(
                key.clone(),
                DictEntry {
                    value,
                    flags,
                    kind: PropertyKind::Data,
                },
            );
            drop(state);
            let shape = self.shape_of(id);
            self.registry.assumptions().invalidate(shape.id(), &key);
            return;
        }

        if state.shape.property_count() as usize >= DICTIONARY_THRESHOLD {
            let old_shape = Arc::clone(&state.shape);
            Self::convert_state_to_dictionary(&self.registry, &mut state);
            state.dictionary.as_mut().unwrap().insert(
                key.clone(),
                DictEntry {
                    value,
                    flags,
                    kind: PropertyKind::Data,
                },
            );
            drop(state);
            // The added key was assumed absent along the old lineage.
            invalidate_key_lineage(&self.registry, &old_shape, &key);
            return;
        }

        let old_shape = Arc::clone(&state.shape);
        let storage = StorageKind::of_value(value);
        let new_shape =
            self.registry
                .transition_add(&old_shape, key.clone(), flags, PropertyKind::Data, storage);
        let desc = new_shape.property().expect("fresh transition").clone();
        state.shape = Arc::clone(&new_shape);
        state.write_slot(&desc, storage.normalize(value));
        drop(state);

        // The key was assumed absent along this lineage.
        invalidate_key_lineage(&self.registry, &old_shape, &key);
    }

    /// Cached-transition fast path for new-property writes.
    ///
    /// Verifies the object still has `expected` as its shape (a concurrent
    /// mutation may have moved it); on success performs the slot store and
    /// the shape swap in one step. Returns `false` if the shape moved.
    pub fn apply_cached_add(
        &self,
        id: ObjectId,
        expected: &Arc<Shape>,
        new_shape: &Arc<Shape>,
        value: Value,
    ) -> bool {
        let cell = self.cell(id);
        let mut state = cell.state.write();
        if !Arc::ptr_eq(&state.shape, expected) || state.dictionary.is_some() {
            return false;
        }
        let desc = new_shape.property().expect("add transition").clone();
        if !desc.storage.accepts(value) {
            return false;
        }
        state.shape = Arc::clone(new_shape);
        state.write_slot(&desc, desc.storage.normalize(value));
        drop(state);

        invalidate_key_lineage(&self.registry, expected, &desc.key);
        true
    }

    /// Define or redefine a data property with explicit attributes.
    ///
    /// Absent keys are added; present keys have their value stored and, if
    /// the attributes differ, are reconfigured (with the invalidation that
    /// entails). Redefining a non-configurable property is rejected.
    pub fn define_property(
        &self,
        id: ObjectId,
        key: InternedString,
        value: Value,
        flags: PropertyFlags,
    ) -> bool {
        let existing = if self.is_dictionary(id) {
            self.dict_lookup(id, &key).map(|e| e.flags)
        } else {
            self.shape_of(id).lookup(&key).map(|d| d.flags)
        };
        match existing {
            None => {
                if !self.is_extensible(id) {
                    return false;
                }
                self.add_property(id, key, value, flags);
                true
            }
            Some(current) => {
                if current != flags && !current.contains(PropertyFlags::CONFIGURABLE) {
                    return false;
                }
                if current != flags {
                    self.reconfigure_flags(id, &key, flags);
                }
                self.set_defined_value(id, &key, value);
                true
            }
        }
    }

    /// Reconfigure an existing property's attribute flags.
    fn reconfigure_flags(&self, id: ObjectId, key: &InternedString, flags: PropertyFlags) {
        let cell = self.cell(id);
        let mut state = cell.state.write();

        if let Some(dict) = state.dictionary.as_mut() {
            if let Some(entry) = dict.get_mut(key) {
                entry.flags = flags;
            }
            drop(state);
            let shape = self.shape_of(id);
            self.registry.assumptions().invalidate(shape.id(), key);
            return;
        }

        let old_shape = Arc::clone(&state.shape);
        let Some(desc) = old_shape.lookup(key).cloned() else {
            return;
        };
        let new_shape =
            self.registry
                .transition_reconfigure(&old_shape, key, flags, desc.kind, desc.storage);
        state.shape = Arc::clone(&new_shape);
        drop(state);

        invalidate_layout_lineage(&self.registry, &old_shape, Some(key));
        old_shape.validity().invalidate();
        self.registry.listeners().notify_reconfigure(old_shape.id(), key);
    }

    /// Store a value into a property that is known to exist, regardless of
    /// its writable attribute (definition semantics, not assignment).
    fn set_defined_value(&self, id: ObjectId, key: &InternedString, value: Value) {
        let cell = self.cell(id);
        let mut state = cell.state.write();

        if let Some(dict) = state.dictionary.as_mut() {
            if let Some(entry) = dict.get_mut(key) {
                entry.value = value;
                entry.kind = PropertyKind::Data;
            }
            return;
        }

        let old_shape = Arc::clone(&state.shape);
        let Some(desc) = old_shape.lookup(key).cloned() else {
            return;
        };
        if matches!(desc.kind, PropertyKind::Data) && desc.storage.accepts(value) {
            state.write_slot(&desc, desc.storage.normalize(value));
            return;
        }
        // Kind or representation changed: reconfigure to a data property
        // with storage wide enough for the value. A kind change can
        // renumber later slots (computed properties hold none), so the
        // surviving values are remapped into the new layout.
        let storage = desc.storage.widened_for(value);
        let new_shape = self.registry.transition_reconfigure(
            &old_shape,
            key,
            desc.flags,
            PropertyKind::Data,
            storage,
        );
        let mut values: FxHashMap<InternedString, Value> = FxHashMap::default();
        for d in old_shape.descriptors() {
            if d.has_slot() && &d.key != key {
                values.insert(d.key.clone(), state.read_slot(&d));
            }
        }
        state.shape = Arc::clone(&new_shape);
        state.inline = [Value::undefined(); MAX_INLINE_SLOTS];
        state.overflow = None;
        for d in new_shape.descriptors() {
            if !d.has_slot() {
                continue;
            }
            if &d.key == key {
                state.write_slot(&d, storage.normalize(value));
            } else {
                let v = values.remove(&d.key).unwrap_or_default();
                state.write_slot(&d, v);
            }
        }
        drop(state);

        invalidate_layout_lineage(&self.registry, &old_shape, Some(key));
        old_shape.validity().invalidate();
        self.registry.listeners().notify_reconfigure(old_shape.id(), key);
    }

    /// Install an accessor property (add or redefine).
    pub fn install_accessor(
        &self,
        id: ObjectId,
        key: InternedString,
        get: Option<AccessorGetter>,
        set: Option<AccessorSetter>,
        flags: PropertyFlags,
    ) {
        let accessor = Value::object(self.alloc_accessor(get, set));
        let cell = self.cell(id);
        let mut state = cell.state.write();

        if let Some(dict) = state.dictionary.as_mut() {
            dict.insert(
                key.clone(),
                DictEntry {
                    value: accessor,
                    flags,
                    kind: PropertyKind::Accessor,
                },
            );
            drop(state);
            let shape = self.shape_of(id);
            self.registry.assumptions().invalidate(shape.id(), &key);
            self.registry
                .listeners()
                .notify_accessor_installed(shape.id(), &key);
            return;
        }

        let old_shape = Arc::clone(&state.shape);
        let redefining = old_shape.lookup(&key).is_some();
        let new_shape = if redefining {
            self.registry.transition_reconfigure(
                &old_shape,
                &key,
                flags,
                PropertyKind::Accessor,
                StorageKind::Object,
            )
        } else {
            self.registry.transition_add(
                &old_shape,
                key.clone(),
                flags,
                PropertyKind::Accessor,
                StorageKind::Object,
            )
        };
        // Redefining a computed property introduces a slot where none was,
        // renumbering later slots; remap the surviving values.
        let mut values: FxHashMap<InternedString, Value> = FxHashMap::default();
        for d in old_shape.descriptors() {
            if d.has_slot() && d.key != key {
                values.insert(d.key.clone(), state.read_slot(&d));
            }
        }
        state.shape = Arc::clone(&new_shape);
        state.inline = [Value::undefined(); MAX_INLINE_SLOTS];
        state.overflow = None;
        for d in new_shape.descriptors() {
            if !d.has_slot() {
                continue;
            }
            if d.key == key {
                state.write_slot(&d, accessor);
            } else {
                let v = values.remove(&d.key).unwrap_or_default();
                state.write_slot(&d, v);
            }
        }
        drop(state);

        if redefining {
            invalidate_layout_lineage(&self.registry, &old_shape, Some(&key));
            old_shape.validity().invalidate();
        } else {
            invalidate_key_lineage(&self.registry, &old_shape, &key);
        }
        self.registry
            .listeners()
            .notify_accessor_installed(old_shape.id(), &key);
    }

    /// Delete a property. Returns whether a property was removed.
    pub fn delete_property(&self, id: ObjectId, key: &InternedString) -> bool {
        let cell = self.cell(id);
        let mut state = cell.state.write();

        if let Some(dict) = state.dictionary.as_mut() {
            let removed = match dict
                .get(key)
                .map(|e| e.flags.contains(PropertyFlags::CONFIGURABLE))
            {
                Some(true) => {
                    dict.remove(key);
                    true
                }
                Some(false) => return false,
                None => false,
            };
            if removed {
                let shape = Arc::clone(&state.shape);
                drop(state);
                self.registry.assumptions().invalidate(shape.id(), key);
                self.registry.listeners().notify_delete(shape.id(), key);
            }
            return removed;
        }

        let old_shape = Arc::clone(&state.shape);
        let Some(desc) = old_shape.lookup(key).cloned() else {
            return false;
        };
        if !desc.is_configurable() {
            return false;
        }

        // Deleting reassigns the slots of every later property; move the
        // surviving values into the compacted layout.
        let new_shape = self.registry.transition_delete(&old_shape, key);
        let mut values: FxHashMap<InternedString, Value> = FxHashMap::default();
        for d in old_shape.descriptors() {
            if d.has_slot() && &d.key != key {
                values.insert(d.key.clone(), state.read_slot(&d));
            }
        }
        state.shape = Arc::clone(&new_shape);
        state.inline = [Value::undefined(); MAX_INLINE_SLOTS];
        state.overflow = None;
        for d in new_shape.descriptors() {
            if d.has_slot() {
                let v = values.remove(&d.key).unwrap_or_default();
                state.write_slot(&d, v);
            }
        }
        drop(state);

        invalidate_layout_lineage(&self.registry, &old_shape, Some(key));
        self.registry.listeners().notify_delete(old_shape.id(), key);
        true
    }

    /// Replace the prototype of an object.
    pub fn set_prototype(&self, id: ObjectId, prototype: Option<ObjectId>) {
        let cell = self.cell(id);
        let mut state = cell.state.write();
        let old_shape = Arc::clone(&state.shape);
        if old_shape.prototype() == prototype {
            return;
        }

        if state.dictionary.is_some() {
            // Dictionary marker shapes are per-object; mint a rebased one.
            state.shape = self.registry.dictionary_shape(prototype);
        } else {
            state.shape = self.registry.transition_set_prototype(&old_shape, prototype);
        }
        drop(state);

        invalidate_prototype_lineage(&old_shape);
        self.registry
            .listeners()
            .notify_prototype_change(old_shape.id());
    }

    /// Convert an object to dictionary mode: unordered-map storage with a
    /// per-object marker shape. Per-shape caching is abandoned for it.
    pub fn convert_to_dictionary_mode(&self, id: ObjectId) {
        let cell = self.cell(id);
        let mut state = cell.state.write();
        if state.dictionary.is_some() {
            return;
        }
        Self::convert_state_to_dictionary(&self.registry, &mut state);
    }

    fn convert_state_to_dictionary(registry: &ShapeRegistry, state: &mut ObjectState) {
        let old_shape = Arc::clone(&state.shape);
        let mut dict: FxHashMap<InternedString, DictEntry> = FxHashMap::default();
        for d in old_shape.descriptors() {
            let value = if d.has_slot() {
                state.read_slot(&d)
            } else {
                Value::undefined()
            };
            dict.insert(
                d.key.clone(),
                DictEntry {
                    value,
                    flags: d.flags,
                    kind: d.kind,
                },
            );
        }
        state.dictionary = Some(Box::new(dict));
        state.inline = [Value::undefined(); MAX_INLINE_SLOTS];
        state.overflow = None;
        state.shape = registry.dictionary_shape(old_shape.prototype());

        // Per-shape caching is over for this lineage.
        old_shape.validity().invalidate();
        invalidate_layout_lineage(registry, &old_shape, None);
    }

    /// Resize an array through its exotic length semantics.
    pub fn set_array_length(&self, id: ObjectId, value: Value) -> EngineResult<()> {
        let new_len = validate_array_length(value)?;
        let cell = self.cell(id);
        match cell.exotic() {
            Some(ExoticData::Array { elements }) => {
                elements.write().resize(new_len, Value::undefined());
                Ok(())
            }
            _ => Err(EngineError::TypeError {
                message: "length is only settable on arrays".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for ObjectHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeap")
            .field("objects", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::intern;

    fn heap() -> ObjectHeap {
        ObjectHeap::new(Arc::new(ShapeRegistry::new()))
    }

    fn val(i: i64) -> Value {
        Value::int(i).unwrap()
    }

    // -------------------------------------------------------------------------
    // Allocation & Slots
    // -------------------------------------------------------------------------

    #[test]
    fn test_alloc_plain_object() {
        let heap = heap();
        let id = heap.alloc(None);
        assert!(heap.shape_of(id).is_empty());
        assert!(heap.is_extensible(id));
        assert!(!heap.is_dictionary(id));
    }

    #[test]
    fn test_add_and_read_property() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("x"), val(10), PropertyFlags::default());

        let shape = heap.shape_of(id);
        let desc = shape.lookup(&intern("x")).unwrap();
        assert_eq!(desc.storage, StorageKind::Int);
        assert_eq!(heap.get_slot(id, desc), val(10));
    }

    #[test]
    fn test_shape_sharing_across_objects() {
        let heap = heap();
        let a = heap.alloc(None);
        let b = heap.alloc(None);
        heap.add_property(a, intern("x"), val(1), PropertyFlags::default());
        heap.add_property(b, intern("x"), val(2), PropertyFlags::default());

        assert_eq!(heap.shape_of(a).id(), heap.shape_of(b).id());
        let desc = heap.shape_of(a).lookup(&intern("x")).unwrap().clone();
        assert_eq!(heap.get_slot(a, &desc), val(1));
        assert_eq!(heap.get_slot(b, &desc), val(2));
    }

    #[test]
    fn test_overflow_storage_beyond_inline_slots() {
        let heap = heap();
        let id = heap.alloc(None);
        for i in 0..(MAX_INLINE_SLOTS + 3) {
            heap.add_property(
                id,
                intern(&format!("p{i}")),
                val(i as i64),
                PropertyFlags::default(),
            );
        }
        let shape = heap.shape_of(id);
        for i in 0..(MAX_INLINE_SLOTS + 3) {
            let desc = shape.lookup(&intern(&format!("p{i}"))).unwrap();
            assert_eq!(heap.get_slot(id, desc), val(i as i64), "p{i}");
        }
    }

    // -------------------------------------------------------------------------
    // Storage-Kind Widening
    // -------------------------------------------------------------------------

    #[test]
    fn test_int_slot_widens_to_double_without_truncation() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("len"), val(3), PropertyFlags::default());
        let int_shape = heap.shape_of(id);

        heap.set_data_value(id, &intern("len"), Value::double(3.5));

        let new_shape = heap.shape_of(id);
        assert_ne!(int_shape.id(), new_shape.id());
        let desc = new_shape.lookup(&intern("len")).unwrap();
        assert_eq!(desc.storage, StorageKind::Double);
        assert_eq!(heap.get_slot(id, desc).as_double(), Some(3.5));
        // The widening redefinition invalidates the old shape.
        assert!(!int_shape.validity().is_valid());
    }

    #[test]
    fn test_double_slot_stores_ints_as_doubles() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("d"), Value::double(1.5), PropertyFlags::default());
        heap.set_data_value(id, &intern("d"), val(2));

        let desc = heap.shape_of(id).lookup(&intern("d")).unwrap().clone();
        let stored = heap.get_slot(id, &desc);
        assert!(stored.is_double());
        assert_eq!(stored.as_double(), Some(2.0));
    }

    #[test]
    fn test_widening_to_object_kind() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("b"), Value::bool(true), PropertyFlags::default());
        heap.set_data_value(id, &intern("b"), val(1));

        let desc = heap.shape_of(id).lookup(&intern("b")).unwrap().clone();
        assert_eq!(desc.storage, StorageKind::Object);
        assert_eq!(heap.get_slot(id, &desc), val(1));
    }

    // -------------------------------------------------------------------------
    // Delete / Prototype / Dictionary
    // -------------------------------------------------------------------------

    #[test]
    fn test_delete_compacts_storage() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("a"), val(1), PropertyFlags::default());
        heap.add_property(id, intern("b"), val(2), PropertyFlags::default());
        heap.add_property(id, intern("c"), val(3), PropertyFlags::default());

        assert!(heap.delete_property(id, &intern("b")));

        let shape = heap.shape_of(id);
        assert!(shape.lookup(&intern("b")).is_none());
        assert_eq!(heap.get_slot(id, shape.lookup(&intern("a")).unwrap()), val(1));
        assert_eq!(heap.get_slot(id, shape.lookup(&intern("c")).unwrap()), val(3));
    }

    #[test]
    fn test_delete_nonexistent_or_nonconfigurable() {
        let heap = heap();
        let id = heap.alloc(None);
        assert!(!heap.delete_property(id, &intern("ghost")));

        heap.add_property(id, intern("frozen"), val(1), PropertyFlags::ENUMERABLE);
        assert!(!heap.delete_property(id, &intern("frozen")));
    }

    #[test]
    fn test_set_prototype_invalidates_stability_token() {
        let heap = heap();
        let proto_a = heap.alloc(None);
        let proto_b = heap.alloc(None);
        let id = heap.alloc(Some(proto_a));
        let old_shape = heap.shape_of(id);

        heap.set_prototype(id, Some(proto_b));

        assert_eq!(heap.prototype_of(id), Some(proto_b));
        assert!(!old_shape.stable_prototype().is_valid());
        // Layout-preserving: validity itself survives.
        assert!(old_shape.validity().is_valid());
    }

    #[test]
    fn test_dictionary_conversion() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("x"), val(1), PropertyFlags::default());
        let old_shape = heap.shape_of(id);

        heap.convert_to_dictionary_mode(id);

        assert!(heap.is_dictionary(id));
        assert!(heap.shape_of(id).is_dictionary());
        assert!(!old_shape.validity().is_valid());
        let entry = heap.dict_lookup(id, &intern("x")).unwrap();
        assert_eq!(entry.value, val(1));
    }

    #[test]
    fn test_dictionary_threshold_conversion_on_add() {
        let heap = heap();
        let id = heap.alloc(None);
        for i in 0..=DICTIONARY_THRESHOLD {
            heap.add_property(
                id,
                intern(&format!("k{i}")),
                val(i as i64),
                PropertyFlags::default(),
            );
        }
        assert!(heap.is_dictionary(id));
        assert_eq!(
            heap.dict_lookup(id, &intern("k3")).unwrap().value,
            val(3)
        );
    }

    // -------------------------------------------------------------------------
    // Assumption Invalidation
    // -------------------------------------------------------------------------

    #[test]
    fn test_add_invalidates_absence_assumption() {
        let heap = heap();
        let id = heap.alloc(None);
        let shape = heap.shape_of(id);
        let key = intern("later");
        let token = heap.registry().assumptions().token(shape.id(), &key);

        heap.add_property(id, key, val(1), PropertyFlags::default());
        assert!(!token.is_valid());
    }

    #[test]
    fn test_unrelated_add_keeps_assumption() {
        let heap = heap();
        let id = heap.alloc(None);
        let shape = heap.shape_of(id);
        let token = heap.registry().assumptions().token(shape.id(), &intern("x"));

        heap.add_property(id, intern("other"), val(1), PropertyFlags::default());
        assert!(token.is_valid());
    }

    #[test]
    fn test_cached_add_fast_path() {
        let heap = heap();
        let a = heap.alloc(None);
        let b = heap.alloc(None);

        // Specialize the transition against object a.
        heap.add_property(a, intern("x"), val(1), PropertyFlags::default());
        let old_shape = heap.shape_of(b);
        let new_shape = heap.shape_of(a);

        assert!(heap.apply_cached_add(b, &old_shape, &new_shape, val(5)));
        assert_eq!(heap.shape_of(b).id(), new_shape.id());
        let desc = new_shape.lookup(&intern("x")).unwrap();
        assert_eq!(heap.get_slot(b, desc), val(5));

        // Stale expected shape is rejected.
        assert!(!heap.apply_cached_add(b, &old_shape, &new_shape, val(6)));
    }

    // -------------------------------------------------------------------------
    // Define Property
    // -------------------------------------------------------------------------

    #[test]
    fn test_define_property_adds_and_redefines() {
        let heap = heap();
        let id = heap.alloc(None);

        assert!(heap.define_property(id, intern("x"), val(1), PropertyFlags::default()));
        let desc = heap.shape_of(id).lookup(&intern("x")).unwrap().clone();
        assert_eq!(heap.get_slot(id, &desc), val(1));

        // Redefine with new attributes: value stored despite read-only.
        assert!(heap.define_property(id, intern("x"), val(2), PropertyFlags::read_only()));
        let desc = heap.shape_of(id).lookup(&intern("x")).unwrap().clone();
        assert!(!desc.is_writable());
        assert_eq!(heap.get_slot(id, &desc), val(2));
    }

    #[test]
    fn test_define_property_rejects_nonconfigurable_redefinition() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.add_property(id, intern("fixed"), val(1), PropertyFlags::ENUMERABLE);

        assert!(!heap.define_property(
            id,
            intern("fixed"),
            val(2),
            PropertyFlags::default()
        ));
        let desc = heap.shape_of(id).lookup(&intern("fixed")).unwrap().clone();
        assert_eq!(heap.get_slot(id, &desc), val(1));
    }

    #[test]
    fn test_define_property_rejects_on_sealed_object() {
        let heap = heap();
        let id = heap.alloc(None);
        heap.prevent_extensions(id);
        assert!(!heap.define_property(id, intern("x"), val(1), PropertyFlags::default()));
    }

    // -------------------------------------------------------------------------
    // Arrays & Proxies
    // -------------------------------------------------------------------------

    #[test]
    fn test_array_length_semantics() {
        let heap = heap();
        let arr = heap.alloc_array(None, vec![val(1), val(2), val(3)]);
        assert_eq!(heap.array_length(arr), Some(3));

        heap.set_array_length(arr, val(1)).unwrap();
        assert_eq!(heap.array_length(arr), Some(1));
        assert_eq!(heap.array_element(arr, 0), Some(val(1)));

        heap.set_array_length(arr, val(4)).unwrap();
        assert_eq!(heap.array_length(arr), Some(4));
        assert_eq!(heap.array_element(arr, 3), Some(Value::undefined()));

        assert!(heap.set_array_length(arr, Value::double(1.5)).is_err());
    }

    #[test]
    fn test_proxy_revocation_flag() {
        let heap = heap();
        let target = heap.alloc(None);
        let proxy = heap.alloc_proxy(target, Arc::new(crate::object::exotic::ForwardingHandler));

        assert!(heap.cell(proxy).is_proxy());
        assert!(!heap.cell(proxy).exotic().unwrap().is_revoked());
        heap.revoke_proxy(proxy);
        assert!(heap.cell(proxy).exotic().unwrap().is_revoked());
    }

    #[test]
    #[should_panic(expected = "dangling object handle")]
    fn test_dangling_handle_is_fatal() {
        let heap = heap();
        heap.cell(ObjectId(99));
    }
}
