//! Shape system: immutable, structurally-shared property layout descriptors.
//!
//! Objects that underwent the same sequence of property definitions from the
//! same starting point share a `Shape`, so a single pointer comparison
//! validates everything a cache entry assumed about an object's layout.
//!
//! # Shape Transitions
//!
//! Adding, deleting, or reconfiguring a property never mutates a shape;
//! it produces (or reuses) a successor in the transition graph:
//!
//! ```text
//!     Empty{proto}
//!         |
//!     +---+---+
//!     |       |
//!   "x"     "y"
//!     |       |
//!  Shape1  Shape2
//!     |
//!   "y"
//!     |
//!  Shape3 (has both x and y)
//! ```
//!
//! Transitions are interned per parent shape, so two objects replaying the
//! same history converge on the identical `Arc<Shape>` instance. Delete,
//! reconfigure, and prototype-change transitions are computed by replaying
//! the surviving descriptors from the root, which keeps convergence across
//! those edges too.
//!
//! # Prototype identity
//!
//! The prototype is part of the shape. A shape-identity check therefore
//! implies a prototype-identity check, which is what lets prototype-chain
//! cache entries cache the holder object directly.
//!
//! # Validity
//!
//! Every shape carries two assumption tokens: `validity` (invalidated when a
//! holder redefines a property's attributes in a way incompatible with
//! outstanding caches, or enters dictionary mode) and `stable_prototype`
//! (invalidated when a holder's prototype is replaced). Tokens are
//! monotonic; see [`crate::assumptions`].

use opal_core::{InternedString, ObjectId, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::assumptions::{AssumptionCell, PropertyAssumptionRegistry};
use crate::hooks::ListenerSet;

/// Maximum number of inline property slots.
///
/// Properties at higher slot indices live in the object's overflow table.
pub const MAX_INLINE_SLOTS: usize = 8;

/// Property count at which an object is converted to dictionary mode.
pub const DICTIONARY_THRESHOLD: usize = 64;

// =============================================================================
// Property Attributes
// =============================================================================

bitflags::bitflags! {
    /// Property descriptor attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyFlags: u8 {
        /// Property value can be changed.
        const WRITABLE = 1 << 0;
        /// Property appears in enumeration.
        const ENUMERABLE = 1 << 1;
        /// Property can be deleted or have attributes changed.
        const CONFIGURABLE = 1 << 2;
    }
}

impl Default for PropertyFlags {
    /// Default attribute set: writable, enumerable, configurable.
    #[inline]
    fn default() -> Self {
        Self::WRITABLE | Self::ENUMERABLE | Self::CONFIGURABLE
    }
}

impl PropertyFlags {
    /// Read-only data property flags.
    #[inline]
    pub const fn read_only() -> Self {
        Self::ENUMERABLE.union(Self::CONFIGURABLE)
    }

    /// Non-enumerable property flags (for internal attributes).
    #[inline]
    pub const fn hidden() -> Self {
        Self::WRITABLE.union(Self::CONFIGURABLE)
    }
}

// =============================================================================
// Storage Kind
// =============================================================================

/// Declared representation of a property's storage slot.
///
/// Numeric slots exist so the cache can specialize unboxed reads and
/// writes. A slot only ever holds values its declared kind accepts; writes
/// of other kinds require a widening reconfigure transition first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// 48-bit small integer values only.
    Int,
    /// Double values; integers are widened to doubles on store.
    Double,
    /// Boolean values only.
    Bool,
    /// Any value.
    Object,
}

impl StorageKind {
    /// The narrowest kind able to represent `value`.
    #[inline]
    pub fn of_value(value: Value) -> Self {
        if value.is_int() {
            Self::Int
        } else if value.is_double() {
            Self::Double
        } else if value.is_bool() {
            Self::Bool
        } else {
            Self::Object
        }
    }

    /// Check whether `value` is representable in this kind without loss.
    ///
    /// A boundary value (e.g. a double written to an int slot) is rejected
    /// here; the caller must widen, never truncate.
    #[inline]
    pub fn accepts(self, value: Value) -> bool {
        match self {
            Self::Int => value.is_int(),
            Self::Double => value.is_double() || value.is_int(),
            Self::Bool => value.is_bool(),
            Self::Object => true,
        }
    }

    /// The kind this slot must widen to in order to accept `value`.
    #[inline]
    pub fn widened_for(self, value: Value) -> Self {
        if self.accepts(value) {
            return self;
        }
        match self {
            Self::Int if value.is_double() => Self::Double,
            _ => Self::Object,
        }
    }

    /// Normalize `value` to this kind's uniform representation.
    ///
    /// Double slots store integers as doubles so the stored representation
    /// matches the declared kind. Must only be called when
    /// `self.accepts(value)`.
    #[inline]
    pub fn normalize(self, value: Value) -> Value {
        match self {
            Self::Double if value.is_int() => Value::double(value.as_int().unwrap() as f64),
            _ => value,
        }
    }
}

// =============================================================================
// Property Kind
// =============================================================================

/// What a computed property computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputedKind {
    /// Element count of an array object.
    ArrayLength,
    /// Code-unit count of a primitive string receiver.
    StringLength,
}

/// The kind of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Plain data property stored in a slot.
    Data,
    /// Accessor property; the slot holds an accessor object.
    Accessor,
    /// Property computed on demand; occupies no slot.
    Computed(ComputedKind),
}

// =============================================================================
// Property Descriptor
// =============================================================================

/// Slot index marker for properties that occupy no storage.
pub const NO_SLOT: u16 = u16::MAX;

/// Describes a single property in a shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    /// Property key (interned).
    pub key: InternedString,
    /// Slot index in object storage, or [`NO_SLOT`] for computed properties.
    pub slot: u16,
    /// Attribute flags.
    pub flags: PropertyFlags,
    /// Data / accessor / computed.
    pub kind: PropertyKind,
    /// Declared storage representation.
    pub storage: StorageKind,
}

impl PropertyDescriptor {
    /// Check if the property is writable.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags.contains(PropertyFlags::WRITABLE)
    }

    /// Check if the property is enumerable.
    #[inline]
    pub fn is_enumerable(&self) -> bool {
        self.flags.contains(PropertyFlags::ENUMERABLE)
    }

    /// Check if the property is configurable.
    #[inline]
    pub fn is_configurable(&self) -> bool {
        self.flags.contains(PropertyFlags::CONFIGURABLE)
    }

    /// Check if the property occupies a storage slot.
    #[inline]
    pub fn has_slot(&self) -> bool {
        self.slot != NO_SLOT
    }

    /// Check if the slot lives in inline storage.
    #[inline]
    pub fn is_inline(&self) -> bool {
        self.has_slot() && (self.slot as usize) < MAX_INLINE_SLOTS
    }
}

// =============================================================================
// Shape Id
// =============================================================================

/// Unique identifier for a shape, used for fast comparison and cache keying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ShapeId(pub u32);

impl ShapeId {
    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

// =============================================================================
// Shape
// =============================================================================

/// Transition edge key. Two definitions with identical key, attributes,
/// kind, and storage reuse the same successor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TransitionKey {
    Add {
        key: InternedString,
        flags: PropertyFlags,
        kind: PropertyKind,
        storage: StorageKind,
    },
    Delete(InternedString),
    Reconfigure {
        key: InternedString,
        flags: PropertyFlags,
        kind: PropertyKind,
        storage: StorageKind,
    },
    Prototype(Option<ObjectId>),
}

/// An immutable property-layout descriptor.
///
/// See the module documentation for the transition and validity model.
pub struct Shape {
    /// Unique identifier.
    id: ShapeId,

    /// Parent shape (None for root shapes).
    parent: Option<Arc<Shape>>,

    /// The property appended by this shape's transition (None for roots).
    property: Option<PropertyDescriptor>,

    /// Total number of properties in this shape's chain.
    property_count: u16,

    /// Number of storage slots consumed (computed properties take none).
    slot_count: u16,

    /// The prototype object shared by all holders of this shape.
    prototype: Option<ObjectId>,

    /// True for per-object dictionary-mode marker shapes.
    dictionary: bool,

    /// Invalidated when this shape can no longer be trusted by caches.
    validity: AssumptionCell,

    /// Invalidated when a holder of this shape replaces its prototype.
    stable_prototype: AssumptionCell,

    /// Interned successor shapes, lazily populated.
    transitions: RwLock<FxHashMap<TransitionKey, Arc<Shape>>>,
}

impl Shape {
    fn new_root(id: ShapeId, prototype: Option<ObjectId>, dictionary: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent: None,
            property: None,
            property_count: 0,
            slot_count: 0,
            prototype,
            dictionary,
            validity: AssumptionCell::new(),
            stable_prototype: AssumptionCell::new(),
            transitions: RwLock::new(FxHashMap::default()),
        })
    }

    fn with_property(parent: &Arc<Shape>, descriptor: PropertyDescriptor, id: ShapeId) -> Arc<Self> {
        let slot_count = if descriptor.has_slot() {
            parent.slot_count + 1
        } else {
            parent.slot_count
        };
        Arc::new(Self {
            id,
            parent: Some(Arc::clone(parent)),
            property_count: parent.property_count + 1,
            slot_count,
            prototype: parent.prototype,
            dictionary: false,
            validity: AssumptionCell::new(),
            stable_prototype: AssumptionCell::new(),
            transitions: RwLock::new(FxHashMap::default()),
            property: Some(descriptor),
        })
    }

    /// Get the shape id.
    #[inline]
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// Get the parent shape.
    #[inline]
    pub fn parent(&self) -> Option<&Arc<Shape>> {
        self.parent.as_ref()
    }

    /// Get the descriptor appended by this shape's transition.
    #[inline]
    pub fn property(&self) -> Option<&PropertyDescriptor> {
        self.property.as_ref()
    }

    /// Total property count.
    #[inline]
    pub fn property_count(&self) -> u16 {
        self.property_count
    }

    /// Number of storage slots consumed.
    #[inline]
    pub fn slot_count(&self) -> u16 {
        self.slot_count
    }

    /// The prototype shared by every holder of this shape.
    #[inline]
    pub fn prototype(&self) -> Option<ObjectId> {
        self.prototype
    }

    /// Check if this is a dictionary-mode marker shape.
    #[inline]
    pub fn is_dictionary(&self) -> bool {
        self.dictionary
    }

    /// Check if this is a root (empty) shape.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.property_count == 0
    }

    /// This shape's validity token.
    #[inline]
    pub fn validity(&self) -> &AssumptionCell {
        &self.validity
    }

    /// This shape's stable-prototype token.
    #[inline]
    pub fn stable_prototype(&self) -> &AssumptionCell {
        &self.stable_prototype
    }

    /// Look up a property by key, walking the parent chain.
    ///
    /// O(n) in property count; chains are short for non-dictionary objects.
    pub fn lookup(&self, key: &InternedString) -> Option<&PropertyDescriptor> {
        let mut current = self;
        loop {
            if let Some(prop) = &current.property {
                // Interned comparison is pointer equality.
                if &prop.key == key {
                    return Some(prop);
                }
            }
            match &current.parent {
                Some(parent) => current = parent.as_ref(),
                None => return None,
            }
        }
    }

    /// Collect all descriptors in definition order.
    pub fn descriptors(&self) -> Vec<PropertyDescriptor> {
        let mut out = Vec::with_capacity(self.property_count as usize);
        self.collect_descriptors(&mut out);
        out
    }

    fn collect_descriptors(&self, out: &mut Vec<PropertyDescriptor>) {
        if let Some(parent) = &self.parent {
            parent.collect_descriptors(out);
        }
        if let Some(prop) = &self.property {
            out.push(prop.clone());
        }
    }

    /// Collect all property keys in definition order.
    pub fn keys(&self) -> Vec<InternedString> {
        self.descriptors().into_iter().map(|d| d.key).collect()
    }

    fn get_transition(&self, key: &TransitionKey) -> Option<Arc<Shape>> {
        self.transitions.read().get(key).cloned()
    }

    /// Insert `shape` for `key` unless another thread won the race; the
    /// edge that lands in the table is the interned one, so identical
    /// histories converge even under concurrent definition.
    fn intern_transition(&self, key: TransitionKey, shape: Arc<Shape>) -> Arc<Shape> {
        let mut transitions = self.transitions.write();
        Arc::clone(transitions.entry(key).or_insert(shape))
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Parent and transition links form cycles through Arcs; print a
        // summary instead of the graph.
        f.debug_struct("Shape")
            .field("id", &self.id)
            .field("property_count", &self.property_count)
            .field("prototype", &self.prototype)
            .field("dictionary", &self.dictionary)
            .finish()
    }
}

// =============================================================================
// Shape Registry
// =============================================================================

/// Creates and interns shapes, and owns the assumption registry and the
/// shape-event listener set.
///
/// Thread-safe; shape ids are allocated from an atomic counter.
pub struct ShapeRegistry {
    /// Counter for unique shape ids.
    next_id: AtomicU32,

    /// Root (empty) shapes, one per prototype.
    roots: RwLock<FxHashMap<Option<ObjectId>, Arc<Shape>>>,

    /// Per-(shape, key) assumption tokens.
    assumptions: PropertyAssumptionRegistry,

    /// Registered shape-event listeners.
    listeners: ListenerSet,
}

impl ShapeRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            roots: RwLock::new(FxHashMap::default()),
            assumptions: PropertyAssumptionRegistry::new(),
            listeners: ListenerSet::new(),
        }
    }

    #[inline]
    fn fresh_id(&self) -> ShapeId {
        ShapeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The per-(shape, key) assumption registry.
    #[inline]
    pub fn assumptions(&self) -> &PropertyAssumptionRegistry {
        &self.assumptions
    }

    /// The shape-event listener set.
    #[inline]
    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    /// Number of shapes created so far.
    pub fn shape_count(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Get the root (empty) shape for the given prototype.
    pub fn empty_shape(&self, prototype: Option<ObjectId>) -> Arc<Shape> {
        if let Some(shape) = self.roots.read().get(&prototype) {
            return Arc::clone(shape);
        }
        let mut roots = self.roots.write();
        Arc::clone(
            roots
                .entry(prototype)
                .or_insert_with(|| Shape::new_root(self.fresh_id(), prototype, false)),
        )
    }

    /// Create a fresh, unshared dictionary-mode marker shape.
    pub fn dictionary_shape(&self, prototype: Option<ObjectId>) -> Arc<Shape> {
        Shape::new_root(self.fresh_id(), prototype, true)
    }

    /// Transition to a successor shape with `key` appended.
    ///
    /// Interned: repeating the same definition history yields the identical
    /// shape instance.
    pub fn transition_add(
        &self,
        from: &Arc<Shape>,
        key: InternedString,
        flags: PropertyFlags,
        kind: PropertyKind,
        storage: StorageKind,
    ) -> Arc<Shape> {
        debug_assert!(from.lookup(&key).is_none(), "property already present");
        let edge = TransitionKey::Add {
            key: key.clone(),
            flags,
            kind,
            storage,
        };
        if let Some(existing) = from.get_transition(&edge) {
            return existing;
        }

        let slot = if matches!(kind, PropertyKind::Computed(_)) {
            NO_SLOT
        } else {
            from.slot_count
        };
        let descriptor = PropertyDescriptor {
            key,
            slot,
            flags,
            kind,
            storage,
        };
        let shape = Shape::with_property(from, descriptor, self.fresh_id());
        let interned = from.intern_transition(edge, Arc::clone(&shape));
        if Arc::ptr_eq(&interned, &shape) {
            self.listeners.notify_transition(from.id(), interned.id());
        }
        interned
    }

    /// Transition to a shape without `key`.
    ///
    /// Surviving descriptors are replayed from the root, so slot indices
    /// compact and identical histories keep converging.
    pub fn transition_delete(&self, from: &Arc<Shape>, key: &InternedString) -> Arc<Shape> {
        let edge = TransitionKey::Delete(key.clone());
        if let Some(existing) = from.get_transition(&edge) {
            return existing;
        }

        let survivors: Vec<PropertyDescriptor> = from
            .descriptors()
            .into_iter()
            .filter(|d| &d.key != key)
            .collect();
        let shape = self.replay(&survivors, from.prototype());
        from.intern_transition(edge, shape)
    }

    /// Transition to a shape with `key`'s attributes, kind, or storage
    /// replaced. Definition order is preserved.
    pub fn transition_reconfigure(
        &self,
        from: &Arc<Shape>,
        key: &InternedString,
        flags: PropertyFlags,
        kind: PropertyKind,
        storage: StorageKind,
    ) -> Arc<Shape> {
        let edge = TransitionKey::Reconfigure {
            key: key.clone(),
            flags,
            kind,
            storage,
        };
        if let Some(existing) = from.get_transition(&edge) {
            return existing;
        }

        let updated: Vec<PropertyDescriptor> = from
            .descriptors()
            .into_iter()
            .map(|d| {
                if &d.key == key {
                    PropertyDescriptor {
                        key: d.key,
                        slot: d.slot,
                        flags,
                        kind,
                        storage,
                    }
                } else {
                    d
                }
            })
            .collect();
        let shape = self.replay(&updated, from.prototype());
        from.intern_transition(edge, shape)
    }

    /// Transition to a shape with the same layout and a different prototype.
    pub fn transition_set_prototype(
        &self,
        from: &Arc<Shape>,
        prototype: Option<ObjectId>,
    ) -> Arc<Shape> {
        if from.prototype() == prototype {
            return Arc::clone(from);
        }
        let edge = TransitionKey::Prototype(prototype);
        if let Some(existing) = from.get_transition(&edge) {
            return existing;
        }

        let descriptors = from.descriptors();
        let shape = self.replay(&descriptors, prototype);
        from.intern_transition(edge, shape)
    }

    /// Replay a descriptor list onto the root shape for `prototype`.
    ///
    /// Slot indices are reassigned sequentially; the caller maps old slots
    /// to new ones by key.
    fn replay(&self, descriptors: &[PropertyDescriptor], prototype: Option<ObjectId>) -> Arc<Shape> {
        let mut shape = self.empty_shape(prototype);
        for d in descriptors {
            shape = self.transition_add(&shape, d.key.clone(), d.flags, d.kind, d.storage);
        }
        shape
    }
}

impl Default for ShapeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
