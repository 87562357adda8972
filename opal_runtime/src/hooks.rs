//! Shape-event listener hooks.
//!
//! The cache layer and diagnostics subscribe to shape events through this
//! listener set rather than polling. Notification is zero-cost when the set
//! is empty (a single read-lock acquisition and an empty iteration).

use opal_core::InternedString;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::shape::ShapeId;

// =============================================================================
// Listener Trait
// =============================================================================

/// Receives shape-event notifications.
///
/// Implementations must be `Send + Sync`; notifications may come from any
/// thread and must not block.
pub trait ShapeListener: Send + Sync {
    /// A new shape was created by an add transition.
    fn on_transition(&self, _from: ShapeId, _to: ShapeId) {}

    /// A property was deleted from an object of `shape`.
    fn on_property_delete(&self, _shape: ShapeId, _key: &InternedString) {}

    /// A property of an object of `shape` was reconfigured.
    fn on_reconfigure(&self, _shape: ShapeId, _key: &InternedString) {}

    /// An object of `shape` replaced its prototype.
    fn on_prototype_change(&self, _shape: ShapeId) {}

    /// An accessor was installed over a property of `shape`.
    fn on_accessor_installed(&self, _shape: ShapeId, _key: &InternedString) {}
}

// =============================================================================
// Listener Set
// =============================================================================

/// A set of registered listeners, owned by the shape registry.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn ShapeListener>>>,
}

impl ListenerSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn register(&self, listener: Arc<dyn ShapeListener>) {
        self.listeners.write().push(listener);
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Check if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub(crate) fn notify_transition(&self, from: ShapeId, to: ShapeId) {
        for l in self.listeners.read().iter() {
            l.on_transition(from, to);
        }
    }

    pub(crate) fn notify_delete(&self, shape: ShapeId, key: &InternedString) {
        for l in self.listeners.read().iter() {
            l.on_property_delete(shape, key);
        }
    }

    pub(crate) fn notify_reconfigure(&self, shape: ShapeId, key: &InternedString) {
        for l in self.listeners.read().iter() {
            l.on_reconfigure(shape, key);
        }
    }

    pub(crate) fn notify_prototype_change(&self, shape: ShapeId) {
        for l in self.listeners.read().iter() {
            l.on_prototype_change(shape);
        }
    }

    pub(crate) fn notify_accessor_installed(&self, shape: ShapeId, key: &InternedString) {
        for l in self.listeners.read().iter() {
            l.on_accessor_installed(shape, key);
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

// =============================================================================
// Counting Listener
// =============================================================================

/// A listener that counts events, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CountingListener {
    transitions: AtomicU64,
    deletions: AtomicU64,
    reconfigures: AtomicU64,
    prototype_changes: AtomicU64,
    accessor_installs: AtomicU64,
}

impl CountingListener {
    /// Create a new counting listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of add transitions observed.
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Number of deletions observed.
    pub fn deletion_count(&self) -> u64 {
        self.deletions.load(Ordering::Relaxed)
    }

    /// Number of reconfigurations observed.
    pub fn reconfigure_count(&self) -> u64 {
        self.reconfigures.load(Ordering::Relaxed)
    }

    /// Number of prototype changes observed.
    pub fn prototype_change_count(&self) -> u64 {
        self.prototype_changes.load(Ordering::Relaxed)
    }

    /// Number of accessor installations observed.
    pub fn accessor_install_count(&self) -> u64 {
        self.accessor_installs.load(Ordering::Relaxed)
    }
}

impl ShapeListener for CountingListener {
    fn on_transition(&self, _from: ShapeId, _to: ShapeId) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_property_delete(&self, _shape: ShapeId, _key: &InternedString) {
        self.deletions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_reconfigure(&self, _shape: ShapeId, _key: &InternedString) {
        self.reconfigures.fetch_add(1, Ordering::Relaxed);
    }

    fn on_prototype_change(&self, _shape: ShapeId) {
        self.prototype_changes.fetch_add(1, Ordering::Relaxed);
    }

    fn on_accessor_installed(&self, _shape: ShapeId, _key: &InternedString) {
        self.accessor_installs.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Tests
// =============================================================================
