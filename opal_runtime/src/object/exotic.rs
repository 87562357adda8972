//! Exotic object support: proxies, arrays, and accessors.
//!
//! Exotic objects deviate from plain data-object semantics and cannot be
//! shape-cached directly; the cache layer dispatches to them through the
//! trap-style protocol defined here.

use opal_core::{EngineError, EngineResult, InternedString, ObjectId, Value};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::object::heap::ObjectHeap;

/// Native getter invoked with the heap and the original receiver.
pub type AccessorGetter = Arc<dyn Fn(&ObjectHeap, Value) -> EngineResult<Value> + Send + Sync>;

/// Native setter invoked with the heap, the original receiver, and the value.
pub type AccessorSetter =
    Arc<dyn Fn(&ObjectHeap, Value, Value) -> EngineResult<()> + Send + Sync>;

// =============================================================================
// Proxy Handler
// =============================================================================

/// Trap protocol for proxy objects.
///
/// Invoked only from generic/exotic cache leaves and the uncached path,
/// never from shape-specialized leaves.
pub trait ProxyHandler: Send + Sync {
    /// "Get own property" trap.
    fn get(
        &self,
        heap: &ObjectHeap,
        target: ObjectId,
        key: &InternedString,
        receiver: Value,
    ) -> EngineResult<Value>;

    /// "Set with receiver" trap. Returns whether the write succeeded.
    fn set(
        &self,
        heap: &ObjectHeap,
        target: ObjectId,
        key: &InternedString,
        value: Value,
        receiver: Value,
    ) -> EngineResult<bool>;

    /// "Has property" trap.
    fn has(&self, heap: &ObjectHeap, target: ObjectId, key: &InternedString)
    -> EngineResult<bool>;
}

/// The default handler: forwards every trap to the target object.
pub struct ForwardingHandler;

impl ProxyHandler for ForwardingHandler {
    fn get(
        &self,
        heap: &ObjectHeap,
        target: ObjectId,
        key: &InternedString,
        receiver: Value,
    ) -> EngineResult<Value> {
        crate::object::ordinary::get_from_object(heap, target, key, receiver)
    }

    fn set(
        &self,
        heap: &ObjectHeap,
        target: ObjectId,
        key: &InternedString,
        value: Value,
        receiver: Value,
    ) -> EngineResult<bool> {
        crate::object::ordinary::set_on_object(heap, target, key, value, receiver, false)
            .map(|_| true)
    }

    fn has(
        &self,
        heap: &ObjectHeap,
        target: ObjectId,
        key: &InternedString,
    ) -> EngineResult<bool> {
        crate::object::ordinary::has_on_object(heap, target, key)
    }
}

// =============================================================================
// Exotic Data
// =============================================================================

/// Per-object exotic payload.
pub enum ExoticData {
    /// Array element storage. `length` is computed from it.
    Array {
        /// The elements. Length writes shrink or grow this vector.
        elements: RwLock<Vec<Value>>,
    },
    /// A proxy: target + trap handler + revocation flag.
    Proxy {
        /// The wrapped object.
        target: ObjectId,
        /// Trap implementation.
        handler: Arc<dyn ProxyHandler>,
        /// Once set, every trap raises the revoked-proxy error.
        revoked: AtomicBool,
    },
    /// An accessor pair stored in a property slot.
    Accessor {
        /// Getter, if any.
        get: Option<AccessorGetter>,
        /// Setter, if any.
        set: Option<AccessorSetter>,
    },
}

impl ExoticData {
    /// Check whether a proxy payload has been revoked.
    #[inline]
    pub fn is_revoked(&self) -> bool {
        match self {
            ExoticData::Proxy { revoked, .. } => revoked.load(Ordering::Acquire),
            _ => false,
        }
    }
}

impl std::fmt::Debug for ExoticData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExoticData::Array { elements } => f
                .debug_struct("Array")
                .field("len", &elements.read().len())
                .finish(),
            ExoticData::Proxy {
                target, revoked, ..
            } => f
                .debug_struct("Proxy")
                .field("target", target)
                .field("revoked", &revoked.load(Ordering::Relaxed))
                .finish(),
            ExoticData::Accessor { get, set } => f
                .debug_struct("Accessor")
                .field("has_get", &get.is_some())
                .field("has_set", &set.is_some())
                .finish(),
        }
    }
}

/// Validate a prospective array length value.
///
/// Array lengths must be non-negative integers below 2^32; anything else is
/// a `RangeError`.
pub fn validate_array_length(value: Value) -> EngineResult<usize> {
    let n = value
        .as_number()
        .ok_or_else(EngineError::invalid_array_length)?;
    if n.fract() != 0.0 || !(0.0..4294967296.0).contains(&n) {
        return Err(EngineError::invalid_array_length());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_array_length_accepts_integers() {
        assert_eq!(validate_array_length(Value::int(0).unwrap()).unwrap(), 0);
        assert_eq!(validate_array_length(Value::int(10).unwrap()).unwrap(), 10);
        assert_eq!(validate_array_length(Value::double(3.0)).unwrap(), 3);
    }

    #[test]
    fn test_validate_array_length_rejects_bad_values() {
        assert!(validate_array_length(Value::double(3.5)).is_err());
        assert!(validate_array_length(Value::int(-1).unwrap()).is_err());
        assert!(validate_array_length(Value::double(4294967296.0)).is_err());
        assert!(validate_array_length(Value::undefined()).is_err());
        assert!(validate_array_length(Value::double(f64::NAN)).is_err());
    }
}
