//! Receiver checks: the guard half of every cache entry.
//!
//! A receiver check answers two questions: "is this entry's fast path safe
//! for this candidate receiver" ([`ReceiverCheck::accept`]) and "where does
//! the property live once the candidate is accepted"
//! ([`ReceiverCheck::locate_store`]). Validity
//! ([`ReceiverCheck::is_valid`]) is independent of any candidate: it reads
//! only the embedded assumption tokens, and an invalid check must never be
//! trusted even if `accept` would spuriously succeed — callers check
//! validity first.
//!
//! The variants trade per-access work against invalidation granularity:
//!
//! - Shape / combined-shape checks are a pointer-wide id compare.
//! - Traversal checks re-walk the prototype chain and compare each
//!   ancestor's shape; correct in any realm configuration, but they chase
//!   pointers on every access.
//! - Assumption chains replace the walk with a token set and a cached
//!   holder; any shape-incompatible mutation anywhere in the lineage kills
//!   the tokens. Single-realm embeddings only, since the tokens are not
//!   realm-parameterized.
//! - Constant-object checks additionally pin the receiver's identity and
//!   are evicted (never retried) when a different object shows up.

use opal_core::{ObjectId, Value, ValueKind};
use opal_runtime::assumptions::AssumptionCell;
use opal_runtime::object::heap::ObjectHeap;
use opal_runtime::object::shape::ShapeId;
use smallvec::SmallVec;

// =============================================================================
// Primitive Kind
// =============================================================================

/// Primitive receiver families that route through wrapper prototypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    /// Primitive strings.
    String,
    /// Small integers and doubles.
    Number,
    /// Booleans.
    Boolean,
}

impl PrimitiveKind {
    /// Classify a value, if it is a wrappable primitive.
    #[inline]
    pub fn of_value(value: Value) -> Option<Self> {
        match value.kind() {
            ValueKind::Str => Some(Self::String),
            ValueKind::Int | ValueKind::Double => Some(Self::Number),
            ValueKind::Bool => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Check whether `value` belongs to this family.
    #[inline]
    pub fn matches(self, value: Value) -> bool {
        PrimitiveKind::of_value(value) == Some(self)
    }
}

// =============================================================================
// Check Variants
// =============================================================================

/// Exact shape-identity check.
#[derive(Debug, Clone)]
pub struct ShapeCheck {
    /// The accepted shape.
    pub shape: ShapeId,
    /// The shape's validity token.
    pub validity: AssumptionCell,
}

/// Accepts either of two layout-compatible shapes. Produced by shape
/// merging to keep sibling shapes from growing the chain.
#[derive(Debug, Clone)]
pub struct CombinedShapeCheck {
    /// First accepted shape.
    pub first: ShapeId,
    /// Second accepted shape.
    pub second: ShapeId,
    /// First shape's validity token.
    pub first_validity: AssumptionCell,
    /// Second shape's validity token.
    pub second_validity: AssumptionCell,
}

/// Physically re-walks the prototype chain, comparing each ancestor's
/// shape by identity. `proto_shapes[i]` is the expected shape of the
/// receiver's `i+1`-th prototype; the holder is the last one.
#[derive(Debug, Clone)]
pub struct TraverseChainCheck {
    /// Expected receiver shape.
    pub receiver_shape: ShapeId,
    /// Expected prototype shapes, outermost first.
    pub proto_shapes: SmallVec<[ShapeId; 4]>,
    /// Validity tokens of the receiver shape and every prototype shape.
    pub validities: SmallVec<[AssumptionCell; 4]>,
}

/// Prototype-chain check carried entirely by assumption tokens: the holder
/// was resolved at specialization time and `accept` only compares the
/// receiver's shape. Sound as long as every token holds.
#[derive(Debug, Clone)]
pub struct AssumptionChainCheck {
    /// Expected receiver shape.
    pub receiver_shape: ShapeId,
    /// The property holder resolved at specialization time.
    pub holder: ObjectId,
    /// Stable-prototype, shape-validity, and property tokens for every
    /// level of the chain up to the holder.
    pub assumptions: SmallVec<[AssumptionCell; 8]>,
}

/// Pins the receiver to one specific object on top of an inner check.
#[derive(Debug, Clone)]
pub struct ConstantObjectCheck {
    /// The only accepted receiver.
    pub expected: ObjectId,
    /// The structural check behind the identity pin.
    pub inner: Box<ReceiverCheck>,
}

/// Accepts one primitive family and guards the wrapper prototype through
/// an inner check applied to it.
#[derive(Debug, Clone)]
pub struct PrimitiveWrapperCheck {
    /// Accepted primitive family.
    pub primitive: PrimitiveKind,
    /// The wrapper prototype the lookup starts at.
    pub proto: ObjectId,
    /// Check applied to the wrapper prototype.
    pub inner: Box<ReceiverCheck>,
}

// =============================================================================
// Receiver Check
// =============================================================================

/// The closed set of receiver checks, dispatched by match in the scan loop.
#[derive(Debug, Clone)]
pub enum ReceiverCheck {
    /// Exact shape identity.
    Shape(ShapeCheck),
    /// Either of two merged shapes.
    CombinedShape(CombinedShapeCheck),
    /// Physical prototype-chain traversal.
    TraverseChain(TraverseChainCheck),
    /// Token-based prototype chain with a cached holder.
    AssumptionChain(AssumptionChainCheck),
    /// Identity-pinned receiver.
    ConstantObject(ConstantObjectCheck),
    /// Primitive receiver via its wrapper prototype.
    PrimitiveWrapper(PrimitiveWrapperCheck),
    /// Any proxy object. Exotic receivers cannot be shape-cached.
    Proxy,
    /// `undefined` or `null` receivers.
    Null,
}

impl ReceiverCheck {
    /// Check whether the entry's fast path is safe for `candidate`.
    ///
    /// Side-effect free; safe to call speculatively and repeatedly.
    pub fn accept(&self, heap: &ObjectHeap, candidate: Value) -> bool {
        match self {
            Self::Shape(c) => {
                matches!(candidate.as_object(), Some(id) if heap.shape_of(id).id() == c.shape)
            }
            Self::CombinedShape(c) => match candidate.as_object() {
                Some(id) => {
                    let shape = heap.shape_of(id).id();
                    shape == c.first || shape == c.second
                }
                None => false,
            },
            Self::TraverseChain(c) => {
                let Some(id) = candidate.as_object() else {
                    return false;
                };
                if heap.shape_of(id).id() != c.receiver_shape {
                    return false;
                }
                let mut current = id;
                for expected in &c.proto_shapes {
                    match heap.prototype_of(current) {
                        Some(proto) => {
                            if heap.shape_of(proto).id() != *expected {
                                return false;
                            }
                            current = proto;
                        }
                        None => return false,
                    }
                }
                true
            }
            Self::AssumptionChain(c) => {
                matches!(candidate.as_object(), Some(id) if heap.shape_of(id).id() == c.receiver_shape)
            }
            Self::ConstantObject(c) => {
                candidate.as_object() == Some(c.expected) && c.inner.accept(heap, candidate)
            }
            Self::PrimitiveWrapper(c) => {
                c.primitive.matches(candidate) && c.inner.accept(heap, Value::object(c.proto))
            }
            Self::Proxy => {
                matches!(candidate.as_object(), Some(id) if heap.cell(id).is_proxy())
            }
            Self::Null => candidate.is_nullish(),
        }
    }

    /// Check every embedded assumption token, without touching any
    /// candidate object. Must be consulted before `accept` is trusted.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Shape(c) => c.validity.is_valid(),
            Self::CombinedShape(c) => c.first_validity.is_valid() && c.second_validity.is_valid(),
            Self::TraverseChain(c) => c.validities.iter().all(AssumptionCell::is_valid),
            Self::AssumptionChain(c) => c.assumptions.iter().all(AssumptionCell::is_valid),
            Self::ConstantObject(c) => c.inner.is_valid(),
            Self::PrimitiveWrapper(c) => c.inner.is_valid(),
            Self::Proxy | Self::Null => true,
        }
    }

    /// Resolve the object that holds the property storage for an accepted
    /// candidate. Only valid right after `accept` returned `true` for this
    /// exact candidate.
    pub fn locate_store(&self, heap: &ObjectHeap, candidate: Value) -> ObjectId {
        match self {
            Self::Shape(_) | Self::CombinedShape(_) | Self::Proxy => candidate
                .as_object()
                .expect("accepted candidate must be an object"),
            Self::TraverseChain(c) => {
                let mut current = candidate
                    .as_object()
                    .expect("accepted candidate must be an object");
                for _ in 0..c.proto_shapes.len() {
                    current = heap
                        .prototype_of(current)
                        .expect("accepted chain lost a prototype link");
                }
                current
            }
            Self::AssumptionChain(c) => c.holder,
            Self::ConstantObject(c) => c.inner.locate_store(heap, candidate),
            Self::PrimitiveWrapper(c) => c.inner.locate_store(heap, Value::object(c.proto)),
            Self::Null => panic!("null-receiver entries have no property store"),
        }
    }

    /// Prototype-chain depth this check guards.
    pub fn depth(&self) -> usize {
        match self {
            Self::TraverseChain(c) => c.proto_shapes.len(),
            Self::AssumptionChain(c) => c.assumptions.len() / 3,
            Self::ConstantObject(c) => c.inner.depth(),
            Self::PrimitiveWrapper(c) => c.inner.depth(),
            _ => 0,
        }
    }

    /// The pinned receiver of a constant-object check.
    pub fn expected_object(&self) -> Option<ObjectId> {
        match self {
            Self::ConstantObject(c) => Some(c.expected),
            _ => None,
        }
    }

    /// The primary shape this check specializes on, for merge decisions.
    pub fn primary_shape(&self) -> Option<ShapeId> {
        match self {
            Self::Shape(c) => Some(c.shape),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
