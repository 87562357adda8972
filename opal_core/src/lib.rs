//! Core primitives shared across the Opal runtime.
//!
//! This crate is the leaf of the workspace: the NaN-boxed [`Value`]
//! representation, the global string interner, and the unified error type.
//! It has no knowledge of objects, shapes, or caches beyond the opaque
//! [`ObjectId`] handle that values carry.

pub mod error;
pub mod intern;
pub mod value;

pub use error::{EngineError, EngineResult};
pub use intern::{InternedString, intern, intern_hidden};
pub use value::{ObjectId, Value, ValueKind};
