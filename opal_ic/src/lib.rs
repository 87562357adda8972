//! Inline property caches for dynamic property access.
//!
//! Every property access site in compiled code owns a cache root
//! ([`PropertyGetCache`] or [`PropertySetCache`]). A root holds a chain of
//! specialized entries, each pairing a receiver check with a leaf
//! operation, ordered most-specific-first. Sites progress through states
//! based on observed receiver diversity:
//!
//! ```text
//! Uninitialized → Monomorphic → Polymorphic → Megamorphic
//!                     ↑              ↑              ↑
//!                 1 entry       2..limit        1 generic entry
//! ```
//!
//! Megamorphic is terminal for a chain's lifetime; only an explicit chain
//! discard ([`PropertyGetCache::invalidate`]) resets a site.
//!
//! # Soundness
//!
//! On every access the whole chain is scanned even after a match is found:
//! an entry is only used once the remainder of the chain is confirmed free
//! of invalidated entries and of constant-object entries observed with the
//! wrong object. Entry validity is carried by assumption tokens owned by
//! the object model; token invalidation is monotonic, so a reader racing an
//! invalidation uses a stale-but-still-true entry at most once more.
//!
//! # Concurrency
//!
//! The chain head is shared and read concurrently; rebuilds are serialized
//! by a per-root lock and publish a fully-constructed chain, so readers
//! observe the old or the new chain, never a partial one.

pub mod chain;
pub mod config;
pub mod get;
pub mod receiver_check;
pub mod set;
pub mod stats;

mod root;

#[cfg(test)]
mod integration_tests;

pub use chain::EntryFlags;
pub use config::CacheConfig;
pub use get::{GetOp, PropertyGetCache};
pub use receiver_check::{PrimitiveKind, ReceiverCheck};
pub use set::{PropertySetCache, SetOp};
pub use stats::{CacheState, RootStats};

bitflags::bitflags! {
    /// Per-site configuration of a cache root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RootOptions: u8 {
        /// Strict-mode write semantics (errors instead of silent no-ops).
        const STRICT = 1 << 0;
        /// Own properties only; never walk the prototype chain.
        const OWN_PROPERTY = 1 << 1;
        /// An absent property is a ReferenceError (global variable loads).
        const REQUIRED = 1 << 2;
        /// The receiver is a statically-known singleton; entries may bind
        /// to its identity (constant-object specialization).
        const GLOBAL = 1 << 3;
        /// Declarative const binding; every write is a TypeError.
        const CONST = 1 << 4;
    }
}
