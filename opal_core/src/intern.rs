//! String interning for O(1) property-key equality.
//!
//! Property keys are compared on every cache probe, so they are interned
//! once and compared by pointer identity afterwards. Each interned string
//! also carries a stable `u32` symbol, which is what [`crate::Value`]
//! NaN-boxes: the interner never evicts, so a symbol resolves for the
//! lifetime of the process.
//!
//! Hidden keys (internal engine keys that must never collide with
//! user-visible property names) are supported via [`intern_hidden`], which
//! mints a fresh symbol on every call.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A handle to an interned string.
///
/// `InternedString` is a thin wrapper around an `Arc<str>` plus its interner
/// symbol. Two `InternedString`s are equal if and only if they were produced
/// by the same interner entry, making equality a pointer comparison.
#[derive(Clone)]
pub struct InternedString {
    inner: Arc<str>,
    symbol: u32,
}

impl InternedString {
    /// Get the string content.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Get the stable interner symbol for this string.
    #[inline]
    #[must_use]
    pub fn symbol(&self) -> u32 {
        self.symbol
    }

    /// Get the length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the string is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Check whether this is a hidden (engine-internal) key.
    #[inline]
    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.inner.starts_with(HIDDEN_KEY_PREFIX)
    }
}

impl PartialEq for InternedString {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        // Pointer comparison for O(1) equality
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.symbol.hash(state);
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternedString({:?})", self.as_str())
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for InternedString {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

// =============================================================================
// Interner
// =============================================================================

/// Prefix reserved for hidden keys. Contains a control character, so no
/// user-visible property name can collide with it.
const HIDDEN_KEY_PREFIX: &str = "\u{1}hidden:";

/// The global string interner.
///
/// Strings are stored once and never evicted; `by_symbol` gives stable
/// symbol-to-string resolution for NaN-boxed values.
struct Interner {
    by_content: RwLock<FxHashMap<Arc<str>, u32>>,
    by_symbol: RwLock<Vec<Arc<str>>>,
}

impl Interner {
    fn new() -> Self {
        Self {
            by_content: RwLock::new(FxHashMap::default()),
            by_symbol: RwLock::new(Vec::new()),
        }
    }

    fn intern(&self, s: &str) -> InternedString {
        // Fast path: already interned.
        if let Some(&symbol) = self.by_content.read().get(s) {
            let inner = self.by_symbol.read()[symbol as usize].clone();
            return InternedString { inner, symbol };
        }

        let mut by_content = self.by_content.write();
        // Re-check under the write lock: another thread may have won.
        if let Some(&symbol) = by_content.get(s) {
            let inner = self.by_symbol.read()[symbol as usize].clone();
            return InternedString { inner, symbol };
        }

        let inner: Arc<str> = Arc::from(s);
        let mut by_symbol = self.by_symbol.write();
        let symbol = u32::try_from(by_symbol.len()).expect("interner symbol space exhausted");
        by_symbol.push(inner.clone());
        by_content.insert(inner.clone(), symbol);
        InternedString { inner, symbol }
    }

    fn resolve(&self, symbol: u32) -> Option<InternedString> {
        let by_symbol = self.by_symbol.read();
        by_symbol.get(symbol as usize).map(|inner| InternedString {
            inner: inner.clone(),
            symbol,
        })
    }
}

static INTERNER: OnceLock<Interner> = OnceLock::new();
static HIDDEN_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

#[inline]
fn interner() -> &'static Interner {
    INTERNER.get_or_init(Interner::new)
}

/// Intern a string in the global interner.
#[inline]
pub fn intern(s: &str) -> InternedString {
    interner().intern(s)
}

/// Mint a fresh hidden key.
///
/// Each call returns a distinct key, even for the same label. Hidden keys
/// never compare equal to any user-visible property name.
pub fn intern_hidden(label: &str) -> InternedString {
    let n = HIDDEN_KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
    interner().intern(&format!("{HIDDEN_KEY_PREFIX}{label}#{n}"))
}

/// Resolve an interner symbol back to its string.
///
/// Returns `None` for symbols that were never issued.
#[inline]
pub fn resolve_symbol(symbol: u32) -> Option<InternedString> {
    interner().resolve(symbol)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let a = intern("hello");
        let b = intern("hello");
        assert_eq!(a, b);
        assert_eq!(a.symbol(), b.symbol());
    }

    #[test]
    fn test_intern_distinct() {
        let a = intern("alpha");
        let b = intern("beta");
        assert_ne!(a, b);
        assert_ne!(a.symbol(), b.symbol());
    }

    #[test]
    fn test_resolve_symbol_roundtrip() {
        let a = intern("roundtrip");
        let resolved = resolve_symbol(a.symbol()).unwrap();
        assert_eq!(a, resolved);
        assert_eq!(resolved.as_str(), "roundtrip");
    }

    #[test]
    fn test_resolve_unknown_symbol() {
        assert!(resolve_symbol(u32::MAX).is_none());
    }

    #[test]
    fn test_hidden_keys_are_unique() {
        let a = intern_hidden("scope");
        let b = intern_hidden("scope");
        assert_ne!(a, b);
        assert!(a.is_hidden());
        assert!(b.is_hidden());
    }

    #[test]
    fn test_hidden_keys_never_collide_with_user_names() {
        let hidden = intern_hidden("x");
        let user = intern("x");
        assert_ne!(hidden, user);
        assert!(!user.is_hidden());
    }

    #[test]
    fn test_empty_and_unicode() {
        assert_eq!(intern("").as_str(), "");
        assert!(intern("").is_empty());
        let s = intern("名前");
        assert_eq!(s.as_str(), "名前");
    }

    #[test]
    fn test_concurrent_intern() {
        use std::thread;

        let handles: Vec<_> = (0..8)
            .map(|_| thread::spawn(|| intern("shared").symbol()))
            .collect();
        let symbols: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(symbols.windows(2).all(|w| w[0] == w[1]));
    }
}
