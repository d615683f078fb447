//! String interner backing the host runtime's canonical symbols.
//!
//! Provides O(1) interning and lookup with concurrent access via a
//! read-fast-path / write-slow-path lock. Interned text is leaked to get
//! `'static` storage; symbols are never deallocated for the process
//! lifetime, which is what lets checkpoint passes hold `Symbol` handles
//! without lifetime concerns.

use crate::Symbol;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::Hasher;

/// Error when interning a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolStoreError {
    /// Store exceeded capacity (over 4 billion strings).
    Exhausted { count: usize },
}

impl std::fmt::Display for SymbolStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolStoreError::Exhausted { count } => write!(
                f,
                "symbol store exceeded capacity: {} strings, max is {}",
                count,
                u32::MAX
            ),
        }
    }
}

impl std::error::Error for SymbolStoreError {}

struct StoreInner {
    /// Map from string content to index.
    map: FxHashMap<&'static str, u32>,
    /// Storage for string contents, indexed by `Symbol`.
    strings: Vec<&'static str>,
}

/// Canonical symbol store.
///
/// # Thread Safety
/// Uses an `RwLock` for concurrent read/write access: event-recording
/// threads intern and look up symbols while a checkpoint pass is reading.
pub struct SymbolStore {
    inner: RwLock<StoreInner>,
}

impl SymbolStore {
    /// Create a new store with the empty string pre-interned at index 0.
    pub fn new() -> Self {
        let empty: &'static str = "";
        let mut map = FxHashMap::default();
        map.insert(empty, 0);
        SymbolStore {
            inner: RwLock::new(StoreInner {
                map,
                strings: vec![empty],
            }),
        }
    }

    /// Try to intern a string, returning its Symbol or an error on overflow.
    pub fn try_intern(&self, s: &str) -> Result<Symbol, SymbolStoreError> {
        // Fast path: already interned.
        {
            let guard = self.inner.read();
            if let Some(&idx) = guard.map.get(s) {
                return Ok(Symbol::from_raw(idx));
            }
        }

        let mut guard = self.inner.write();

        // Double-check after acquiring the write lock.
        if let Some(&idx) = guard.map.get(s) {
            return Ok(Symbol::from_raw(idx));
        }

        let idx = u32::try_from(guard.strings.len()).map_err(|_| SymbolStoreError::Exhausted {
            count: guard.strings.len(),
        })?;

        // Leak to get 'static lifetime.
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        guard.strings.push(leaked);
        guard.map.insert(leaked, idx);

        Ok(Symbol::from_raw(idx))
    }

    /// Intern a string, returning its Symbol.
    ///
    /// # Panics
    /// Panics if the store exceeds capacity. Use `try_intern` for fallible
    /// interning.
    #[inline]
    pub fn intern(&self, s: &str) -> Symbol {
        self.try_intern(s).unwrap_or_else(|e| panic!("{e}"))
    }

    /// Look up the text for a Symbol.
    ///
    /// Returns `'static` text: interned strings are leaked, never freed.
    pub fn lookup(&self, sym: Symbol) -> &'static str {
        let guard = self.inner.read();
        guard.strings[sym.index()]
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.inner.read().strings.len()
    }

    /// Whether only the empty string is interned.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }
}

impl Default for SymbolStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash for ad-hoc raw text artifacts.
///
/// Raw text is not canonicalized by the store, so value equality has to be
/// asserted via hashing; hosts publishing raw-named types must key them
/// with this function (distinct texts are assumed to hash distinctly — a
/// collision is a caller contract breach).
pub fn raw_text_hash(text: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(text.as_bytes());
    // Reserve 0: it is the sentinel hash for the bootstrap loader name.
    hasher.finish() | 1
}
