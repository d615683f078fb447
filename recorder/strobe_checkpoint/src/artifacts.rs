//! Checkpoint-scoped artifact registry.
//!
//! Owns the deduplicated text→ordinal mapping for one checkpoint pass and
//! the list of types registered during it. Both physical string
//! representations (canonical symbols, ad-hoc raw text) share one ordinal
//! space; each distinct string holds exactly one ordinal per checkpoint no
//! matter how many artifacts reference it.
//!
//! The registry is created once and `reset` at the start of every pass;
//! `clear` wipes it after a productive pass. Not reentrant — exactly one
//! pass may be in progress.

use rustc_hash::FxHashMap;
use strobe_meta::{ArtifactRef, Mode, Symbol, TypeId, TypeMeta, TypeName};

/// Canned display name of the bootstrap loader.
pub const BOOT_LOADER_NAME: &str = "boot";

/// Sentinel raw-text hash under which the bootstrap name is interned.
/// [`strobe_meta::raw_text_hash`] never produces 0, so the sentinel cannot
/// collide with a host-published name.
pub const BOOT_NAME_HASH: u64 = 0;

/// Error when the per-checkpoint ordinal space is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// More distinct strings than fit in an ordinal (2^24 per checkpoint).
    OrdinalOverflow { count: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::OrdinalOverflow { count } => write!(
                f,
                "checkpoint ordinal space exhausted: {} entries, max is {}",
                count,
                ArtifactRef::MAX_ORDINAL
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Deduplicated artifact tables for one checkpoint pass.
pub struct ArtifactRegistry {
    mode: Mode,
    /// Canonical symbols, keyed by identity.
    symbols: FxHashMap<Symbol, u32>,
    /// Canonical entries in interning order.
    symbol_entries: Vec<(u32, Symbol)>,
    /// Raw text, keyed by caller-supplied hash.
    raw: FxHashMap<u64, u32>,
    /// Raw entries in interning order.
    raw_entries: Vec<(u32, String)>,
    /// Types registered this pass, in visitation order.
    types: Vec<TypeId>,
    next_ordinal: u32,
    has_type_entries: bool,
}

impl ArtifactRegistry {
    pub fn new() -> Self {
        let mut registry = ArtifactRegistry {
            mode: Mode::SteadyState,
            symbols: FxHashMap::default(),
            symbol_entries: Vec::new(),
            raw: FxHashMap::default(),
            raw_entries: Vec::new(),
            types: Vec::new(),
            next_ordinal: 1,
            has_type_entries: false,
        };
        registry.reset(Mode::SteadyState);
        registry
    }

    /// Begin a new checkpoint pass.
    ///
    /// Wipes all tables and pre-interns the bootstrap loader name, so it
    /// always holds ordinal 1.
    pub fn reset(&mut self, mode: Mode) {
        self.wipe();
        self.mode = mode;
        let boot = self.mark_raw(BOOT_LOADER_NAME, BOOT_NAME_HASH);
        assert_eq!(boot, 1, "bootstrap name must take the first ordinal");
    }

    /// Wipe all state after a productive pass.
    pub fn clear(&mut self) {
        self.wipe();
    }

    fn wipe(&mut self) {
        self.symbols.clear();
        self.symbol_entries.clear();
        self.raw.clear();
        self.raw_entries.clear();
        self.types.clear();
        self.next_ordinal = 1;
        self.has_type_entries = false;
    }

    /// Mode this pass was reset with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn take_ordinal(&mut self) -> Result<u32, RegistryError> {
        let ordinal = self.next_ordinal;
        if ordinal > ArtifactRef::MAX_ORDINAL {
            return Err(RegistryError::OrdinalOverflow {
                count: ordinal as usize,
            });
        }
        self.next_ordinal += 1;
        Ok(ordinal)
    }

    /// Intern a canonical symbol; idempotent within the pass.
    pub fn try_mark_symbol(&mut self, sym: Symbol) -> Result<u32, RegistryError> {
        if let Some(&ordinal) = self.symbols.get(&sym) {
            return Ok(ordinal);
        }
        let ordinal = self.take_ordinal()?;
        self.symbols.insert(sym, ordinal);
        self.symbol_entries.push((ordinal, sym));
        Ok(ordinal)
    }

    /// Intern a canonical symbol.
    ///
    /// # Panics
    /// Panics on ordinal exhaustion; use `try_mark_symbol` to handle it.
    pub fn mark_symbol(&mut self, sym: Symbol) -> u32 {
        self.try_mark_symbol(sym).unwrap_or_else(|e| panic!("{e}"))
    }

    /// Intern raw text under a caller-supplied hash; idempotent per hash.
    pub fn try_mark_raw(&mut self, text: &str, hash: u64) -> Result<u32, RegistryError> {
        if let Some(&ordinal) = self.raw.get(&hash) {
            return Ok(ordinal);
        }
        let ordinal = self.take_ordinal()?;
        self.raw.insert(hash, ordinal);
        self.raw_entries.push((ordinal, text.to_owned()));
        Ok(ordinal)
    }

    /// Intern raw text under a caller-supplied hash.
    ///
    /// # Panics
    /// Panics on ordinal exhaustion; use `try_mark_raw` to handle it.
    pub fn mark_raw(&mut self, text: &str, hash: u64) -> u32 {
        self.try_mark_raw(text, hash)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Intern a type's name, whichever representation it carries.
    pub fn mark_type(&mut self, ty: &TypeMeta) -> u32 {
        match &ty.name {
            TypeName::Symbol(sym) => self.mark_symbol(*sym),
            TypeName::Raw { text, hash } => self.mark_raw(text, *hash),
        }
    }

    /// Ordinal of an already-interned canonical symbol.
    pub fn symbol_ordinal(&self, sym: Symbol) -> Option<u32> {
        self.symbols.get(&sym).copied()
    }

    /// Ordinal of already-interned raw text, by hash.
    pub fn raw_ordinal(&self, hash: u64) -> Option<u32> {
        self.raw.get(&hash).copied()
    }

    /// Ordinal of a type's already-interned name.
    pub fn type_name_ordinal(&self, ty: &TypeMeta) -> Option<u32> {
        match &ty.name {
            TypeName::Symbol(sym) => self.symbol_ordinal(*sym),
            TypeName::Raw { hash, .. } => self.raw_ordinal(*hash),
        }
    }

    /// Record a type as visited this pass.
    pub fn register_type(&mut self, id: TypeId) {
        self.types.push(id);
        self.has_type_entries = true;
    }

    /// True once any type has been registered this pass. Gates whether the
    /// loader/member/string stages run at all.
    pub fn has_type_entries(&self) -> bool {
        self.has_type_entries
    }

    /// Types registered this pass, in visitation order.
    pub fn registered_types(&self) -> &[TypeId] {
        &self.types
    }

    /// Canonical entries in interning order.
    pub fn iter_symbols(&self) -> impl Iterator<Item = (u32, Symbol)> + '_ {
        self.symbol_entries.iter().copied()
    }

    /// Raw-text entries in interning order.
    pub fn iter_raw(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.raw_entries
            .iter()
            .map(|(ordinal, text)| (*ordinal, text.as_str()))
    }
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::new()
    }
}
