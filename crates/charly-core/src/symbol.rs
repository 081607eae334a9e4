//! Symbol interning
//!
//! A symbol is the CRC-32 of the canonical string rendering of a value,
//! widened into the 48-bit payload of a NaN-boxed symbol. The hash function
//! is pure and stable across runs, so no shared interning table is needed to
//! create symbols; the [`SymbolTable`] exists only to recover human-readable
//! names for diagnostics and stack traces.

use crate::value::Value;
use rustc_hash::FxHashMap;

/// Hash a name into its 48-bit symbol payload
#[inline]
pub fn symbol_hash(name: &str) -> u64 {
    crc32fast::hash(name.as_bytes()) as u64
}

/// Create a symbol value from a name
#[inline]
pub fn symbol_value(name: &str) -> Value {
    Value::symbol(symbol_hash(name))
}

/// Reverse mapping from symbol payloads to the names that produced them
///
/// Purely diagnostic; lookups that miss fall back to printing the raw hash.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: FxHashMap<u64, String>,
}

impl SymbolTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a name and return its symbol value
    pub fn intern(&mut self, name: &str) -> Value {
        let hash = symbol_hash(name);
        self.names.entry(hash).or_insert_with(|| name.to_string());
        Value::symbol(hash)
    }

    /// Register a name behind a precomputed hash (from a compiled block)
    pub fn register(&mut self, hash: u64, name: &str) {
        self.names.entry(hash).or_insert_with(|| name.to_string());
    }

    /// Look up the name behind a symbol payload
    pub fn name(&self, hash: u64) -> Option<&str> {
        self.names.get(&hash).map(String::as_str)
    }

    /// Render a symbol for diagnostics, falling back to the raw hash
    pub fn describe(&self, hash: u64) -> String {
        match self.name(hash) {
            Some(name) => name.to_string(),
            None => format!("<sym:{:#x}>", hash),
        }
    }
}
