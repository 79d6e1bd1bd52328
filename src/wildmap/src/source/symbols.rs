//! Struct layouts and symbol addresses
//!
//! A [`SymbolTable`] is usually loaded from a TOML file written by hand or
//! exported from debug info:
//!
//! ```toml
//! word = 8
//!
//! [symbols]
//! main_arena = 0x7f3a1a3f6c80
//! mp_ = 0x7f3a1a3f6280
//!
//! [types.malloc_state]
//! size = 0x898
//! fields.top = { offset = 0x60, size = 8 }
//! ```
//!
//! Layouts missing from the file fall back to the built-in glibc ones for
//! the word size.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::traits::SymbolAccessor;
use crate::error::{Error, Result};

/// Number of fastbins in `malloc_state`
pub const NFASTBINS: u64 = 10;

/// Number of bin slots in `malloc_state.bins`
pub const NBINS_SLOTS: u64 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldLayout {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StructLayout {
    pub size: u64,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldLayout>,
}

impl StructLayout {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, offset: u64, size: u64) -> Self {
        self.fields
            .insert(name.to_string(), FieldLayout { offset, size });
        self
    }

    pub fn field(&self, name: &str) -> Result<FieldLayout> {
        self.fields
            .get(name)
            .copied()
            .ok_or_else(|| Error::Symbol(format!("field {}", name)))
    }

    pub fn offset(&self, name: &str) -> Result<u64> {
        self.field(name).map(|f| f.offset)
    }
}

/// Symbol addresses plus struct layouts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    #[serde(default)]
    pub word: Option<usize>,
    #[serde(default)]
    pub symbols: BTreeMap<String, u64>,
    #[serde(default)]
    pub types: BTreeMap<String, StructLayout>,
}

impl SymbolTable {
    /// Table holding only the built-in glibc layouts
    pub fn glibc(word: usize) -> Self {
        let mut table = Self {
            word: Some(word),
            ..Self::default()
        };
        table.types = glibc_layouts(word as u64);
        table
    }

    /// Fill in built-in glibc layouts the table does not define itself
    pub fn with_defaults(mut self, word: usize) -> Self {
        let word = self.word.unwrap_or(word);
        self.word = Some(word);
        for (name, layout) in glibc_layouts(word as u64) {
            self.types.entry(name).or_insert(layout);
        }
        self
    }

    pub fn set(&mut self, symbol: &str, address: u64) {
        self.symbols.insert(symbol.to_string(), address);
    }
}

impl SymbolAccessor for SymbolTable {
    fn resolve(&self, type_name: &str) -> Option<StructLayout> {
        self.types.get(type_name).cloned()
    }

    fn addr(&self, symbol: &str) -> Option<u64> {
        self.symbols.get(symbol).copied()
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Layouts of the glibc malloc structures for a word size
pub fn glibc_layouts(w: u64) -> BTreeMap<String, StructLayout> {
    let mut types = BTreeMap::new();

    types.insert(
        "malloc_chunk".to_string(),
        StructLayout::new(4 * w)
            .with("prev_size", 0, w)
            .with("size", w, w)
            .with("fd", 2 * w, w)
            .with("bk", 3 * w, w),
    );

    // mutex, flags and have_fastchunks are ints
    let fastbins = align_up(12, w);
    let top = fastbins + NFASTBINS * w;
    let bins = top + 2 * w;
    let binmap = bins + NBINS_SLOTS * w;
    let next = binmap + 16;
    let system_mem = next + 3 * w;
    types.insert(
        "malloc_state".to_string(),
        StructLayout::new(system_mem + 2 * w)
            .with("mutex", 0, 4)
            .with("flags", 4, 4)
            .with("have_fastchunks", 8, 4)
            .with("fastbinsY", fastbins, NFASTBINS * w)
            .with("top", top, w)
            .with("last_remainder", top + w, w)
            .with("bins", bins, NBINS_SLOTS * w)
            .with("binmap", binmap, 16)
            .with("next", next, w)
            .with("next_free", next + w, w)
            .with("attached_threads", next + 2 * w, w)
            .with("system_mem", system_mem, w)
            .with("max_system_mem", system_mem + w, w),
    );

    types.insert(
        "heap_info".to_string(),
        StructLayout::new(4 * w)
            .with("ar_ptr", 0, w)
            .with("prev", w, w)
            .with("size", 2 * w, w)
            .with("mprotect_size", 3 * w, w),
    );

    let ints = 5 * w;
    let mmapped = align_up(ints + 16, w);
    types.insert(
        "malloc_par".to_string(),
        StructLayout::new(mmapped + 3 * w)
            .with("trim_threshold", 0, w)
            .with("top_pad", w, w)
            .with("mmap_threshold", 2 * w, w)
            .with("arena_test", 3 * w, w)
            .with("arena_max", 4 * w, w)
            .with("n_mmaps", ints, 4)
            .with("n_mmaps_max", ints + 4, 4)
            .with("max_n_mmaps", ints + 8, 4)
            .with("no_dyn_threshold", ints + 12, 4)
            .with("mmapped_mem", mmapped, w)
            .with("max_mmapped_mem", mmapped + w, w)
            .with("sbrk_base", mmapped + 2 * w, w),
    );

    types
}
