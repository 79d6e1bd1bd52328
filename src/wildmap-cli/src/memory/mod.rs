//! Target access for the CLI
//!
//! Provides memory sources for live processes and dump files, and loads
//! symbol tables.

mod dump;
mod process;

pub use dump::DumpFile;
pub use process::LiveProcess;

use anyhow::{Context, Result};
use std::path::Path;

use wildmap::SymbolTable;

/// Load a TOML symbol table, built-in glibc layouts fill the gaps
pub fn load_symbols(path: Option<&Path>, word: usize) -> Result<SymbolTable> {
    let table = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read symbols from {}", path.display()))?;
            toml::from_str::<SymbolTable>(&text)
                .with_context(|| format!("Failed to parse symbols in {}", path.display()))?
        }
        None => SymbolTable::default(),
    };
    Ok(table.with_defaults(word))
}
