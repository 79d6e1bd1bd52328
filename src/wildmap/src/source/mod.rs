//! Target access: memory, mapping tables and symbols
//!
//! The engine never talks to a process or a dump directly. Readers
//! implementing these traits live in the CLI.

mod maps;
mod region;
mod symbols;
mod traits;

#[cfg(test)]
mod mock;

pub use maps::{parse_line, parse_maps, ProcMaps};
pub use region::{Entity, MemoryRegion, Perms};
pub use symbols::{glibc_layouts, FieldLayout, StructLayout, SymbolTable, NBINS_SLOTS, NFASTBINS};
pub use traits::{AddressValidator, MemorySource, ProcessMapReader, SymbolAccessor};

#[cfg(test)]
pub use mock::MockMemorySource;
