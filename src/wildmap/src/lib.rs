//! # wildmap
//!
//! Address space and heap layout reconstruction for postmortem memory
//! analysis.
//!
//! The library models a target's address space as rings of non
//! overlapping spans, one ring per provider (dump bytes, mapping table,
//! executable images, thread stacks, heaps). Heap walkers rebuild the
//! allocator's view of memory from its own bookkeeping and answer which
//! chunk an address belongs to.
//!
//! ## Example
//!
//! ```no_run
//! use wildmap::{AnalysisConfig, ChunkQuery, MemorySource, Session, SymbolTable};
//!
//! # fn run(dump: Box<dyn MemorySource>) -> Result<(), wildmap::Error> {
//! let mut symbols = SymbolTable::glibc(8);
//! symbols.set("main_arena", 0x7f3a_1a3f_6c80);
//! symbols.set("mp_", 0x7f3a_1a3f_6280);
//!
//! let session = Session::open(dump, Box::new(symbols), AnalysisConfig::default())?;
//! for (heap, found) in session.lookup(0x5555_5576_1010)? {
//!     println!("{}: {} at {:?}", heap, found.relation, found.aligned);
//! }
//! let used = session.chunks(&ChunkQuery::default()).count();
//! println!("{} chunks in use", used);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod heap;
pub mod maps;
pub mod session;
pub mod source;
pub mod world;

#[doc(inline)]
pub use config::{AddressModel, AnalysisConfig};
#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use heap::{
    Allocator, ChunkInfo, ChunkQuery, Heap, HeapManager, Interrupt, Lookup, Relation, SizePred,
    Status,
};
#[doc(inline)]
pub use maps::{Extension, Range, Ring, Span};
#[doc(inline)]
pub use session::{Process, Session};
#[doc(inline)]
pub use source::{
    AddressValidator, MemoryRegion, MemorySource, ProcessMapReader, StructLayout, SymbolAccessor,
    SymbolTable,
};
#[doc(inline)]
pub use world::{Provider, Thread, World};
