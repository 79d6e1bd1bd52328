//! Heap reconstruction
//!
//! A [`Heap`] turns allocator bookkeeping found in the target into a ring
//! of heap spans registered in the [`World`], then answers which chunk an
//! address belongs to and which chunks are in use. The [`HeapManager`]
//! runs every configured allocator and keeps the ones that worked.

pub mod glibc;
pub mod lfalloc;
mod pred;

pub use pred::{SizeFilter, SizePred};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::maps::Range;
use crate::source::{AddressValidator, MemorySource, SymbolAccessor};
use crate::world::World;

/// Relation of an address to the heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Unknown,
    /// Not inside any known heap span
    OutOf,
    /// Reserved by the allocator but never handed out
    Zero,
    /// Used by the allocator once and kept for reuse
    Keep,
    /// Released chunk, contents may still be meaningful
    Free,
    /// Inside an allocated chunk
    Chunk,
    /// Inside an allocated block served by its own mapping
    Huge,
    /// Inside the bookkeeping header of a chunk
    Head,
    /// Allocator internal data
    Intern,
    /// Occupied but unusable tail
    Waste,
}

impl Relation {
    pub fn name(self) -> &'static str {
        match self {
            Relation::Unknown => "unknown",
            Relation::OutOf => "outof",
            Relation::Zero => "zero",
            Relation::Keep => "keep",
            Relation::Free => "free",
            Relation::Chunk => "chunk",
            Relation::Huge => "huge",
            Relation::Head => "head",
            Relation::Intern => "intrn",
            Relation::Waste => "waste",
        }
    }

    /// The address belongs to some heap
    pub fn is_found(self) -> bool {
        !matches!(self, Relation::OutOf | Relation::Unknown)
    }

    /// The address lies inside a live allocation
    pub fn is_used(self) -> bool {
        matches!(self, Relation::Chunk | Relation::Huge)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Answer of a heap lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lookup {
    pub relation: Relation,
    /// First payload byte of the chunk
    pub aligned: Option<u64>,
    /// Distance of the address from `aligned`, negative inside headers
    pub offset: Option<i64>,
    /// Usable size of the chunk
    pub size: Option<u64>,
    /// Step between chunk sizes around this one
    pub granularity: Option<u64>,
}

impl Lookup {
    pub fn out_of() -> Self {
        Self {
            relation: Relation::OutOf,
            aligned: None,
            offset: None,
            size: None,
            granularity: None,
        }
    }

    pub fn new(relation: Relation, aligned: u64, at: u64, size: u64, granularity: Option<u64>) -> Self {
        Self {
            relation,
            aligned: Some(aligned),
            offset: Some(at.wrapping_sub(aligned) as i64),
            size: Some(size),
            granularity,
        }
    }
}

/// One chunk yielded by a heap listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub relation: Relation,
    /// First payload byte
    pub at: u64,
    pub size: u64,
    pub granularity: u64,
}

/// Chunk listing filter
#[derive(Debug, Clone)]
pub struct ChunkQuery {
    pub range: Range,
    pub size: SizePred,
    /// `Some(true)` lists dedicated mapping blocks only, `Some(false)` skips them
    pub huge: Option<bool>,
}

impl Default for ChunkQuery {
    fn default() -> Self {
        Self {
            range: Range::WILD,
            size: SizePred::Any,
            huge: None,
        }
    }
}

impl ChunkQuery {
    pub fn wants_huge(&self) -> bool {
        self.huge != Some(false)
    }

    pub fn wants_small(&self) -> bool {
        self.huge != Some(true)
    }
}

/// Cooperative cancellation flag shared with a session's owner
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Interrupted`] once raised
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Everything a heap walker reads the target through
#[derive(Clone, Copy)]
pub struct Target<'a> {
    pub reader: &'a dyn MemorySource,
    pub symbols: &'a dyn SymbolAccessor,
    pub validator: &'a dyn AddressValidator,
    pub config: &'a AnalysisConfig,
    pub interrupt: &'a Interrupt,
}

pub type Chunks<'a> = Box<dyn Iterator<Item = Result<ChunkInfo>> + 'a>;

/// A reconstructed heap
pub trait Heap {
    fn name(&self) -> &'static str;

    /// World seq of the heap ring
    fn ring(&self) -> usize;

    fn lookup(&self, target: &Target<'_>, world: &World, at: u64) -> Result<Lookup>;

    /// Lazily list chunks in use
    fn chunks<'a>(&'a self, target: Target<'a>, world: &'a World, query: &ChunkQuery) -> Chunks<'a>;

    /// Named counters for status output
    fn stats(&self) -> Vec<(&'static str, u64)>;
}

/// Known heap implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Allocator {
    Glibc,
    LfAlloc,
}

impl Allocator {
    pub const ALL: [Allocator; 2] = [Allocator::Glibc, Allocator::LfAlloc];

    pub fn name(self) -> &'static str {
        match self {
            Allocator::Glibc => "glibc",
            Allocator::LfAlloc => "lfalloc",
        }
    }

    /// Reconstruct this kind of heap and register its ring
    pub fn discover(self, target: &Target<'_>, world: &mut World) -> Result<Box<dyn Heap>> {
        match self {
            Allocator::Glibc => Ok(Box::new(glibc::GlibcHeap::discover(target, world)?)),
            Allocator::LfAlloc => Ok(Box::new(lfalloc::LfAllocHeap::discover(target, world)?)),
        }
    }
}

impl fmt::Display for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Allocator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Allocator::ALL
            .into_iter()
            .find(|a| a.name() == s.to_ascii_lowercase())
            .ok_or_else(|| Error::Provider(format!("unknown allocator {}", s)))
    }
}

/// Discovery outcome of one allocator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "reason")]
pub enum Status {
    Pending,
    Ready,
    Failed(String),
}

pub struct HeapEntry {
    pub kind: Allocator,
    pub status: Status,
    pub elapsed: Duration,
    heap: Option<Box<dyn Heap>>,
}

impl HeapEntry {
    pub fn heap(&self) -> Option<&dyn Heap> {
        self.heap.as_deref()
    }
}

/// Registry of the heap implementations tried on a target
#[derive(Default)]
pub struct HeapManager {
    entries: Vec<HeapEntry>,
}

impl HeapManager {
    pub fn new(kinds: impl IntoIterator<Item = Allocator>) -> Self {
        let mut entries: Vec<HeapEntry> = Vec::new();
        for kind in kinds {
            if entries.iter().all(|e| e.kind != kind) {
                entries.push(HeapEntry {
                    kind,
                    status: Status::Pending,
                    elapsed: Duration::ZERO,
                    heap: None,
                });
            }
        }
        Self { entries }
    }

    /// Registry from allocator names, unknown names are an error
    pub fn from_names(names: &[String]) -> Result<Self> {
        let kinds = names
            .iter()
            .map(|n| n.parse::<Allocator>())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(kinds))
    }

    /// Run discovery of every pending allocator
    ///
    /// A failing allocator is recorded and skipped. Only an interrupt
    /// stops discovery as a whole.
    pub fn discover(&mut self, target: &Target<'_>, world: &mut World) -> Result<()> {
        for entry in self.entries.iter_mut() {
            if entry.status != Status::Pending {
                continue;
            }

            let start = Instant::now();
            let outcome = entry.kind.discover(target, world);
            entry.elapsed = start.elapsed();

            match outcome {
                Ok(heap) => {
                    info!(
                        heap = entry.kind.name(),
                        elapsed_ms = entry.elapsed.as_millis() as u64,
                        "heap discovered"
                    );
                    entry.status = Status::Ready;
                    entry.heap = Some(heap);
                }
                Err(Error::Interrupted) => return Err(Error::Interrupted),
                Err(err) => {
                    error!(
                        heap = entry.kind.name(),
                        elapsed_ms = entry.elapsed.as_millis() as u64,
                        "heap discovery failed: {}",
                        err
                    );
                    entry.status = Status::Failed(err.to_string());
                }
            }
        }
        Ok(())
    }

    pub fn entries(&self) -> &[HeapEntry] {
        &self.entries
    }

    pub fn ready(&self) -> impl Iterator<Item = &dyn Heap> + '_ {
        self.entries.iter().filter_map(HeapEntry::heap)
    }

    /// Ask every ready heap, only heaps knowing the address answer
    pub fn lookup(&self, target: &Target<'_>, world: &World, at: u64) -> Result<Vec<(&'static str, Lookup)>> {
        let mut found = Vec::new();
        for heap in self.ready() {
            let lookup = heap.lookup(target, world, at)?;
            if lookup.relation.is_found() {
                found.push((heap.name(), lookup));
            }
        }
        Ok(found)
    }

    /// Chunks of every ready heap, heap by heap
    pub fn chunks<'a>(
        &'a self,
        target: Target<'a>,
        world: &'a World,
        query: &'a ChunkQuery,
    ) -> impl Iterator<Item = Result<(&'static str, ChunkInfo)>> + 'a {
        self.ready().flat_map(move |heap| {
            let name = heap.name();
            heap.chunks(target, world, query)
                .map(move |chunk| chunk.map(|c| (name, c)))
        })
    }
}
