//! Typed payloads attached to spans
//!
//! Every [`Span`](super::Span) may carry one [`Extension`]. Whatever the
//! variant, it must follow the span through cuts and extensions: a subset
//! copy is made for split off parts and the payload may refuse a new range
//! that would break its own invariants.

use serde::Serialize;

use super::alias::Alias;
use super::range::Range;
use crate::source::MemoryRegion;

/// Capability interface of span payloads
pub trait Exten {
    /// Short human readable description
    fn describe(&self) -> String;

    /// Independent copy restricted to `range`
    fn subset(&self, range: &Range) -> Self
    where
        Self: Sized;

    /// Adopt a new parent range, `force` allows dropping state that no
    /// longer fits. Returns false when the range is refused.
    fn accept_extend(&mut self, range: &Range, force: bool) -> bool;
}

/// Where the bytes or the ownership of a non heap span come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Bytes saved in a core or dump file
    Core,
    /// Bytes readable in a live process
    Memory,
    /// A loaded executable image or mapped library
    Exec { image: String },
    /// A row of the process mapping table
    Mapping(MemoryRegion),
    /// Thread stack, `used` is the part above the stack pointer
    Stack { thread: u32, used: bool },
}

impl Provenance {
    /// The span is backed by readable bytes
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            Provenance::Core | Provenance::Memory | Provenance::Exec { .. }
        )
    }

    /// The span names an owner of the bytes
    pub fn is_logical(&self) -> bool {
        !matches!(
            self,
            Provenance::Core | Provenance::Memory | Provenance::Mapping(_)
        )
    }
}

impl Exten for Provenance {
    fn describe(&self) -> String {
        match self {
            Provenance::Core => "core".to_string(),
            Provenance::Memory => "memory".to_string(),
            Provenance::Exec { image } => format!("exec {}", image),
            Provenance::Mapping(region) => match &region.path {
                Some(path) => format!("map {} {}", region.perms, path),
                None => format!("map {}", region.perms),
            },
            Provenance::Stack { thread, used } => {
                format!("stack #{} {}", thread, if *used { "used" } else { "free" })
            }
        }
    }

    fn subset(&self, _range: &Range) -> Self {
        self.clone()
    }

    fn accept_extend(&mut self, _range: &Range, _force: bool) -> bool {
        true
    }
}

/// How a glibc heap fragment was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FragmentKind {
    /// Cut from an arena region with known bounds
    Bound,
    /// Cut from a region whose bounds came from alias points only
    Frag,
    /// Found by walking backwards from a fragment
    Left,
    /// A chunk served directly by mmap()
    Mmapped,
    Single,
}

impl FragmentKind {
    pub fn name(self) -> &'static str {
        match self {
            FragmentKind::Bound => "bound",
            FragmentKind::Frag => "frag",
            FragmentKind::Left => "left",
            FragmentKind::Mmapped => "mmapped",
            FragmentKind::Single => "single",
        }
    }
}

/// Payload of glibc heap fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub arena: Option<usize>,
    pub kind: FragmentKind,
    pub alias: Alias,
}

impl Fragment {
    pub fn new(arena: Option<usize>, kind: FragmentKind, range: Range) -> Self {
        Self {
            arena,
            kind,
            alias: Alias::new(range),
        }
    }
}

impl Exten for Fragment {
    fn describe(&self) -> String {
        let arena = self
            .arena
            .map_or_else(|| "-".to_string(), |seq| format!("#{}", seq));
        format!("glibc {} {}, {}", arena, self.kind.name(), self.alias.describe())
    }

    fn subset(&self, range: &Range) -> Self {
        Self {
            arena: self.arena,
            kind: self.kind,
            alias: self.alias.subset(range),
        }
    }

    fn accept_extend(&mut self, range: &Range, force: bool) -> bool {
        self.alias.accept_extend(range, force)
    }
}

/// Role of a span of the block based allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolKind {
    /// Run of 1 MiB blocks sliced into equal items
    Small,
    /// Used block served by a dedicated mapping
    Huge,
    /// Released large block kept for reuse
    Free,
}

/// Payload of block allocator spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool {
    pub kind: PoolKind,
}

impl Exten for Pool {
    fn describe(&self) -> String {
        let name = match self.kind {
            PoolKind::Small => "small",
            PoolKind::Huge => "huge",
            PoolKind::Free => "free",
        };
        format!("lfalloc {}", name)
    }

    fn subset(&self, _range: &Range) -> Self {
        *self
    }

    fn accept_extend(&mut self, _range: &Range, _force: bool) -> bool {
        true
    }
}

/// Closed set of span payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Alias(Alias),
    Provenance(Provenance),
    Fragment(Fragment),
    Pool(Pool),
}

impl Extension {
    pub fn alias(&self) -> Option<&Alias> {
        match self {
            Extension::Alias(alias) => Some(alias),
            Extension::Fragment(frag) => Some(&frag.alias),
            _ => None,
        }
    }

    pub fn alias_mut(&mut self) -> Option<&mut Alias> {
        match self {
            Extension::Alias(alias) => Some(alias),
            Extension::Fragment(frag) => Some(&mut frag.alias),
            _ => None,
        }
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        match self {
            Extension::Provenance(prov) => Some(prov),
            _ => None,
        }
    }

    pub fn fragment(&self) -> Option<&Fragment> {
        match self {
            Extension::Fragment(frag) => Some(frag),
            _ => None,
        }
    }

    pub fn pool(&self) -> Option<&Pool> {
        match self {
            Extension::Pool(pool) => Some(pool),
            _ => None,
        }
    }
}

impl Exten for Extension {
    fn describe(&self) -> String {
        match self {
            Extension::Alias(x) => x.describe(),
            Extension::Provenance(x) => x.describe(),
            Extension::Fragment(x) => x.describe(),
            Extension::Pool(x) => x.describe(),
        }
    }

    fn subset(&self, range: &Range) -> Self {
        match self {
            Extension::Alias(x) => Extension::Alias(x.subset(range)),
            Extension::Provenance(x) => Extension::Provenance(x.subset(range)),
            Extension::Fragment(x) => Extension::Fragment(x.subset(range)),
            Extension::Pool(x) => Extension::Pool(x.subset(range)),
        }
    }

    fn accept_extend(&mut self, range: &Range, force: bool) -> bool {
        match self {
            Extension::Alias(x) => x.accept_extend(range, force),
            Extension::Provenance(x) => x.accept_extend(range, force),
            Extension::Fragment(x) => x.accept_extend(range, force),
            Extension::Pool(x) => x.accept_extend(range, force),
        }
    }
}

impl From<Alias> for Extension {
    fn from(alias: Alias) -> Self {
        Extension::Alias(alias)
    }
}

impl From<Provenance> for Extension {
    fn from(prov: Provenance) -> Self {
        Extension::Provenance(prov)
    }
}

impl From<Fragment> for Extension {
    fn from(frag: Fragment) -> Self {
        Extension::Fragment(frag)
    }
}

impl From<Pool> for Extension {
    fn from(pool: Pool) -> Self {
        Extension::Pool(pool)
    }
}
