//! Builders of the non heap provider rings

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::{is_physical, Provider, World};
use crate::error::{Error, Result};
use crate::maps::{Extension, Provenance, Range, Ring, Span};
use crate::source::{Entity, MemoryRegion};

/// A thread of the target and its stack pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread {
    pub id: u32,
    pub sp: u64,
}

fn tagged(regions: &[MemoryRegion], keep: impl Fn(&MemoryRegion) -> bool, prov: Provenance) -> Result<Ring> {
    let mut ring = Ring::new();
    for region in regions.iter().filter(|r| r.size() > 0 && keep(r)) {
        ring.make(region.range(), Some(prov.clone().into()))?;
    }
    Ok(ring)
}

/// Regions of a dump file
pub fn core_ring(regions: &[MemoryRegion]) -> Result<Ring> {
    let ring = tagged(regions, |_| true, Provenance::Core)?;
    info!(spans = ring.len(), bytes = ring.bytes(), "core regions");
    Ok(ring)
}

/// Readable mappings of a live process
pub fn memory_ring(maps: &[MemoryRegion]) -> Result<Ring> {
    // kernel pages refuse plain reads
    let readable = |r: &MemoryRegion| {
        r.is_readable()
            && !matches!(r.entity(), Entity::Special(ref name) if name == "[vvar]" || name == "[vsyscall]")
    };
    let ring = tagged(maps, readable, Provenance::Memory)?;
    info!(spans = ring.len(), bytes = ring.bytes(), "readable memory");
    Ok(ring)
}

/// Every row of the mapping table
pub fn mappings_ring(maps: &[MemoryRegion]) -> Result<Ring> {
    let mut ring = Ring::new();
    for region in maps.iter().filter(|r| r.size() > 0) {
        ring.make(
            region.range(),
            Some(Provenance::Mapping(region.clone()).into()),
        )?;
    }
    Ok(ring)
}

/// Images with at least one executable row, adjacent rows coalesced
pub fn exec_ring(maps: &[MemoryRegion]) -> Result<Ring> {
    let images: HashSet<&str> = maps
        .iter()
        .filter(|r| r.is_executable() && r.is_file())
        .filter_map(|r| r.path.as_deref())
        .collect();

    let mut rows: Vec<&MemoryRegion> = maps
        .iter()
        .filter(|r| r.size() > 0 && r.is_file())
        .filter(|r| r.path.as_deref().map_or(false, |p| images.contains(p)))
        .collect();
    rows.sort_by_key(|r| r.start);

    let mut runs: Vec<(u64, u64, &str)> = Vec::new();
    for row in rows {
        let path = row.path.as_deref().unwrap_or_default();
        match runs.last_mut() {
            Some(run) if run.2 == path && run.1 == row.start => run.1 = row.end,
            _ => runs.push((row.start, row.end, path)),
        }
    }

    let mut ring = Ring::new();
    for (lo, hi, image) in runs {
        let prov = Provenance::Exec {
            image: image.to_string(),
        };
        ring.make(Range::bounded(lo, hi)?, Some(prov.into()))?;
    }

    debug!(images = images.len(), spans = ring.len(), "executable images");
    Ok(ring)
}

/// Thread stacks
///
/// With thread info the physical span holding each stack pointer is split
/// into the free part below `sp` and the used part above it. Without it
/// every `[stack]` mapping is taken as one used stack.
pub fn stack_ring(world: &World, threads: &[Thread]) -> Result<Ring> {
    let mut ring = Ring::new();

    if threads.is_empty() {
        for record in world.by_provider(Provider::Mappings) {
            for span in record.ring().iter() {
                let stack = match span.exten().and_then(Extension::provenance) {
                    Some(Provenance::Mapping(region)) => region.entity() == Entity::Stack,
                    _ => false,
                };
                if stack {
                    let prov = Provenance::Stack {
                        thread: 0,
                        used: true,
                    };
                    ring.make(span.range(), Some(prov.into()))?;
                }
            }
        }
        return Ok(ring);
    }

    let (mut none, mut many, mut shared) = (0usize, 0usize, 0usize);
    for thread in threads {
        let spans: Vec<&Span> = world
            .lookup(thread.sp)
            .into_iter()
            .map(|(_, _, span)| span)
            .filter(|span| is_physical(span))
            .collect();

        let span = match spans.as_slice() {
            [] => {
                none += 1;
                continue;
            }
            [span] => *span,
            _ => {
                many += 1;
                continue;
            }
        };

        let (lo, hi) = match (span.lo(), span.hi()) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => continue,
        };

        for (lo, hi, used) in [(lo, thread.sp, false), (thread.sp, hi, true)] {
            if lo >= hi {
                continue;
            }
            let prov = Provenance::Stack {
                thread: thread.id,
                used,
            };
            match ring.make(Range::bounded(lo, hi)?, Some(prov.into())) {
                Ok(_) => {}
                Err(Error::Conflict { .. }) => shared += 1,
                Err(err) => return Err(err),
            }
        }
    }

    if none + many + shared > 0 {
        warn!(none, many, shared, "stack pointers without a single physical span");
    }

    let used: u64 = ring
        .iter()
        .filter(|s| {
            matches!(
                s.exten().and_then(Extension::provenance),
                Some(Provenance::Stack { used: true, .. })
            )
        })
        .filter_map(|s| s.range().len())
        .sum();
    info!(spans = ring.len(), bytes = ring.bytes(), used, "located stacks");

    Ok(ring)
}
