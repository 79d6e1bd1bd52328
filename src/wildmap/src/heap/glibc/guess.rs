//! Heuristics claiming heap memory the arenas do not describe

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::chunk::{left_probe, Chunk};
use super::scale::{Scale, MMAPPED, NON_MAIN_ARENA};
use crate::error::{Error, Result};
use crate::heap::Target;
use crate::maps::{Delta, Exten, Extension, Fragment, FragmentKind, Measure, Range, Ring, Span};
use crate::world::{Provider, World};

/// Chains of chunks found walking backwards from a known chunk start
///
/// Every linked node is a chunk start whose chunk ends exactly at its
/// parent. A node with several children means the chain is ambiguous.
#[derive(Debug, Clone)]
pub struct PredecessorTree {
    root: u64,
    last: u64,
    links: BTreeMap<u64, Vec<u64>>,
}

impl PredecessorTree {
    pub fn new(root: u64) -> Self {
        let mut links = BTreeMap::new();
        links.insert(root, Vec::new());
        Self {
            root,
            last: root,
            links,
        }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Lowest node linked so far
    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Link a chunk of `size` bytes at `at` when it ends at a known node
    pub fn offer(&mut self, at: u64, size: u64) -> bool {
        let end = match at.checked_add(size) {
            Some(end) => end,
            None => return false,
        };

        match self.links.get_mut(&end) {
            Some(children) => {
                children.push(at);
                self.links.entry(at).or_default();
                self.last = self.last.min(at);
                true
            }
            None => false,
        }
    }

    /// Unambiguous chain from the root, nearest node first
    pub fn chain(&self) -> Vec<u64> {
        let mut chain = Vec::new();
        let mut at = self.root;
        while let Some([only]) = self.links.get(&at).map(Vec::as_slice) {
            chain.push(*only);
            at = *only;
        }
        chain
    }

    /// Lowest address reachable without a branch
    pub fn resolve(&self) -> u64 {
        self.chain().last().copied().unwrap_or(self.root)
    }
}

/// Rings whose bytes are already owned, mmapped chunks are not searched there
fn owned(world: &World) -> Vec<usize> {
    world
        .records()
        .iter()
        .filter(|r| matches!(r.provider(), Provider::Heap | Provider::Stack))
        .map(|r| r.seq())
        .collect()
}

fn commit(world: &mut World, seq: usize, spans: Vec<Span>) -> Result<Delta> {
    let ring = world
        .ring_mut(seq)
        .ok_or_else(|| Error::analysis(format!("heap ring {} is gone", seq)))?;

    let start = Measure::start(ring);
    let mut trans = ring.begin();
    for span in spans {
        trans.push(span)?;
    }
    trans.commit(ring)?;
    Ok(start.finish(ring))
}

/// Chunks chained backwards from `start` over the unclaimed memory below it
///
/// The walk stays inside the gap `ring` leaves left of `start` and inside
/// the readable run ending there, at most `left_extend` bytes deep.
/// Mmapped, foreign arena and oversized candidates are never linked.
pub fn walk_left(
    target: &Target<'_>,
    sc: Scale,
    world: &World,
    ring: &Ring,
    start: u64,
) -> Option<PredecessorTree> {
    let limit = target.config.left_extend;
    let max_chunk = target.config.max_chunk;

    let room = ring.wider(&Range::at(start.checked_sub(1)?))?;
    let run = world
        .physical(room, &[], false)
        .map(|(run, _)| run)
        .find(|run| run.hi() == Some(start))?;
    let floor = run.lo()?.max(start.saturating_sub(limit));

    let mut tree = PredecessorTree::new(start);
    for chunk in left_probe(target.reader, sc, start, floor) {
        if tree.last() - chunk.at > limit {
            break;
        }
        if chunk.flag(MMAPPED | NON_MAIN_ARENA) || chunk.size() > max_chunk {
            continue;
        }
        tree.offer(chunk.at, chunk.size());
    }
    Some(tree)
}

/// Grow scattered fragments to the left over unclaimed readable memory
pub fn left_extend(target: &Target<'_>, sc: Scale, world: &mut World, seq: usize) -> Result<Delta> {
    let ring = world
        .ring(seq)
        .ok_or_else(|| Error::analysis(format!("heap ring {} is gone", seq)))?;

    let mut found: Vec<Span> = Vec::new();
    for span in ring.iter() {
        target.interrupt.check()?;

        let frag = match span.exten().and_then(Extension::fragment) {
            Some(frag) if frag.kind == FragmentKind::Frag => frag,
            _ => continue,
        };
        let start = match span.lo() {
            Some(start) => start,
            None => continue,
        };
        let tree = match walk_left(target, sc, world, ring, start) {
            Some(tree) => tree,
            None => continue,
        };

        let left = tree.resolve();
        if left >= start {
            continue;
        }

        let range = Range::bounded(left, start)?;
        let mut piece = Fragment::new(frag.arena, FragmentKind::Left, range);
        for at in tree.chain() {
            piece.alias.push(at)?;
        }
        debug!(
            from = format_args!("{:#x}", start),
            to = format_args!("{:#x}", left),
            chunks = tree.chain().len(),
            "fragment extended left"
        );
        found.push(Span::new(range, Some(piece.into()))?);
    }

    commit(world, seq, found)
}

/// Page aligned chunks served by mmap() inside `place`
///
/// A candidate overlapping the previous one drops both. Accepted blocks
/// are returned in address order.
fn mmapped_blocks(target: &Target<'_>, sc: Scale, place: Range) -> Result<Vec<Range>> {
    let (lo, hi) = match (place.lo(), place.hi()) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => return Ok(Vec::new()),
    };
    let page = target.config.page_size;
    let mask = page - 1;

    let mut blocks = Vec::new();
    let mut last: Option<Range> = None;
    let mut thresh = lo;
    let mut at = (lo + mask) & !mask;

    while at < hi {
        target.interrupt.check()?;

        if let Ok(chunk) = Chunk::checked(target.reader, sc, at, false) {
            let end = chunk.end();
            if chunk.flag(MMAPPED) && end > at && end <= hi {
                if thresh <= at {
                    blocks.extend(last.take());
                    last = Some(Range::bounded(at, end)?);
                } else {
                    last = None;
                }
                thresh = thresh.max(last.and_then(|r| r.hi()).unwrap_or(thresh));
            }
        }
        at += page;
    }
    blocks.extend(last);

    Ok(blocks)
}

/// Claim chunks served directly by mmap() in unowned readable memory
pub fn mmap_search(target: &Target<'_>, sc: Scale, world: &mut World, seq: usize) -> Result<Delta> {
    let exclude = owned(world);
    let places: Vec<Range> = world
        .physical(Range::WILD, &exclude, false)
        .map(|(place, _)| place)
        .filter(|place| place.len().map_or(false, |len| len > target.config.mmap_scan))
        .collect();

    let mut found: Vec<Span> = Vec::new();
    for place in places {
        let blocks = mmapped_blocks(target, sc, place)?;

        let mut runs: Vec<(u64, u64, Vec<u64>)> = Vec::new();
        for block in blocks {
            let (lo, hi) = match (block.lo(), block.hi()) {
                (Some(lo), Some(hi)) => (lo, hi),
                _ => continue,
            };
            match runs.last_mut() {
                Some(run) if run.1 == lo => {
                    run.1 = hi;
                    run.2.push(lo);
                }
                _ => runs.push((lo, hi, vec![lo])),
            }
        }

        for (lo, hi, starts) in runs {
            let range = Range::bounded(lo, hi)?;
            let mut frag = Fragment::new(None, FragmentKind::Mmapped, range);
            for at in starts {
                frag.alias.push(at)?;
            }
            debug!(fragment = %frag.describe(), range = %range, "mmapped chunks");
            found.push(Span::new(range, Some(frag.into()))?);
        }
    }

    commit(world, seq, found)
}

/// Run every heuristic, failures only cost what they would have found
pub fn run_all(target: &Target<'_>, sc: Scale, world: &mut World, seq: usize) -> Result<u64> {
    type Heuristic = fn(&Target<'_>, Scale, &mut World, usize) -> Result<Delta>;
    let heuristics: [(&str, Heuristic); 2] = [("left", left_extend), ("mmaps", mmap_search)];

    let mut total = 0u64;
    for (name, heuristic) in heuristics {
        match heuristic(target, sc, world, seq) {
            Ok(delta) => {
                info!(
                    heuristic = name,
                    bytes = delta.bytes,
                    fragments = delta.count,
                    "heuristic claimed heap memory"
                );
                total += delta.bytes.max(0) as u64;
            }
            Err(Error::Interrupted) => return Err(Error::Interrupted),
            Err(err) => warn!(heuristic = name, "heuristic found nothing: {}", err),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressModel, AnalysisConfig};
    use crate::heap::Interrupt;
    use crate::source::{MockMemorySource, SymbolTable};
    use crate::world::{core_ring, AddressSet};

    const LO: u64 = 0x10000;
    const FRAG: u64 = 0x11000;

    type Piece = (Range, FragmentKind, Vec<u64>);

    /// Grow a lone fragment at FRAG over the size fields written below it
    fn extend_left(sizes: &[(u64, u64)], config: AnalysisConfig) -> (Delta, Vec<Piece>) {
        let mut mem = MockMemorySource::empty().with_block(LO, 0x2000);
        for &(at, raw) in sizes {
            mem.write_word(at + 4, 4, raw);
        }

        let symbols = SymbolTable::glibc(4);
        let addrs = AddressSet::default();
        let interrupt = Interrupt::new();
        let target = Target {
            reader: &mem,
            symbols: &symbols,
            validator: &addrs,
            config: &config,
            interrupt: &interrupt,
        };

        let range = Range::bounded(FRAG, FRAG + 0x100).unwrap();
        let mut ring = Ring::new();
        let frag = Fragment::new(Some(0), FragmentKind::Frag, range);
        ring.push(Span::new(range, Some(frag.into())).unwrap()).unwrap();

        let mut world = World::new(AddressModel::Basic);
        world
            .push("core", core_ring(&mem.regions).unwrap(), Provider::Core, true)
            .unwrap();
        let seq = world.push("glibc", ring, Provider::Heap, true).unwrap();

        let delta = left_extend(&target, Scale::new(4).unwrap(), &mut world, seq).unwrap();
        let pieces = world
            .ring(seq)
            .unwrap()
            .iter()
            .map(|span| {
                let frag = span.exten().and_then(Extension::fragment).unwrap();
                (span.range(), frag.kind, frag.alias.points().to_vec())
            })
            .collect();
        (delta, pieces)
    }

    fn small() -> AnalysisConfig {
        AnalysisConfig {
            word_size: 4,
            ..AnalysisConfig::default()
        }
    }

    fn left_piece(pieces: &[Piece]) -> Option<&Piece> {
        pieces.iter().find(|p| p.1 == FragmentKind::Left)
    }

    #[test]
    fn test_left_extend_claims_chain() {
        let (delta, pieces) = extend_left(&[(0x10f00, 0x101), (0x10e00, 0x101)], small());

        assert_eq!(delta, Delta { count: 1, bytes: 0x200 });
        assert_eq!(
            pieces,
            vec![
                (Range::bounded(0x10e00, FRAG).unwrap(), FragmentKind::Left, vec![0x10e00, 0x10f00]),
                (Range::bounded(FRAG, FRAG + 0x100).unwrap(), FragmentKind::Frag, vec![]),
            ]
        );
    }

    #[test]
    fn test_left_extend_skips_foreign_chunks() {
        let chain = [(0x10f00, 0x101), (0x10e00, 0x101)];
        // each would end exactly at 0x10e00
        for foreign in [(0x10d00, 0x103), (0x10d00, 0x105)] {
            let (_, pieces) = extend_left(&[chain[0], chain[1], foreign], small());
            let left = left_piece(&pieces).unwrap();
            assert_eq!(left.0, Range::bounded(0x10e00, FRAG).unwrap());
        }

        let huge = (LO, 0xe01);
        let capped = AnalysisConfig {
            max_chunk: 0x800,
            ..small()
        };
        let (_, pieces) = extend_left(&[chain[0], chain[1], huge], capped);
        assert_eq!(left_piece(&pieces).unwrap().0, Range::bounded(0x10e00, FRAG).unwrap());

        // down to the bottom of the readable run
        let (delta, pieces) = extend_left(&[chain[0], chain[1], huge], small());
        assert_eq!(left_piece(&pieces).unwrap().0, Range::bounded(LO, FRAG).unwrap());
        assert_eq!(delta.bytes, 0x1000);
    }

    #[test]
    fn test_left_extend_depth_limited() {
        let config = AnalysisConfig {
            left_extend: 0x180,
            ..small()
        };
        let (delta, pieces) = extend_left(&[(0x10f00, 0x101), (0x10e00, 0x101)], config);

        assert_eq!(delta, Delta { count: 1, bytes: 0x100 });
        let left = left_piece(&pieces).unwrap();
        assert_eq!(left.0, Range::bounded(0x10f00, FRAG).unwrap());
        assert_eq!(left.2, vec![0x10f00]);
    }

    #[test]
    fn test_left_extend_stops_at_branch() {
        // 0x10e00 and 0x10e80 both end at 0x10f00
        let sizes = [(0x10f00, 0x101), (0x10e80, 0x81), (0x10e00, 0x101)];
        let (delta, pieces) = extend_left(&sizes, small());

        assert_eq!(delta.bytes, 0x100);
        assert_eq!(left_piece(&pieces).unwrap().0, Range::bounded(0x10f00, FRAG).unwrap());
    }

    #[test]
    fn test_left_extend_without_chunks() {
        let (delta, pieces) = extend_left(&[], small());
        assert_eq!(delta, Delta::default());
        assert!(left_piece(&pieces).is_none());
    }

    #[test]
    fn test_tree_single_chain() {
        let mut tree = PredecessorTree::new(0x1000);
        assert!(tree.offer(0xfe0, 0x20));
        assert!(!tree.offer(0xf00, 0x20));
        assert!(tree.offer(0xfc0, 0x20));
        assert!(tree.offer(0xf00, 0xc0));

        assert_eq!(tree.chain(), vec![0xfe0, 0xfc0, 0xf00]);
        assert_eq!(tree.resolve(), 0xf00);
        assert_eq!(tree.last(), 0xf00);
    }

    #[test]
    fn test_tree_stops_at_branch() {
        let mut tree = PredecessorTree::new(0x1000);
        assert!(tree.offer(0xfe0, 0x20));
        // two candidates both end at 0xfe0
        assert!(tree.offer(0xfd0, 0x10));
        assert!(tree.offer(0xfc0, 0x20));
        assert!(tree.offer(0xfa0, 0x20));

        assert_eq!(tree.chain(), vec![0xfe0]);
        assert_eq!(tree.resolve(), 0xfe0);
        assert_eq!(tree.last(), 0xfa0);
    }

    #[test]
    fn test_overlapping_mmaps_dropped() {
        let mut mem = MockMemorySource::empty().with_block(0x10000, 0x10000);
        // 0x11000 claims three pages, 0x12000 starts inside it
        mem.write_word(0x11004, 4, 0x3002);
        mem.write_word(0x12004, 4, 0x1002);
        mem.write_word(0x15004, 4, 0x2002);

        let symbols = SymbolTable::glibc(4);
        let addrs = AddressSet::default();
        let config = AnalysisConfig::default();
        let interrupt = Interrupt::new();
        let target = Target {
            reader: &mem,
            symbols: &symbols,
            validator: &addrs,
            config: &config,
            interrupt: &interrupt,
        };

        let sc = Scale::new(4).unwrap();
        let blocks = mmapped_blocks(&target, sc, Range::bounded(0x10000, 0x20000).unwrap()).unwrap();
        assert_eq!(blocks, vec![Range::bounded(0x15000, 0x17000).unwrap()]);
    }

    #[test]
    fn test_tree_empty() {
        let tree = PredecessorTree::new(0x1000);
        assert_eq!(tree.resolve(), 0x1000);
        assert!(tree.chain().is_empty());
        assert_eq!(tree.len(), 1);
    }
}
