//! Block based allocator with size classes
//!
//! Small allocations live in 1 MiB blocks above [`START`], each block cut
//! into equal items of the size its index entry names. Large ones are
//! served by dedicated mappings in the huge territory, led by a page
//! holding their page count.

use std::collections::{BTreeSet, HashSet};

use byteorder::{ByteOrder, LE};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::heap::{ChunkInfo, ChunkQuery, Chunks, Heap, Lookup, Relation, Target};
use crate::maps::{Extension, Match, Measure, Pool, PoolKind, Range, Ring, Span};
use crate::source::{MemorySource, SymbolAccessor};
use crate::world::{Provider, World};

pub const PAGE: u64 = 4096;
pub const BLOCKS: u64 = 1024 * 1024;
pub const START: u64 = 0x1_0000_0000;
pub const HUGE: u64 = START + 200 * 0x1_0000_0000;

/// Least page count of a dedicated mapping
const MIN_PAGES: u64 = 8;

const OWNER: &str = "lfalloc";

/// Global array described by a layout of the same name
///
/// The layout size is the array size in bytes, its `item` field gives
/// the element width.
struct Array {
    at: u64,
    item: usize,
    len: usize,
}

impl Array {
    fn locate(symbols: &dyn SymbolAccessor, name: &str) -> Result<Self> {
        let at = symbols.require_addr(name)?;
        let layout = symbols.require(name)?;
        let item = layout.field("item")?.size as usize;
        if !(1..=8).contains(&item) {
            return Err(Error::Symbol(format!("array {} has {} byte items", name, item)));
        }
        Ok(Self {
            at,
            item,
            len: layout.size as usize / item,
        })
    }

    fn signed(&self, reader: &dyn MemorySource) -> Result<Vec<i64>> {
        let bytes = reader.read_bytes(self.at, self.len * self.item)?;
        Ok(bytes.chunks(self.item).map(|x| LE::read_int(x, self.item)).collect())
    }

    fn unsigned(&self, reader: &dyn MemorySource) -> Result<Vec<u64>> {
        let bytes = reader.read_bytes(self.at, self.len * self.item)?;
        Ok(bytes.chunks(self.item).map(|x| LE::read_uint(x, self.item)).collect())
    }
}

/// Bump head of a size class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Head {
    block: Option<u64>,
    at: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    blocks: u64,
    unused: u64,
    free_small: u64,
    free_large: u64,
    huge: u64,
    /// Free list entries outside the small territory
    outside: u64,
    /// Free list entries in a block of another size class
    mismatch: u64,
    /// Free list entries seen twice
    same: u64,
}

pub struct LfAllocHeap {
    seq: usize,
    sizes: Vec<u64>,
    index: Vec<i64>,
    heads: Vec<Head>,
    /// Bytes of a block covered by whole items, per size class
    useful: Vec<u64>,
    small: (u64, u64),
    huge: (u64, u64),
    upper: Option<u64>,
    free: BTreeSet<u64>,
    counters: Counters,
}

impl LfAllocHeap {
    pub fn discover(target: &Target<'_>, world: &mut World) -> Result<Self> {
        let (reader, symbols) = (target.reader, target.symbols);
        let word = target.config.word_size;

        let sizes: Vec<u64> = Array::locate(symbols, "nSizeIdxToSize")?
            .signed(reader)?
            .into_iter()
            .map(|size| size.max(0) as u64)
            .collect();
        if sizes.len() < 2 {
            return Err(Error::analysis("lfalloc size table is empty"));
        }
        let index = Array::locate(symbols, "chunkSizeIdx")?.signed(reader)?;
        if let Some(bad) = index.iter().find(|&&x| x < -1 || x >= sizes.len() as i64) {
            return Err(Error::analysis(format!("lfalloc size index {} is out of range", bad)));
        }

        let small_end = reader.read_word(symbols.require_addr("linuxAllocPointer")?, word)?;
        let huge_end = reader.read_word(symbols.require_addr("linuxAllocPointerHuge")?, word)?;

        let mut heap = Self {
            seq: 0,
            useful: sizes
                .iter()
                .map(|&size| if size > 0 { BLOCKS / size * size } else { 0 })
                .collect(),
            sizes,
            index,
            heads: Vec::new(),
            small: (START, small_end),
            huge: (HUGE, huge_end),
            upper: None,
            free: BTreeSet::new(),
            counters: Counters::default(),
        };
        heap.heads = Array::locate(symbols, "globalCurrentPtr")?
            .unsigned(reader)?
            .into_iter()
            .map(|at| Head {
                block: heap.block_for(at),
                at,
            })
            .collect();

        info!(
            small = format_args!("{:#x}..{:#x}", heap.small.0, heap.small.1),
            huge = format_args!("{:#x}..{:#x}", heap.huge.0, heap.huge.1),
            classes = heap.sizes.len(),
            "lfalloc territories"
        );

        let mut ring = heap.small_spans()?;
        heap.free_small(target)?;
        heap.free_large(target, &mut ring)?;

        heap.seq = world.push(OWNER, ring, Provider::Heap, true)?;
        heap.used_huge(target, world)?;

        let c = heap.counters;
        info!(
            blocks = c.blocks,
            unused = c.unused,
            free_small = c.free_small,
            free_large = c.free_large,
            huge = c.huge,
            "lfalloc heap resolved"
        );
        if c.outside + c.mismatch + c.same > 0 {
            warn!(
                outside = c.outside,
                mismatch = c.mismatch,
                same = c.same,
                "lfalloc free lists are inconsistent"
            );
        }
        Ok(heap)
    }

    fn block_for(&self, at: u64) -> Option<u64> {
        (self.small.0 <= at && at < self.small.1).then_some(at / BLOCKS)
    }

    fn index_at(&self, block: u64) -> i64 {
        self.index.get(block as usize).copied().unwrap_or(0)
    }

    /// Size and granularity of a size class
    fn granz(&self, index: usize) -> (u64, u64) {
        let size = self.sizes[index];
        let prev = if index > 1 { self.sizes[index - 1] } else { 0 };
        (size, size - prev.min(size))
    }

    /// Item size a request of `size` bytes is served with
    fn round(&self, size: u64) -> u64 {
        match self.sizes.iter().skip(1).find(|&&s| size <= s) {
            Some(&s) => s,
            None => (size + PAGE - 1) & !(PAGE - 1),
        }
    }

    fn largest(&self) -> u64 {
        self.sizes.last().copied().unwrap_or(0)
    }

    /// One span per run of blocks with a non-zero size index
    fn small_spans(&mut self) -> Result<Ring> {
        let mut ring = Ring::new();
        let mut run: Option<u64> = None;

        let pool = || Some(Extension::from(Pool { kind: PoolKind::Small }));
        for (block, &index) in self.index.iter().enumerate() {
            let block = block as u64;
            match (index != 0, run) {
                (true, None) => run = Some(block),
                (false, Some(first)) => {
                    ring.make(Range::bounded(first * BLOCKS, block * BLOCKS)?, pool())?;
                    run = None;
                }
                _ => {}
            }
            if index != 0 {
                self.upper = Some(block);
                self.counters.blocks += 1;
            }
            if index < 0 {
                self.counters.unused += 1;
            }
        }
        if let Some(first) = run {
            let end = self.index.len() as u64 * BLOCKS;
            ring.make(Range::bounded(first * BLOCKS, end)?, pool())?;
        }

        debug!(
            upper = ?self.upper.map(|b| format!("{:#x}", b * BLOCKS)),
            spans = ring.len(),
            "small blocks mapped"
        );
        Ok(ring)
    }

    fn push_small(&mut self, index: usize, at: u64) {
        if at == 0 {
            return;
        }
        match self.block_for(at).map(|block| self.index_at(block)) {
            None => self.counters.outside += 1,
            Some(actual) if actual != index as i64 => self.counters.mismatch += 1,
            Some(_) => {
                if self.free.insert(at) {
                    self.counters.free_small += 1;
                } else {
                    self.counters.same += 1;
                }
            }
        }
    }

    /// Chunks parked in the free vectors of every thread
    fn free_small(&mut self, target: &Target<'_>) -> Result<()> {
        let (reader, symbols) = (target.reader, target.symbols);
        let word = target.config.word_size as u64;

        let (list, info) = match (symbols.addr("pThreadInfoList"), symbols.resolve("ThreadInfo")) {
            (Some(list), Some(info)) => (list, info),
            _ => {
                debug!("no thread free vectors to walk");
                return Ok(());
            }
        };
        let classes = self.sizes.len() as u64;
        let ptrs = info.field("FreePtrs")?;
        let level = info.field("FreePtrIndex")?;
        let next = info.offset("pNextInfo")?;

        let slots = ptrs.size / word / classes;
        let width = (level.size / classes) as usize;
        if slots == 0 || !(1..=8).contains(&width) {
            return Err(Error::Symbol("ThreadInfo free vectors have no room".to_string()));
        }

        let mut seen = HashSet::new();
        let mut tls = reader.read_word(list, word as usize)?;
        while tls != 0 && seen.insert(tls) {
            target.interrupt.check()?;

            let bytes = reader.read_bytes(tls + level.offset, width * classes as usize)?;
            let levels: Vec<i64> = bytes.chunks(width).map(|x| LE::read_int(x, width)).collect();

            for (index, &lv) in levels.iter().enumerate().skip(1) {
                let base = tls + ptrs.offset + index as u64 * slots * word;
                for z in lv.max(0) as u64..slots {
                    let at = reader.read_word(base + z * word, word as usize)?;
                    self.push_small(index, at);
                }
            }
            tls = reader.read_word(tls + next, word as usize)?;
        }

        debug!(threads = seen.len(), chunks = self.free.len(), "thread free vectors walked");
        Ok(())
    }

    /// Dedicated mapping starting at `lo` within a place ending at `hi`
    fn decode(&self, reader: &dyn MemorySource, word: usize, lo: u64, hi: u64) -> Option<Range> {
        if lo & (PAGE - 1) != 0 || hi.saturating_sub(lo) <= MIN_PAGES * PAGE {
            return None;
        }
        let pages = reader.read_word(lo, word).ok()?;
        let capacity = (hi - lo) / PAGE;
        if pages > MIN_PAGES && pages < capacity {
            Range::bounded(lo, lo + (pages + 1) * PAGE).ok()
        } else {
            None
        }
    }

    /// Released large blocks listed in `lbFreePtrs`
    fn free_large(&mut self, target: &Target<'_>, ring: &mut Ring) -> Result<()> {
        let word = target.config.word_size;
        let mut listed = Array::locate(target.symbols, "lbFreePtrs")?.unsigned(target.reader)?;
        listed.retain(|&at| at > PAGE);
        listed.sort_unstable();
        listed.dedup();

        let pool = Pool { kind: PoolKind::Free };
        for at in listed {
            target.interrupt.check()?;
            let block = match self.decode(target.reader, word, at - PAGE, self.huge.1) {
                Some(block) => block,
                None => {
                    debug!(at = format_args!("{:#x}", at), "free large block does not decode");
                    continue;
                }
            };
            match ring.make(block, Some(pool.into())) {
                Ok(_) => self.counters.free_large += 1,
                Err(err) => debug!(block = %block, "free large block skipped: {}", err),
            }
        }
        Ok(())
    }

    /// Used dedicated mappings found in unclaimed huge territory
    fn used_huge(&mut self, target: &Target<'_>, world: &mut World) -> Result<()> {
        let word = target.config.word_size;
        let territory = Range::bounded(self.huge.0, self.huge.1.max(self.huge.0))?;
        let places: Vec<Range> = world
            .physical(territory, &[self.seq], false)
            .map(|(place, _)| place)
            .collect();

        let mut found: Vec<Range> = Vec::new();
        for place in places {
            let (mut caret, hi) = match (place.lo(), place.hi()) {
                (Some(lo), Some(hi)) => (lo, hi),
                _ => continue,
            };
            while caret < hi {
                target.interrupt.check()?;
                caret = match self.decode(target.reader, word, caret, hi) {
                    Some(block) => {
                        let end = block.hi().unwrap_or(hi);
                        found.push(block);
                        (end + PAGE - 1) & !(PAGE - 1)
                    }
                    None => (caret + PAGE) & !(PAGE - 1),
                };
            }
        }

        let ring = world
            .ring_mut(self.seq)
            .ok_or_else(|| Error::analysis("lfalloc heap ring is gone"))?;
        let start = Measure::start(ring);
        let mut trans = ring.begin();
        for block in found {
            trans.make(block, Some(Pool { kind: PoolKind::Huge }.into()))?;
        }
        trans.commit(ring)?;
        let delta = start.finish(ring);

        self.counters.huge = delta.count.max(0) as u64;
        debug!(blocks = delta.count, bytes = delta.bytes, "used huge blocks");
        Ok(())
    }

    fn lookup_small(&self, at: u64) -> Lookup {
        let block = at / BLOCKS;
        let base = block * BLOCKS;
        let index = self.index_at(block);

        if self.upper.map_or(true, |upper| block > upper) || index == 0 {
            return Lookup::new(Relation::Zero, base, at, BLOCKS, None);
        }
        if index < 0 {
            return Lookup::new(Relation::Keep, base, at, BLOCKS, None);
        }

        let index = index as usize;
        let (size, gran) = self.granz(index);
        let chunk = base + (at - base) / size * size;
        let head = self.heads.get(index);

        if head.map_or(false, |h| h.block == Some(block) && at >= h.at) {
            Lookup::new(Relation::Zero, chunk, at, size, None)
        } else if chunk - base >= self.useful[index] {
            let waste = base + self.useful[index];
            Lookup::new(Relation::Waste, waste, at, BLOCKS - self.useful[index], Some(gran))
        } else if self.free.contains(&chunk) {
            Lookup::new(Relation::Free, chunk, at, size, Some(gran))
        } else {
            Lookup::new(Relation::Chunk, chunk, at, size, Some(gran))
        }
    }

    /// Whole dedicated block, the payload follows the header page
    fn huge_meta(span: &Span) -> Option<(Relation, u64, u64)> {
        let relation = match span.exten()?.pool()?.kind {
            PoolKind::Huge => Relation::Huge,
            PoolKind::Free => Relation::Free,
            PoolKind::Small => return None,
        };
        let lo = span.lo()?;
        let len = span.range().len()?;
        Some((relation, lo + PAGE, len.saturating_sub(PAGE)))
    }

    /// Items handed out from one block, clipped to `range`
    fn block_items<'a>(&'a self, block: u64, range: Range) -> impl Iterator<Item = ChunkInfo> + 'a {
        let index = self.index_at(block);
        let (index, live) = if index > 0 { (index as usize, true) } else { (0, false) };
        let (size, gran) = if live { self.granz(index) } else { (1, 0) };

        let base = block * BLOCKS;
        let mut end = if live { base + self.useful[index] } else { base };
        if let Some(head) = self.heads.get(index).filter(|h| live && h.block == Some(block)) {
            end = end.min(head.at);
        }

        let first = match range.lo() {
            Some(lo) if lo > base => base + (lo - base).div_ceil(size) * size,
            _ => base,
        };
        let end = range.hi().map_or(end, |hi| end.min(hi));

        (first..end)
            .step_by(size as usize)
            .filter(move |caret| !self.free.contains(caret))
            .map(move |at| ChunkInfo {
                relation: Relation::Chunk,
                at,
                size,
                granularity: gran,
            })
    }
}

impl Heap for LfAllocHeap {
    fn name(&self) -> &'static str {
        OWNER
    }

    fn ring(&self) -> usize {
        self.seq
    }

    fn lookup(&self, _target: &Target<'_>, world: &World, at: u64) -> Result<Lookup> {
        let ring = world
            .ring(self.seq)
            .ok_or_else(|| Error::analysis("lfalloc heap ring is not registered"))?;

        let span = match ring.lookup(at, false) {
            Some((Match::Exact, span)) => span,
            _ => return Ok(Lookup::out_of()),
        };
        match span.exten().and_then(Extension::pool).map(|p| p.kind) {
            Some(PoolKind::Small) => Ok(self.lookup_small(at)),
            Some(_) => Ok(Self::huge_meta(span)
                .map(|(relation, chunk, size)| Lookup::new(relation, chunk, at, size, Some(PAGE)))
                .unwrap_or_else(Lookup::out_of)),
            None => Ok(Lookup::out_of()),
        }
    }

    fn chunks<'a>(&'a self, target: Target<'a>, world: &'a World, query: &ChunkQuery) -> Chunks<'a> {
        let ring = match world.ring(self.seq) {
            Some(ring) => ring,
            None => return Box::new(std::iter::empty()),
        };
        let filter = query.size.prepare(|size| self.round(size));
        let range = query.range;
        let boundary = self.largest() + 1;

        let small = query.wants_small()
            && filter.precheck(&Range::bounded(0, boundary).unwrap_or(Range::WILD));
        let huge = query.wants_huge()
            && filter.precheck(&Range::new(Some(boundary), None).unwrap_or(Range::WILD));

        Box::new(ring.spans(&range).flat_map(move |span| -> Chunks<'a> {
            let kind = span.exten().and_then(Extension::pool).map(|p| p.kind);
            match kind {
                Some(PoolKind::Small) if small => {
                    let place = match span.range().intersect(&range) {
                        Some(place) => place,
                        None => return Box::new(std::iter::empty()),
                    };
                    let (lo, hi) = match (place.lo(), place.hi()) {
                        (Some(lo), Some(hi)) => (lo, hi),
                        _ => return Box::new(std::iter::empty()),
                    };
                    let filter = filter.clone();
                    Box::new(
                        (lo / BLOCKS..hi.div_ceil(BLOCKS))
                            .map(move |block| target.interrupt.check().map(|_| block))
                            .flat_map(move |block| -> Chunks<'a> {
                                match block {
                                    Ok(block) => Box::new(self.block_items(block, place).map(Ok)),
                                    Err(err) => Box::new(std::iter::once(Err(err))),
                                }
                            })
                            .filter(move |chunk| {
                                chunk.as_ref().map_or(true, |c| filter.matches(c.size))
                            }),
                    )
                }
                Some(PoolKind::Huge) if huge => {
                    let info = Self::huge_meta(span)
                        .map(|(relation, at, size)| ChunkInfo {
                            relation,
                            at,
                            size,
                            granularity: PAGE,
                        })
                        .filter(|c| range.contains(c.at) && filter.matches(c.size));
                    Box::new(info.into_iter().map(Ok))
                }
                _ => Box::new(std::iter::empty()),
            }
        }))
    }

    fn stats(&self) -> Vec<(&'static str, u64)> {
        let c = self.counters;
        vec![
            ("blocks", c.blocks),
            ("unused_blocks", c.unused),
            ("free_small", c.free_small),
            ("free_large", c.free_large),
            ("huge", c.huge),
            ("bad_free", c.outside + c.mismatch + c.same),
        ]
    }
}
