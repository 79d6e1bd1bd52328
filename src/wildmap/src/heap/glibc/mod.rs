//! glibc ptmalloc heap
//!
//! Arenas are found from `main_arena` through their `next` links. Each
//! arena's free lists mark alias points in a "wild" span covering the
//! memory it may own, then the wild is walked chunk by chunk and cut into
//! heap fragments. Heuristics registered afterwards claim chunks served
//! by mmap() and scattered main arena memory left of known fragments.

pub mod arena;
pub mod chunk;
pub mod guess;
pub mod scale;

pub use arena::{Arena, ArenaState, Layout};
pub use guess::PredecessorTree;
pub use scale::Scale;

use tracing::{debug, info, warn};

use self::arena::Ctx;
use self::chunk::{Chunk, Regular};
use crate::error::{Error, Result};
use crate::heap::{ChunkInfo, ChunkQuery, Chunks, Heap, Lookup, Relation, Target};
use crate::maps::{Extension, FragmentKind, Match, Near, Range, Ring, Span};
use crate::source::StructLayout;
use crate::world::{Provider, World};

const OWNER: &str = "glibc";

/// Allocator wide counters of `mp_`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmapStats {
    pub n_mmaps: u64,
    pub mmapped_mem: u64,
    pub mmap_threshold: u64,
    pub dynamic: bool,
}

pub struct GlibcHeap {
    seq: usize,
    sc: Scale,
    arenas: Vec<Arena>,
    mmaps: MmapStats,
    guessed: u64,
}

impl GlibcHeap {
    /// Rebuild every arena and register the heap ring
    pub fn discover(target: &Target<'_>, world: &mut World) -> Result<Self> {
        let sc = Scale::new(target.config.word_size)?;
        let symbols = target.symbols;

        let state = symbols.require("malloc_state")?;
        let heap_info = symbols.require("heap_info")?;
        let par = symbols.require("malloc_par")?;
        let main = symbols.require_addr("main_arena")?;
        let mp = symbols.require_addr("mp_")?;

        let sbrk_base = target
            .reader
            .read_word(mp + par.offset("sbrk_base")?, sc.width())?;

        let ctx = Ctx {
            reader: target.reader,
            validator: target.validator,
            interrupt: target.interrupt,
            sc,
            state: &state,
            heap_info: &heap_info,
            sbrk_base,
        };

        info!(
            main_arena = format_args!("{:#x}", main),
            sbrk_base = format_args!("{:#x}", sbrk_base),
            word = sc.word(),
            "building glibc arena list"
        );

        let mut ring = Ring::new();
        let mut arenas: Vec<Arena> = Vec::new();
        let mut at = main;
        loop {
            target.interrupt.check()?;
            if !target.validator.is_plausible(at) {
                return Err(Error::analysis(format!("arena pointer {:#x} refers to nowhere", at)));
            }

            let next = Arena::read_next(&ctx, at)?;
            let mut arena = Arena::new(arenas.len(), at);
            arena.reconstruct(&ctx, &mut ring)?;
            arenas.push(arena);

            if arenas.iter().any(|a| a.at == next) {
                break;
            }
            at = next;
        }

        let damaged = arenas.iter().filter(|a| !a.is_ready()).count();
        info!(arenas = arenas.len(), damaged, "glibc arenas discovered");
        if damaged == arenas.len() {
            return Err(Error::analysis("every glibc arena is damaged"));
        }

        let seq = world.push(OWNER, ring, Provider::Heap, true)?;
        let guessed = guess::run_all(target, sc, world, seq)?;

        let mut heap = Self {
            seq,
            sc,
            arenas,
            mmaps: MmapStats::default(),
            guessed,
        };
        heap.examine_mmaps(target, world, mp, &par);
        Ok(heap)
    }

    fn examine_mmaps(&mut self, target: &Target<'_>, world: &World, mp: u64, par: &StructLayout) {
        let sc = self.sc;
        let read = || -> Result<MmapStats> {
            Ok(MmapStats {
                n_mmaps: u64::from(target.reader.read_u32(mp + par.offset("n_mmaps")?)?),
                mmapped_mem: target
                    .reader
                    .read_word(mp + par.offset("mmapped_mem")?, sc.width())?,
                mmap_threshold: target
                    .reader
                    .read_word(mp + par.offset("mmap_threshold")?, sc.width())?,
                dynamic: target.reader.read_u32(mp + par.offset("no_dyn_threshold")?)? == 0,
            })
        };

        let stats = match read() {
            Ok(stats) => stats,
            Err(err) => {
                warn!("cannot read mmap statistics: {}", err);
                return;
            }
        };
        self.mmaps = stats;

        info!(
            threshold = stats.mmap_threshold,
            dynamic = stats.dynamic,
            "mmap() threshold"
        );
        if stats.mmapped_mem == 0 && stats.n_mmaps == 0 {
            return;
        }

        let found: u64 = world
            .ring(self.seq)
            .map(|ring| {
                ring.iter()
                    .filter(|s| kind_of(s) == Some(FragmentKind::Mmapped))
                    .filter_map(|s| s.range().len())
                    .sum()
            })
            .unwrap_or(0);

        let status = if found == stats.mmapped_mem {
            "all known".to_string()
        } else if found == 0 {
            "all unknown".to_string()
        } else if found > stats.mmapped_mem {
            format!("{} bytes over", found - stats.mmapped_mem)
        } else {
            format!("{} bytes unknown", stats.mmapped_mem - found)
        };
        info!(
            mmapped = stats.mmapped_mem,
            mmaps = stats.n_mmaps,
            found,
            "heap mmap() regions: {}",
            status
        );
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    pub fn scale(&self) -> Scale {
        self.sc
    }

    pub fn mmap_stats(&self) -> MmapStats {
        self.mmaps
    }

    fn top_of(&self, span: &Span) -> Option<u64> {
        let arena = span.exten()?.fragment()?.arena?;
        self.arenas.get(arena)?.top.map(|top| top.at)
    }

    fn is_free(&self, span: &Span, at: u64) -> bool {
        span.exten()
            .and_then(Extension::fragment)
            .and_then(|frag| frag.arena)
            .and_then(|arena| self.arenas.get(arena))
            .map_or(false, |arena| arena.free.binary_search(&at).is_ok())
    }

    fn lookup_in(&self, target: &Target<'_>, span: &Span, at: u64) -> Result<Lookup> {
        let sc = self.sc;
        let alias = match span.exten().and_then(Extension::alias) {
            Some(alias) => alias,
            None => return Ok(Lookup::out_of()),
        };
        let start = match alias.lookup(at, Near::Before)? {
            Some(start) => start,
            None => return Ok(Lookup::out_of()),
        };
        debug!(
            alias = format_args!("{:#x}", start),
            distance = at - start,
            "heap lookup starts"
        );

        let mmapped = kind_of(span) == Some(FragmentKind::Mmapped);
        let top = self.top_of(span);

        for chunk in Regular::new(target.reader, sc, start, span.hi()) {
            target.interrupt.check()?;
            let chunk = chunk?;
            let (relation, _) = chunk.relation(sc, at);
            if relation == Relation::OutOf {
                continue;
            }

            let relation = if mmapped {
                if relation == Relation::Chunk {
                    Relation::Huge
                } else {
                    relation
                }
            } else if relation == Relation::Chunk {
                if Some(chunk.at) == top {
                    Relation::Zero
                } else if self.is_free(span, chunk.at) || !chunk.is_used(target.reader, sc)? {
                    Relation::Free
                } else {
                    Relation::Chunk
                }
            } else {
                relation
            };

            let (size, gran) = sc.netto(chunk.size());
            return Ok(Lookup::new(relation, chunk.payload(sc), at, size, Some(gran)));
        }

        Ok(Lookup::out_of())
    }

    /// Answer for `at` below `span` from the chunks chained back from its start
    fn lookup_left(
        &self,
        target: &Target<'_>,
        world: &World,
        ring: &Ring,
        span: &Span,
        at: u64,
    ) -> Result<Lookup> {
        let sc = self.sc;
        let start = match span.lo() {
            Some(start) if start > at => start,
            _ => return Ok(Lookup::out_of()),
        };
        let tree = match guess::walk_left(target, sc, world, ring, start) {
            Some(tree) if tree.resolve() <= at => tree,
            _ => return Ok(Lookup::out_of()),
        };

        for lo in tree.chain() {
            target.interrupt.check()?;
            if lo > at {
                continue;
            }
            let chunk = Chunk::read(target.reader, sc, lo)?;
            let relation = match chunk.relation(sc, at) {
                (Relation::Chunk, _) if !chunk.is_used(target.reader, sc)? => Relation::Free,
                (relation, _) => relation,
            };
            debug!(
                chunk = format_args!("{:#x}", lo),
                fragment = format_args!("{:#x}", start),
                "heap lookup left of fragment"
            );
            let (size, gran) = sc.netto(chunk.size());
            return Ok(Lookup::new(relation, chunk.payload(sc), at, size, Some(gran)));
        }

        Ok(Lookup::out_of())
    }

    fn fragment_chunks<'a>(&'a self, target: Target<'a>, span: &'a Span, query: &ChunkQuery) -> Chunks<'a> {
        let sc = self.sc;
        let (lo, hi) = match (span.lo(), span.hi()) {
            (Some(lo), Some(hi)) => (lo, hi),
            _ => return Box::new(std::iter::empty()),
        };
        let filter = query.size.prepare(|size| sc.round(size, false));
        let range = query.range;

        if kind_of(span) == Some(FragmentKind::Mmapped) {
            let page = target.config.page_size;
            if !filter.precheck(&Range::new(Some(page), None).unwrap_or(Range::WILD)) {
                return Box::new(std::iter::empty());
            }
            let starts: Vec<u64> = span
                .exten()
                .and_then(Extension::alias)
                .map(|alias| alias.points().to_vec())
                .unwrap_or_default();

            return Box::new(starts.into_iter().filter_map(move |at| {
                let chunk = match Chunk::checked(target.reader, sc, at, false) {
                    Ok(chunk) => chunk,
                    Err(err) => return Some(Err(err)),
                };
                let size = chunk.size().saturating_sub(sc.offset());
                let info = ChunkInfo {
                    relation: Relation::Huge,
                    at: chunk.payload(sc),
                    size,
                    granularity: page,
                };
                (range.contains(info.at) && filter.matches(size)).then_some(Ok(info))
            }));
        }

        let top = self.top_of(span);
        let walk = Regular::new(target.reader, sc, lo, Some(hi))
            .take_while(move |chunk| !matches!(chunk, Ok(c) if Some(c.at) == top));

        Box::new(walk.filter_map(move |chunk| {
            if let Err(err) = target.interrupt.check() {
                return Some(Err(err));
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return Some(Err(err)),
            };

            let (size, gran) = sc.netto(chunk.size());
            if !range.contains(chunk.payload(sc)) || !filter.matches(size) {
                return None;
            }
            if self.is_free(span, chunk.at) {
                return None;
            }
            match chunk.is_used(target.reader, sc) {
                Ok(true) => Some(Ok(ChunkInfo {
                    relation: Relation::Chunk,
                    at: chunk.payload(sc),
                    size,
                    granularity: gran,
                })),
                Ok(false) => None,
                Err(err) => Some(Err(err)),
            }
        }))
    }
}

fn kind_of(span: &Span) -> Option<FragmentKind> {
    span.exten()
        .and_then(Extension::fragment)
        .map(|frag| frag.kind)
}

impl Heap for GlibcHeap {
    fn name(&self) -> &'static str {
        OWNER
    }

    fn ring(&self) -> usize {
        self.seq
    }

    fn lookup(&self, target: &Target<'_>, world: &World, at: u64) -> Result<Lookup> {
        let ring = world
            .ring(self.seq)
            .ok_or_else(|| Error::analysis("glibc heap ring is not registered"))?;

        match ring.lookup(at, false) {
            Some((Match::Exact, span)) => self.lookup_in(target, span, at),
            Some((Match::Near, span)) => self.lookup_left(target, world, ring, span, at),
            None => Ok(Lookup::out_of()),
        }
    }

    fn chunks<'a>(&'a self, target: Target<'a>, world: &'a World, query: &ChunkQuery) -> Chunks<'a> {
        let ring = match world.ring(self.seq) {
            Some(ring) => ring,
            None => return Box::new(std::iter::empty()),
        };
        let query = query.clone();
        let (huge, small) = (query.wants_huge(), query.wants_small());

        Box::new(
            ring.spans(&query.range)
                .filter(move |span| {
                    if kind_of(span) == Some(FragmentKind::Mmapped) {
                        huge
                    } else {
                        small
                    }
                })
                .flat_map(move |span| self.fragment_chunks(target, span, &query)),
        )
    }

    fn stats(&self) -> Vec<(&'static str, u64)> {
        let ready = self.arenas.iter().filter(|a| a.is_ready()).count();
        vec![
            ("arenas", self.arenas.len() as u64),
            ("damaged", (self.arenas.len() - ready) as u64),
            ("system_mem", self.arenas.iter().map(|a| a.system_mem).sum()),
            ("resolved", self.arenas.iter().map(|a| a.bytes).sum()),
            ("aliases", self.arenas.iter().map(|a| a.aliases as u64).sum()),
            ("out_of", self.arenas.iter().map(|a| a.out_of as u64).sum()),
            ("guessed", self.guessed),
            ("n_mmaps", self.mmaps.n_mmaps),
            ("mmapped_mem", self.mmaps.mmapped_mem),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AddressModel, AnalysisConfig};
    use crate::heap::{Interrupt, SizePred};
    use crate::maps::Fragment;
    use crate::source::{MockMemorySource, SymbolAccessor, SymbolTable};
    use crate::world::{core_ring, AddressSet};

    const W: usize = 4;
    const ARENA: u64 = 0x8000;
    const MP: u64 = 0x9000;
    const BASE: u64 = 0x20000;
    const HEAP2: u64 = 0x40000;

    struct Fixture {
        mem: MockMemorySource,
        symbols: SymbolTable,
        config: AnalysisConfig,
        interrupt: Interrupt,
    }

    impl Fixture {
        fn target<'a>(&'a self, addrs: &'a AddressSet) -> Target<'a> {
            Target {
                reader: &self.mem,
                symbols: &self.symbols,
                validator: addrs,
                config: &self.config,
                interrupt: &self.interrupt,
            }
        }

        fn discover(&self) -> (World, AddressSet, Result<GlibcHeap>) {
            let mut world = World::new(AddressModel::Basic);
            world
                .push("core", core_ring(&self.mem.regions).unwrap(), Provider::Core, true)
                .unwrap();
            let addrs = world.addrs(false, 0);
            let heap = GlibcHeap::discover(&self.target(&addrs), &mut world);
            (world, addrs, heap)
        }

        fn off(&self, field: &str) -> u64 {
            self.symbols
                .require("malloc_state")
                .unwrap()
                .offset(field)
                .unwrap()
        }

        fn chunk(&mut self, at: u64, prev: u64, raw: u64) {
            self.mem.write_word(at, W, prev);
            self.mem.write_word(at + W as u64, W, raw);
        }

        /// A `malloc_state` with every bin empty
        fn arena(&mut self, at: u64, top: u64, next: u64, system_mem: u64) {
            self.mem.write_word(at + self.off("top"), W, top);
            self.mem.write_word(at + self.off("next"), W, next);
            self.mem.write_word(at + self.off("system_mem"), W, system_mem);

            let bins = at + self.off("bins");
            for x in (0..253u64).step_by(2) {
                let slot = bins + x * W as u64;
                self.mem.write_word(slot, W, slot - 2 * W as u64);
                self.mem.write_word(slot + W as u64, W, slot - 2 * W as u64);
            }
        }
    }

    /// Main arena of 0x1000 bytes with two fastbin chunks
    fn scenario() -> Fixture {
        let mem = MockMemorySource::empty()
            .with_block(ARENA, 0x500)
            .with_block(MP, 0x100)
            .with_block(BASE, 0x1000);

        let mut symbols = SymbolTable::glibc(W);
        symbols.set("main_arena", ARENA);
        symbols.set("mp_", MP);

        let mut fx = Fixture {
            mem,
            symbols,
            config: AnalysisConfig {
                word_size: W,
                ..AnalysisConfig::default()
            },
            interrupt: Interrupt::new(),
        };

        let sbrk = fx.symbols.require("malloc_par").unwrap().offset("sbrk_base").unwrap();
        fx.mem.write_word(MP + sbrk, W, BASE);
        fx.arena(ARENA, BASE + 0xf00, ARENA, 0x1000);

        let fast = ARENA + fx.off("fastbinsY");
        fx.mem.write_word(fast, W, BASE + 0x10);
        fx.mem.write_word(fast + W as u64, W, BASE + 0x40);

        fx.chunk(BASE, 0, 0x11);
        fx.chunk(BASE + 0x10, 0, 0x21);
        fx.chunk(BASE + 0x30, 0, 0x11);
        fx.chunk(BASE + 0x40, 0, 0x31);
        fx.chunk(BASE + 0x70, 0, 0xe91);
        fx.chunk(BASE + 0xf00, 0, 0x101);
        fx
    }

    fn ranges(world: &World, heap: &GlibcHeap) -> Vec<Range> {
        world
            .ring(heap.ring())
            .unwrap()
            .iter()
            .map(|s| s.range())
            .collect()
    }

    #[test]
    fn test_single_fragment() {
        let fx = scenario();
        let (world, _, heap) = fx.discover();
        let heap = heap.unwrap();

        assert_eq!(ranges(&world, &heap), vec![Range::bounded(BASE, BASE + 0x1000).unwrap()]);

        let arena = &heap.arenas()[0];
        assert_eq!(arena.state, ArenaState::Ready);
        assert_eq!(arena.layout, Layout::Contiguous);
        assert_eq!(arena.free, vec![BASE + 0x10, BASE + 0x40]);
        assert_eq!(arena.out_of, 0);
    }

    #[test]
    fn test_closure() {
        let fx = scenario();
        let (world, _, heap) = fx.discover();
        let heap = heap.unwrap();

        let arena = &heap.arenas()[0];
        let fragments: u64 = world.ring(heap.ring()).unwrap().bytes();
        assert_eq!(fragments, arena.system_mem);
        assert_eq!(arena.bytes, arena.system_mem);
    }

    #[test]
    fn test_lookup() {
        let fx = scenario();
        let (world, addrs, heap) = fx.discover();
        let heap = heap.unwrap();
        let target = fx.target(&addrs);

        let used = heap.lookup(&target, &world, BASE + 0x80).unwrap();
        assert_eq!(used.relation, Relation::Chunk);
        assert_eq!(used.aligned, Some(BASE + 0x78));
        assert_eq!(used.offset, Some(8));
        assert_eq!(used.size, Some(0xe8c));

        let head = heap.lookup(&target, &world, BASE + 0x74).unwrap();
        assert_eq!(head.relation, Relation::Head);
        assert_eq!(head.offset, Some(-4));

        let free = heap.lookup(&target, &world, BASE + 0x48).unwrap();
        assert_eq!(free.relation, Relation::Free);
        assert_eq!(free.size, Some(0x2c));

        assert_eq!(heap.lookup(&target, &world, BASE + 0xf10).unwrap().relation, Relation::Zero);
        assert_eq!(heap.lookup(&target, &world, 0x30000).unwrap().relation, Relation::OutOf);
    }

    #[test]
    fn test_chunks_and_lookup_agree() {
        let fx = scenario();
        let (world, addrs, heap) = fx.discover();
        let heap = heap.unwrap();
        let target = fx.target(&addrs);

        let chunks: Vec<ChunkInfo> = heap
            .chunks(target, &world, &ChunkQuery::default())
            .collect::<Result<_>>()
            .unwrap();
        let starts: Vec<u64> = chunks.iter().map(|c| c.at).collect();
        assert_eq!(starts, vec![BASE + 0x8, BASE + 0x38, BASE + 0x78]);

        for chunk in &chunks {
            let lookup = heap.lookup(&target, &world, chunk.at + 1).unwrap();
            assert_eq!(lookup.relation, Relation::Chunk);
            assert_eq!(lookup.aligned, Some(chunk.at));
            assert_eq!(lookup.offset, Some(1));
            assert_eq!(lookup.size, Some(chunk.size));
        }

        let small = ChunkQuery {
            size: SizePred::OneOf(vec![8]),
            ..ChunkQuery::default()
        };
        assert_eq!(heap.chunks(target, &world, &small).count(), 2);

        let huge = ChunkQuery {
            huge: Some(true),
            ..ChunkQuery::default()
        };
        assert_eq!(heap.chunks(target, &world, &huge).count(), 0);
    }

    #[test]
    fn test_binned_chunk() {
        let mut fx = scenario();
        fx.chunk(BASE + 0x70, 0, 0x91);
        fx.chunk(BASE + 0x100, 0x90, 0xe00);

        let slot = ARENA + fx.off("bins") + 10 * W as u64;
        let head = slot - 2 * W as u64;
        fx.mem.write_word(slot, W, BASE + 0x70);
        fx.mem.write_word(slot + W as u64, W, BASE + 0x70);
        fx.mem.write_word(BASE + 0x78, W, head);
        fx.mem.write_word(BASE + 0x7c, W, head);

        let (world, addrs, heap) = fx.discover();
        let heap = heap.unwrap();
        let target = fx.target(&addrs);

        assert_eq!(heap.arenas()[0].free, vec![BASE + 0x10, BASE + 0x40, BASE + 0x70]);
        assert_eq!(heap.lookup(&target, &world, BASE + 0x80).unwrap().relation, Relation::Free);

        let starts: Vec<u64> = heap
            .chunks(target, &world, &ChunkQuery::default())
            .map(|c| c.unwrap().at)
            .collect();
        assert_eq!(starts, vec![BASE + 0x8, BASE + 0x38, BASE + 0x108]);
    }

    #[test]
    fn test_broken_top_fails() {
        let mut fx = scenario();
        // sbrk base plus system_mem no longer ends at the top chunk
        fx.chunk(BASE + 0xf00, 0, 0x81);

        let (world, _, heap) = fx.discover();
        assert!(matches!(heap, Err(Error::Analysis(_))));
        assert!(world.by_provider(Provider::Heap).next().is_none());
    }

    #[test]
    fn test_interrupt_stops_fastbin_marking() {
        let fx = scenario();
        let (_, addrs, _) = fx.discover();
        let state = fx.symbols.require("malloc_state").unwrap();
        let heap_info = fx.symbols.require("heap_info").unwrap();
        let ctx = Ctx {
            reader: &fx.mem,
            validator: &addrs,
            interrupt: &fx.interrupt,
            sc: Scale::new(W).unwrap(),
            state: &state,
            heap_info: &heap_info,
            sbrk_base: BASE,
        };

        fx.interrupt.raise();
        let mut ring = Ring::new();
        let mut arena = Arena::new(0, ARENA);
        assert!(matches!(arena.reconstruct(&ctx, &mut ring), Err(Error::Interrupted)));
        assert_eq!(arena.state, ArenaState::Marking);
        assert!(arena.free.is_empty());
        assert!(ring.is_empty());
    }

    /// Damaged main arena followed by a healthy secondary one
    fn two_arenas() -> Fixture {
        let mut fx = scenario();
        fx.mem = std::mem::replace(&mut fx.mem, MockMemorySource::empty()).with_block(HEAP2, 0x1000);

        let arena2 = HEAP2 + 0x10;
        fx.mem.write_word(HEAP2, W, arena2);
        fx.mem.write_word(HEAP2 + 8, W, 0x1000);
        fx.arena(arena2, HEAP2 + 0x800, ARENA, 0x1000);
        fx.mem.write_word(ARENA + fx.off("next"), W, arena2);

        fx.chunk(HEAP2 + 0x468, 0, 0x399);
        fx.chunk(HEAP2 + 0x800, 0, 0x801);

        // the first fastbin chunk no longer looks in use
        fx.chunk(BASE + 0x30, 0, 0x10);
        fx
    }

    #[test]
    fn test_damaged_arena_skipped() {
        let fx = two_arenas();
        let (world, addrs, heap) = fx.discover();
        let heap = heap.unwrap();

        assert_eq!(heap.arenas().len(), 2);
        assert_eq!(heap.arenas()[0].state, ArenaState::Damaged);
        assert!(heap.arenas()[0].reason.is_some());
        assert_eq!(heap.arenas()[1].state, ArenaState::Ready);

        assert_eq!(
            ranges(&world, &heap),
            vec![Range::bounded(HEAP2 + 0x468, HEAP2 + 0x1000).unwrap()]
        );

        let target = fx.target(&addrs);
        assert_eq!(heap.lookup(&target, &world, BASE + 0x80).unwrap().relation, Relation::OutOf);
        assert_eq!(heap.lookup(&target, &world, HEAP2 + 0x500).unwrap().relation, Relation::Chunk);
        assert_eq!(heap.stats()[1], ("damaged", 1));
    }

    #[test]
    fn test_mmapped_chunks_found() {
        let mut fx = scenario();
        fx.mem = std::mem::replace(&mut fx.mem, MockMemorySource::empty()).with_block(0x60000, 0x20000);
        fx.chunk(0x61000, 0, 0x2002);
        fx.chunk(0x63000, 0, 0x3002);
        fx.chunk(0x70000, 0, 0x1002);

        let (world, addrs, heap) = fx.discover();
        let heap = heap.unwrap();

        let mmapped: Vec<(Range, usize)> = world
            .ring(heap.ring())
            .unwrap()
            .iter()
            .filter(|s| kind_of(s) == Some(FragmentKind::Mmapped))
            .map(|s| (s.range(), s.exten().and_then(Extension::alias).unwrap().len()))
            .collect();
        assert_eq!(
            mmapped,
            vec![
                (Range::bounded(0x61000, 0x66000).unwrap(), 2),
                (Range::bounded(0x70000, 0x71000).unwrap(), 1),
            ]
        );

        let target = fx.target(&addrs);
        let huge = heap.lookup(&target, &world, 0x63010).unwrap();
        assert_eq!(huge.relation, Relation::Huge);
        assert_eq!(huge.aligned, Some(0x63008));

        let query = ChunkQuery {
            huge: Some(true),
            ..ChunkQuery::default()
        };
        let sizes: Vec<u64> = heap
            .chunks(target, &world, &query)
            .map(|c| c.unwrap().size)
            .collect();
        assert_eq!(sizes, vec![0x1ff8, 0x2ff8, 0xff8]);
    }

    /// A bound fragment at BASE with two chunks chained below it
    fn left_of_fragment(left_extend: u64) -> (Fixture, World, GlibcHeap) {
        let mut fx = Fixture {
            mem: MockMemorySource::empty().with_block(BASE - 0x400, 0x1400),
            symbols: SymbolTable::glibc(W),
            config: AnalysisConfig {
                word_size: W,
                left_extend,
                ..AnalysisConfig::default()
            },
            interrupt: Interrupt::new(),
        };
        fx.chunk(BASE - 0x200, 0, 0x101);
        // clears PREV_IN_USE, the chunk below is free
        fx.chunk(BASE - 0x100, 0, 0x100);
        fx.chunk(BASE, 0, 0x101);

        let range = Range::bounded(BASE, BASE + 0x1000).unwrap();
        let mut ring = Ring::new();
        let frag = Fragment::new(Some(0), FragmentKind::Bound, range);
        ring.push(Span::new(range, Some(frag.into())).unwrap()).unwrap();

        let mut world = World::new(AddressModel::Basic);
        world
            .push("core", core_ring(&fx.mem.regions).unwrap(), Provider::Core, true)
            .unwrap();
        let seq = world.push(OWNER, ring, Provider::Heap, true).unwrap();

        let heap = GlibcHeap {
            seq,
            sc: Scale::new(W).unwrap(),
            arenas: Vec::new(),
            mmaps: MmapStats::default(),
            guessed: 0,
        };
        (fx, world, heap)
    }

    #[test]
    fn test_lookup_left_of_fragment() {
        let (fx, world, heap) = left_of_fragment(1 << 20);
        let addrs = world.addrs(false, 0);
        let target = fx.target(&addrs);

        let used = heap.lookup(&target, &world, BASE - 0x100 + 0x10).unwrap();
        assert_eq!(used.relation, Relation::Chunk);
        assert_eq!(used.aligned, Some(BASE - 0xf8));
        assert_eq!(used.offset, Some(8));
        assert_eq!(used.size, Some(0xfc));

        let head = heap.lookup(&target, &world, BASE - 0x100 + 4).unwrap();
        assert_eq!(head.relation, Relation::Head);

        let free = heap.lookup(&target, &world, BASE - 0x200 + 0x10).unwrap();
        assert_eq!(free.relation, Relation::Free);
        assert_eq!(free.aligned, Some(BASE - 0x1f8));

        // nothing chains below BASE - 0x200
        let below = heap.lookup(&target, &world, BASE - 0x300).unwrap();
        assert_eq!(below.relation, Relation::OutOf);
    }

    #[test]
    fn test_lookup_left_bounded_by_left_extend() {
        let (fx, world, heap) = left_of_fragment(0x100);
        let addrs = world.addrs(false, 0);
        let target = fx.target(&addrs);

        let near = heap.lookup(&target, &world, BASE - 0x100 + 0x10).unwrap();
        assert_eq!(near.relation, Relation::Chunk);

        let far = heap.lookup(&target, &world, BASE - 0x200 + 0x10).unwrap();
        assert_eq!(far.relation, Relation::OutOf);
    }
}
