//! One malloc arena, from its `malloc_state` to heap fragments

use serde::Serialize;
use tracing::{debug, info, warn};

use super::chunk::{bin_chain, fast_chain, Chunk, Regular, Stop};
use super::scale::{Scale, NONCONTIGUOUS};
use crate::error::{Error, Result};
use crate::heap::Interrupt;
use crate::maps::{Alias, Extension, Fragment, FragmentKind, Keep, Near, Range, Ring, Span, Transaction};
use crate::source::{AddressValidator, MemorySource, StructLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArenaState {
    Discovering,
    Marking,
    Curbing,
    Ready,
    Damaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// One region with known bounds
    Contiguous,
    /// Regions whose bounds come from alias points only
    Scattered,
}

/// What an arena needs from the target
pub struct Ctx<'a> {
    pub reader: &'a dyn MemorySource,
    pub validator: &'a dyn AddressValidator,
    pub interrupt: &'a Interrupt,
    pub sc: Scale,
    pub state: &'a StructLayout,
    pub heap_info: &'a StructLayout,
    /// `mp_.sbrk_base`
    pub sbrk_base: u64,
}

impl Ctx<'_> {
    fn word(&self, at: u64) -> Result<u64> {
        self.reader
            .read_word(at, self.sc.width())
            .map_err(|err| Error::damaged(at, format!("unreadable arena data: {}", err)))
    }
}

#[derive(Debug)]
pub struct Arena {
    pub seq: usize,
    pub at: u64,
    pub state: ArenaState,
    pub layout: Layout,
    pub system_mem: u64,
    pub top: Option<Chunk>,
    /// Alias points accepted by the wild
    pub aliases: usize,
    /// Alias points outside a bounded wild
    pub out_of: usize,
    pub fences: Vec<u64>,
    /// Chunks sitting in fastbins or bins
    pub free: Vec<u64>,
    pub fragments: usize,
    pub bytes: u64,
    pub reason: Option<String>,
    wild: Option<Span>,
    base: Option<u64>,
}

impl Arena {
    pub fn new(seq: usize, at: u64) -> Self {
        Self {
            seq,
            at,
            state: ArenaState::Discovering,
            layout: Layout::Contiguous,
            system_mem: 0,
            top: None,
            aliases: 0,
            out_of: 0,
            fences: Vec::new(),
            free: Vec::new(),
            fragments: 0,
            bytes: 0,
            reason: None,
            wild: None,
            base: None,
        }
    }

    /// Address of the next arena in the circular list
    pub fn read_next(ctx: &Ctx<'_>, at: u64) -> Result<u64> {
        ctx.word(at + ctx.state.offset("next")?)
    }

    pub fn is_ready(&self) -> bool {
        self.state == ArenaState::Ready
    }

    /// Run every stage and commit the fragments into `ring`
    ///
    /// Damage is recorded on the arena and leaves the ring untouched,
    /// any other failure is returned.
    pub fn reconstruct(&mut self, ctx: &Ctx<'_>, ring: &mut Ring) -> Result<()> {
        let built = self.build(ctx, ring);

        let trans = match built {
            Ok(trans) => trans,
            Err(err) if err.is_damage() => {
                warn!(
                    arena = self.seq,
                    at = format_args!("{:#x}", self.at),
                    stage = ?self.state,
                    "arena is damaged: {}",
                    err
                );
                self.state = ArenaState::Damaged;
                self.reason = Some(err.to_string());
                self.wild = None;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        self.fragments = trans.len();
        self.bytes = trans.bytes();
        trans.commit(ring)?;
        self.state = ArenaState::Ready;

        info!(
            arena = self.seq,
            at = format_args!("{:#x}", self.at),
            layout = ?self.layout,
            system_mem = self.system_mem,
            aliases = self.aliases,
            out_of = self.out_of,
            fragments = self.fragments,
            bytes = self.bytes,
            "arena resolved"
        );
        if self.system_mem > self.bytes {
            debug!(
                arena = self.seq,
                "arena has at most {} unresolved bytes",
                self.system_mem - self.bytes
            );
        }
        Ok(())
    }

    fn build(&mut self, ctx: &Ctx<'_>, ring: &Ring) -> Result<Transaction> {
        self.discover(ctx)?;
        self.mark(ctx)?;
        self.curb(ctx, ring)
    }

    fn wild_mut(&mut self) -> Result<&mut Span> {
        self.wild
            .as_mut()
            .ok_or_else(|| Error::analysis("arena has no wild span"))
    }

    fn wild_alias(&mut self) -> Result<&mut Alias> {
        self.wild_mut()?
            .exten_mut()?
            .and_then(Extension::alias_mut)
            .ok_or_else(|| Error::analysis("wild span carries no alias points"))
    }

    fn push_alias(&mut self, at: u64) -> Result<()> {
        match self.wild_alias()?.push(at) {
            Ok(()) => self.aliases += 1,
            Err(Error::OutOfRange { .. }) => self.out_of += 1,
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn discover(&mut self, ctx: &Ctx<'_>) -> Result<()> {
        self.state = ArenaState::Discovering;
        let (at, sc) = (self.at, ctx.sc);

        let flags = ctx
            .reader
            .read_u32(at + ctx.state.offset("flags")?)
            .map_err(|err| Error::damaged(at, format!("unreadable arena flags: {}", err)))?;
        self.system_mem = ctx.word(at + ctx.state.offset("system_mem")?)?;

        let top = ctx.word(at + ctx.state.offset("top")?)?;
        if !ctx.validator.is_plausible(top) {
            return Err(Error::damaged(at, format!("implausible top chunk {:#x}", top)));
        }
        let top = Chunk::checked(ctx.reader, sc, top, false)?;
        self.top = Some(top);

        let (range, kind) = if self.seq == 0 {
            if flags & NONCONTIGUOUS == 0 {
                self.layout = Layout::Contiguous;
                if ctx.sbrk_base.wrapping_add(self.system_mem) != top.end() {
                    return Err(Error::damaged(
                        at,
                        format!(
                            "sbrk base {:#x} and {:#x} bytes do not end at top {:#x}",
                            ctx.sbrk_base,
                            self.system_mem,
                            top.end()
                        ),
                    ));
                }
                (Range::bounded(ctx.sbrk_base, top.end())?, FragmentKind::Bound)
            } else {
                self.layout = Layout::Scattered;
                self.base = Some(ctx.sbrk_base);
                (Range::WILD, FragmentKind::Frag)
            }
        } else {
            self.layout = Layout::Contiguous;
            let heap = at
                .checked_sub(ctx.heap_info.size)
                .ok_or_else(|| Error::damaged(at, "arena below its heap info"))?;
            let owner = ctx.word(heap + ctx.heap_info.offset("ar_ptr")?)?;
            if owner != at {
                return Err(Error::damaged(
                    at,
                    format!("heap info at {:#x} belongs to {:#x}", heap, owner),
                ));
            }

            let size = ctx.word(heap + ctx.heap_info.offset("size")?)?;
            let low = sc.align(at + ctx.state.size);
            let end = heap.wrapping_add(size);
            if !(low <= top.at && top.at < end) {
                return Err(Error::damaged(
                    at,
                    format!("top {:#x} is out of heap [{:#x}, {:#x})", top.at, low, end),
                ));
            }
            (Range::bounded(low, top.end().min(end))?, FragmentKind::Bound)
        };

        let frag = Fragment::new(Some(self.seq), kind, range);
        self.wild = Some(Span::new(range, Some(frag.into()))?);

        debug!(
            arena = self.seq,
            at = format_args!("{:#x}", at),
            layout = ?self.layout,
            system_mem = self.system_mem,
            wild = %range,
            "arena discovered"
        );
        Ok(())
    }

    fn mark(&mut self, ctx: &Ctx<'_>) -> Result<()> {
        self.state = ArenaState::Marking;
        let (at, sc, w) = (self.at, ctx.sc, ctx.sc.word());
        let limit = (self.system_mem / sc.min()) as usize + 1;

        let fast = ctx.state.field("fastbinsY")?;
        for k in 0..fast.size / w {
            ctx.interrupt.check()?;

            let head = ctx.word(at + fast.offset + k * w)?;
            if head == 0 {
                continue;
            }
            for chunk in fast_chain(ctx.reader, sc, ctx.validator, head, limit)? {
                self.push_alias(chunk.at)?;
                self.free.push(chunk.at);
            }
        }

        let bins = ctx.state.field("bins")?;
        let slots = bins.size / w;
        for x in (0..slots.saturating_sub(1)).step_by(2) {
            ctx.interrupt.check()?;

            let slot = at + bins.offset + x * w;
            let (fd, bk) = (ctx.word(slot)?, ctx.word(slot + w)?);
            let head = slot - 2 * w;
            if fd == head {
                continue;
            }
            for link in [fd, bk] {
                if !ctx.validator.is_plausible(link) {
                    return Err(Error::damaged(slot, format!("implausible bin link {:#x}", link)));
                }
            }

            let (chunks, fences) =
                bin_chain(ctx.reader, sc, ctx.validator, head, fd, (x / 2) as usize, limit)?;
            for chunk in chunks {
                self.push_alias(chunk.at)?;
                self.free.push(chunk.at);
            }
            self.fences.extend(fences);
        }

        self.free.sort_unstable();
        self.free.dedup();

        debug!(
            arena = self.seq,
            aliases = self.aliases,
            out_of = self.out_of,
            fences = self.fences.len(),
            "arena marked"
        );
        Ok(())
    }

    fn curb(&mut self, ctx: &Ctx<'_>, ring: &Ring) -> Result<Transaction> {
        self.state = ArenaState::Curbing;
        let top = self
            .top
            .ok_or_else(|| Error::analysis("arena has no top chunk"))?;

        self.push_alias(top.at)?;
        self.fences.push(top.end());
        self.fences.sort_unstable();
        self.fences.dedup();

        let wild = self.wild_mut()?.range();
        if wild.is_beast() {
            let base = self.base;
            let hint = self.fences.last().copied();
            let alias = self.wild_alias()?;
            if let Some(base) = base {
                alias.push(base)?;
            }
            let caught = alias.catch(hint)?;
            self.wild_mut()?.extend(caught)?;
        } else if !wild.is_bounded() {
            return Err(Error::analysis(format!("partially unbounded wild {}", wild)));
        }

        let wild = self.wild_mut()?.range();
        self.fences.retain(|&f| wild.lo().map_or(false, |lo| f > lo) && wild.inside(&Range::point(f)));

        let mut trans = ring.begin();
        while let Some(&b) = self.fences.first() {
            ctx.interrupt.check()?;

            let span = self.wild_mut()?;
            let before = span.range().len().unwrap_or(0);
            let a = span
                .lo()
                .ok_or_else(|| Error::analysis("wild lost its lower bound"))?;
            if a >= b {
                return Err(Error::analysis(format!(
                    "wild start {:#x} is past fence {:#x}",
                    a, b
                )));
            }

            let stop = Regular::new(ctx.reader, ctx.sc, a, Some(b)).finish()?;
            let reached = stop.at();
            if reached > b {
                return Err(Error::analysis(format!(
                    "chunk walk from {:#x} overshot fence {:#x} up to {:#x}",
                    a, b, reached
                )));
            }
            if reached == b {
                self.fences.remove(0);
            }
            if let Stop::Fence(at) = stop {
                debug!(arena = self.seq, at = format_args!("{:#x}", at), "fencepost reached");
            }

            let span = self.wild_mut()?;
            match span.cut(reached, Keep::After)? {
                Some(run) if !run.range().is_empty() => trans.push(run)?,
                _ => break,
            }
            if span.range().is_empty() {
                break;
            }

            let next = span
                .exten()
                .and_then(Extension::alias)
                .map(|alias| alias.lookup(reached, Near::After))
                .transpose()?
                .flatten()
                .ok_or_else(|| Error::analysis("no alias points before fence"))?;
            span.cut(next, Keep::After)?;

            if span.range().len().unwrap_or(0) >= before {
                return Err(Error::analysis("wild does not shrink"));
            }
        }

        let left = self.wild_mut()?.range();
        if !left.is_empty() {
            return Err(Error::analysis(format!("the wild {} was not exhausted", left)));
        }

        Ok(trans)
    }
}
