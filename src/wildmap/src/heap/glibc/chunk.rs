//! Chunk cursor and the traversals over it

use super::scale::{Scale, PREV_IN_USE};
use crate::error::{Error, Result};
use crate::heap::Relation;
use crate::source::{AddressValidator, MemorySource};

/// Fastbin chunks are never this large
const FAST_LIMIT: u64 = 512;

/// Header of one chunk read from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub at: u64,
    pub prev_size: u64,
    pub raw: u64,
}

impl Chunk {
    /// Read the header at `at`, unreadable memory is damage
    pub fn read(reader: &dyn MemorySource, sc: Scale, at: u64) -> Result<Chunk> {
        let words = reader
            .read_bytes(at, 2 * sc.width())
            .map_err(|err| Error::damaged(at, format!("unreadable chunk: {}", err)))?;

        let word = |k: usize| -> u64 {
            let bytes = &words[k * sc.width()..(k + 1) * sc.width()];
            bytes
                .iter()
                .rev()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
        };

        Ok(Chunk {
            at,
            prev_size: word(0),
            raw: word(1),
        })
    }

    /// Read and require a sane size
    pub fn checked(reader: &dyn MemorySource, sc: Scale, at: u64, fence: bool) -> Result<Chunk> {
        let chunk = Chunk::read(reader, sc, at)?;
        if !sc.fits(chunk.size(), fence) {
            return Err(Error::damaged(
                at,
                format!("invalid chunk size {:#x}", chunk.size()),
            ));
        }
        Ok(chunk)
    }

    pub fn size(&self) -> u64 {
        Scale::csize(self.raw)
    }

    pub fn flag(&self, flag: u64) -> bool {
        self.raw & flag != 0
    }

    pub fn end(&self) -> u64 {
        self.at.wrapping_add(self.size())
    }

    pub fn payload(&self, sc: Scale) -> u64 {
        self.at + sc.offset()
    }

    pub fn is_fence(&self, sc: Scale) -> bool {
        self.size() == sc.fence()
    }

    /// The chunk right after this one
    pub fn successor(&self, reader: &dyn MemorySource, sc: Scale) -> Result<Chunk> {
        Chunk::checked(reader, sc, self.end(), true)
    }

    /// In use unless the successor says otherwise
    pub fn is_used(&self, reader: &dyn MemorySource, sc: Scale) -> Result<bool> {
        Ok(self.successor(reader, sc)?.flag(PREV_IN_USE))
    }

    pub fn fd(&self, reader: &dyn MemorySource, sc: Scale) -> Result<u64> {
        let at = self.at + 2 * sc.word();
        reader
            .read_word(at, sc.width())
            .map_err(|err| Error::damaged(at, format!("unreadable fd: {}", err)))
    }

    pub fn bk(&self, reader: &dyn MemorySource, sc: Scale) -> Result<u64> {
        let at = self.at + 3 * sc.word();
        reader
            .read_word(at, sc.width())
            .map_err(|err| Error::damaged(at, format!("unreadable bk: {}", err)))
    }

    /// Where `at` falls relative to this chunk, with the offset from the payload
    pub fn relation(&self, sc: Scale, at: u64) -> (Relation, i64) {
        let delta = at.wrapping_sub(self.at) as i64;
        let offset = delta - sc.offset() as i64;

        if delta < 0 || delta as u64 >= self.size() {
            (Relation::OutOf, offset)
        } else if (delta as u64) < sc.offset() {
            (Relation::Head, offset)
        } else {
            (Relation::Chunk, offset)
        }
    }
}

/// Why a regular walk ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// The next chunk would start at or past the end
    End(u64),
    /// First chunk of a fencepost pair
    Fence(u64),
}

impl Stop {
    pub fn at(self) -> u64 {
        match self {
            Stop::End(at) | Stop::Fence(at) => at,
        }
    }
}

enum State {
    Start(u64),
    At(Chunk),
    Done,
}

/// Forward walk through adjacent chunks
pub struct Regular<'r> {
    reader: &'r dyn MemorySource,
    sc: Scale,
    end: Option<u64>,
    state: State,
    stop: Option<Stop>,
}

impl<'r> Regular<'r> {
    pub fn new(reader: &'r dyn MemorySource, sc: Scale, start: u64, end: Option<u64>) -> Self {
        Self {
            reader,
            sc,
            end,
            state: State::Start(start),
            stop: None,
        }
    }

    /// Where the walk ended, once it has
    pub fn stop(&self) -> Option<Stop> {
        self.stop
    }

    /// Run to the end and report the stop
    pub fn finish(mut self) -> Result<Stop> {
        for chunk in self.by_ref() {
            chunk?;
        }
        self.stop
            .ok_or_else(|| Error::analysis("chunk walk ended without a stop"))
    }

    fn step(&mut self, cur: Chunk) -> Result<Option<Chunk>> {
        let next = cur.end();
        if cur.size() == 0 || next <= cur.at {
            return Err(Error::damaged(cur.at, "chunk walk does not advance"));
        }
        if self.end.map_or(false, |end| next >= end) {
            self.stop = Some(Stop::End(next));
            return Ok(None);
        }

        let caret = Chunk::read(self.reader, self.sc, next)?;
        if caret.is_fence(self.sc) && cur.is_fence(self.sc) && caret.flag(PREV_IN_USE) {
            self.stop = Some(Stop::Fence(cur.at));
            return Ok(None);
        }
        if !self.sc.fits(caret.size(), true) {
            return Err(Error::damaged(
                next,
                format!("invalid chunk size {:#x}", caret.size()),
            ));
        }
        Ok(Some(caret))
    }
}

impl Iterator for Regular<'_> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let out = match std::mem::replace(&mut self.state, State::Done) {
            State::Done => return None,
            State::Start(at) => Chunk::checked(self.reader, self.sc, at, false).map(Some),
            State::At(cur) => self.step(cur),
        };

        match out {
            Ok(Some(chunk)) => {
                self.state = State::At(chunk);
                Some(Ok(chunk))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

fn plausible(validator: &dyn AddressValidator, at: u64, what: &str) -> Result<()> {
    if validator.is_plausible(at) {
        Ok(())
    } else {
        Err(Error::damaged(at, format!("implausible {} pointer", what)))
    }
}

/// Chunks of one fastbin, linked through `fd`
pub fn fast_chain(
    reader: &dyn MemorySource,
    sc: Scale,
    validator: &dyn AddressValidator,
    head: u64,
    limit: usize,
) -> Result<Vec<Chunk>> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut at = head;

    while at != 0 {
        if chunks.len() >= limit {
            return Err(Error::damaged(head, "fastbin list does not end"));
        }
        plausible(validator, at, "fastbin")?;

        let chunk = Chunk::checked(reader, sc, at, !chunks.is_empty())?;
        if let Some(first) = chunks.first() {
            if chunk.size() != first.size() {
                return Err(Error::damaged(at, "fastbin chunk sizes differ"));
            }
        }
        if chunk.size() >= FAST_LIMIT {
            return Err(Error::damaged(at, "fastbin chunk too large"));
        }
        if !chunk.is_used(reader, sc)? {
            return Err(Error::damaged(at, "fastbin chunk is not marked in use"));
        }

        chunks.push(chunk);
        at = chunk.fd(reader, sc)?;
    }

    Ok(chunks)
}

/// Chunks of one regular bin and the fenceposts found behind them
///
/// `head` is the fake chunk whose `fd` and `bk` are the bin slots. Queue
/// 0 is the unsorted bin, whose chunks are not validated against their
/// neighbours.
pub fn bin_chain(
    reader: &dyn MemorySource,
    sc: Scale,
    validator: &dyn AddressValidator,
    head: u64,
    first: u64,
    queue: usize,
    limit: usize,
) -> Result<(Vec<Chunk>, Vec<u64>)> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut fences: Vec<u64> = Vec::new();
    let mut at = first;

    while at != head {
        if chunks.len() >= limit {
            return Err(Error::damaged(head, "bin list does not end"));
        }
        plausible(validator, at, "bin")?;

        let chunk = Chunk::checked(reader, sc, at, false)?;
        if queue > 0 {
            if !chunk.flag(PREV_IN_USE) {
                return Err(Error::damaged(at, "free chunk follows a free chunk"));
            }

            let succ = chunk.successor(reader, sc)?;
            if succ.flag(PREV_IN_USE) {
                return Err(Error::damaged(at, "binned chunk is marked in use"));
            }
            if succ.prev_size != chunk.size() {
                return Err(Error::damaged(at, "successor prev_size mismatch"));
            }

            let after = Chunk::read(reader, sc, succ.end())?;
            if succ.is_fence(sc) && after.is_fence(sc) && after.flag(PREV_IN_USE) {
                fences.push(succ.at);
            } else if !after.flag(PREV_IN_USE) {
                return Err(Error::damaged(succ.at, "free chunk successor is not in use"));
            }
        }

        let next = chunk.fd(reader, sc)?;
        if next != head {
            plausible(validator, next, "bin")?;
            let back = Chunk::read(reader, sc, next)?.bk(reader, sc)?;
            if back != at {
                return Err(Error::damaged(next, "broken bin links"));
            }
        }

        chunks.push(chunk);
        at = next;
    }

    Ok((chunks, fences))
}

/// Candidate chunk starts probed backwards from `start` down to `end`
///
/// Positions step by the payload offset. A position is a candidate when
/// its size field could describe a regular chunk. Unreadable memory ends
/// the probe.
pub fn left_probe<'r>(
    reader: &'r dyn MemorySource,
    sc: Scale,
    start: u64,
    end: u64,
) -> impl Iterator<Item = Chunk> + 'r {
    let step = sc.offset();
    let mut at = start;

    std::iter::from_fn(move || loop {
        at = at.checked_sub(step).filter(|&p| p >= end)?;
        match Chunk::read(reader, sc, at) {
            Ok(chunk) if sc.fits(chunk.size(), false) => return Some(chunk),
            Ok(_) => continue,
            Err(_) => return None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockMemorySource;

    const BASE: u64 = 0x10000;

    struct Everything;

    impl AddressValidator for Everything {
        fn is_plausible(&self, _address: u64) -> bool {
            true
        }
    }

    fn chunk(mem: &mut MockMemorySource, at: u64, prev: u64, raw: u64) {
        mem.write_word(at, 4, prev);
        mem.write_word(at + 4, 4, raw);
    }

    fn layout() -> MockMemorySource {
        let mut mem = MockMemorySource::empty().with_block(BASE, 0x200);
        chunk(&mut mem, BASE, 0, 0x21);
        chunk(&mut mem, BASE + 0x20, 0, 0x19);
        chunk(&mut mem, BASE + 0x38, 0, 0x29);
        chunk(&mut mem, BASE + 0x60, 0, 0x9);
        chunk(&mut mem, BASE + 0x68, 0, 0x9);
        mem
    }

    #[test]
    fn test_regular_stops_at_fencepost() {
        let mem = layout();
        let sc = Scale::new(4).unwrap();

        let mut walk = Regular::new(&mem, sc, BASE, None);
        let starts: Vec<u64> = walk.by_ref().map(|c| c.unwrap().at).collect();
        assert_eq!(starts, vec![BASE, BASE + 0x20, BASE + 0x38, BASE + 0x60]);
        assert_eq!(walk.stop(), Some(Stop::Fence(BASE + 0x60)));
    }

    #[test]
    fn test_regular_stops_at_end() {
        let mem = layout();
        let sc = Scale::new(4).unwrap();

        let stop = Regular::new(&mem, sc, BASE, Some(BASE + 0x38))
            .finish()
            .unwrap();
        assert_eq!(stop, Stop::End(BASE + 0x38));

        let stop = Regular::new(&mem, sc, BASE, Some(BASE + 0x30))
            .finish()
            .unwrap();
        assert_eq!(stop, Stop::End(BASE + 0x38));
    }

    #[test]
    fn test_regular_damaged_size() {
        let mut mem = layout();
        chunk(&mut mem, BASE + 0x20, 0, 0x1);
        let sc = Scale::new(4).unwrap();

        let err = Regular::new(&mem, sc, BASE, None).finish().unwrap_err();
        assert!(err.is_damage());
    }

    #[test]
    fn test_relation() {
        let sc = Scale::new(8).unwrap();
        let c = Chunk {
            at: 0x1000,
            prev_size: 0,
            raw: 0x31,
        };
        assert_eq!(c.relation(sc, 0x1008), (Relation::Head, -8));
        assert_eq!(c.relation(sc, 0x1010), (Relation::Chunk, 0));
        assert_eq!(c.relation(sc, 0x102f), (Relation::Chunk, 0x1f));
        assert_eq!(c.relation(sc, 0x1030).0, Relation::OutOf);
        assert_eq!(c.relation(sc, 0xfff).0, Relation::OutOf);
    }

    #[test]
    fn test_fast_chain() {
        let mut mem = layout();
        let sc = Scale::new(4).unwrap();
        // second fastbin member of the same size, linked from the first
        chunk(&mut mem, BASE + 0x80, 0, 0x21);
        chunk(&mut mem, BASE + 0xa0, 0, 0x9);
        mem.write_word(BASE + 0x8, 4, BASE + 0x80);
        mem.write_word(BASE + 0x88, 4, 0);

        let chain = fast_chain(&mem, sc, &Everything, BASE, 16).unwrap();
        assert_eq!(chain.iter().map(|c| c.at).collect::<Vec<_>>(), vec![BASE, BASE + 0x80]);

        // a loop is damage, not a hang
        mem.write_word(BASE + 0x88, 4, BASE);
        assert!(fast_chain(&mem, sc, &Everything, BASE, 16).unwrap_err().is_damage());
    }

    #[test]
    fn test_left_probe() {
        let mem = layout();
        let sc = Scale::new(4).unwrap();

        let found: Vec<u64> = left_probe(&mem, sc, BASE + 0x60, BASE)
            .map(|c| c.at)
            .collect();
        assert!(found.contains(&(BASE + 0x38)));
        assert!(found.contains(&(BASE + 0x20)));
        assert_eq!(found.last(), Some(&BASE));
    }
}
