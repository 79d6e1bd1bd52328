//! Rings: address sorted sets of disjoint spans
//!
//! A ring owns its spans. Mutation goes through the ring so that order and
//! disjointness are checked against neighbours, and every mutation bumps a
//! counter. Borrowing iterators are protected by the borrow checker, the
//! detached [`Cursor`] and [`Transaction`] check the counter instead.

use std::collections::{BTreeSet, HashMap};

use super::exten::Extension;
use super::range::{Edge, Range};
use super::span::{Keep, RingId, Span, SpanId};
use super::trans::Transaction;
use crate::error::{Error, Result};

/// How a ring lookup matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    /// The span contains the address
    Exact,
    /// The nearest span after the address
    Near,
}

/// Change of a ring made by a measured operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub count: i64,
    pub bytes: i64,
}

/// Sequence numbers starting at 1, released numbers are reused first
#[derive(Debug)]
struct SeqGen {
    next: u32,
    free: BTreeSet<u32>,
}

impl SeqGen {
    fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    fn take(&mut self) -> u32 {
        match self.free.pop_first() {
            Some(seq) => seq,
            None => {
                let seq = self.next;
                self.next += 1;
                seq
            }
        }
    }

    fn release(&mut self, seq: u32) {
        self.free.insert(seq);
    }
}

#[derive(Debug)]
pub struct Ring {
    id: RingId,
    spans: Vec<Span>,
    seqs: SeqGen,
    by_seq: HashMap<u32, u64>,
    scn: u64,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl Ring {
    pub fn new() -> Self {
        Self {
            id: RingId::next(),
            spans: Vec::new(),
            seqs: SeqGen::new(),
            by_seq: HashMap::new(),
            scn: 0,
        }
    }

    /// Build a ring from free spans
    pub fn from_spans(spans: impl IntoIterator<Item = Span>) -> Result<Self> {
        let mut ring = Self::new();
        for span in spans {
            ring.push(span)?;
        }
        Ok(ring)
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    /// Mutation counter
    pub fn scn(&self) -> u64 {
        self.scn
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Span> {
        self.spans.iter()
    }

    pub fn as_slice(&self) -> &[Span] {
        &self.spans
    }

    /// Index span `[x0, x1)` of spans intersecting `range`
    pub(crate) fn locate(&self, range: &Range) -> (usize, usize) {
        let lo = range.lo_edge();
        let hi = range.hi_edge();

        let x0 = self.spans.partition_point(|s| s.range().hi_edge() <= lo);
        let x1 = if range.is_empty() {
            self.spans.partition_point(|s| s.range().lo_edge() <= lo)
        } else {
            self.spans.partition_point(|s| s.range().lo_edge() < hi)
        };

        (x0, x1.max(x0))
    }

    fn check_free(&self, range: &Range) -> Result<usize> {
        if !range.is_bounded() {
            return Err(Error::Unbounded { range: *range });
        }

        let (x0, x1) = self.locate(range);
        let taken = self.spans[x0..x1]
            .iter()
            .any(|s| s.range().intersects(range) || range.intersects(&s.range()));
        if taken {
            return Err(Error::Conflict { range: *range });
        }
        Ok(x0)
    }

    /// Check that a batch of free spans could be pushed
    pub(crate) fn check_batch(&self, spans: &[&Span]) -> Result<()> {
        for pair in spans.windows(2) {
            let (a, b) = (pair[0].range(), pair[1].range());
            if a.intersects(&b) || b.intersects(&a) {
                return Err(Error::Conflict { range: b });
            }
        }
        for span in spans {
            if span.is_bound() {
                return Err(Error::Bound);
            }
            self.check_free(&span.range())?;
        }
        Ok(())
    }

    /// Bind a free span into the ring
    pub fn push(&mut self, mut span: Span) -> Result<SpanId> {
        if span.is_bound() {
            return Err(Error::Bound);
        }

        let range = span.range();
        let at = self.check_free(&range)?;
        let lo = range.lo().ok_or(Error::Unbounded { range })?;

        let id = SpanId {
            ring: self.id,
            seq: self.seqs.take(),
        };
        span.bind(id);

        self.by_seq.insert(id.seq, lo);
        self.spans.insert(at, span);
        self.scn += 1;
        Ok(id)
    }

    /// Create a span and push it
    pub fn make(&mut self, range: Range, exten: Option<Extension>) -> Result<SpanId> {
        self.push(Span::new(range, exten)?)
    }

    fn index_of(&self, id: SpanId) -> Result<usize> {
        if id.ring != self.id {
            return Err(Error::NotBound);
        }
        let lo = *self.by_seq.get(&id.seq).ok_or(Error::NotBound)?;
        let at = self
            .spans
            .partition_point(|s| s.range().lo_edge() < Edge::At(lo));

        match self.spans.get(at) {
            Some(span) if span.id() == Some(id) => Ok(at),
            _ => Err(Error::NotBound),
        }
    }

    pub fn get(&self, id: SpanId) -> Option<&Span> {
        self.index_of(id).ok().map(|at| &self.spans[at])
    }

    /// Find a span by its sequence number
    pub fn by_seq(&self, seq: u32) -> Option<&Span> {
        self.get(SpanId { ring: self.id, seq })
    }

    /// Unbind a span, its sequence number becomes free
    pub fn pop(&mut self, id: SpanId) -> Result<Span> {
        let at = self.index_of(id)?;
        let mut span = self.spans.remove(at);
        span.unbind();

        self.by_seq.remove(&id.seq);
        self.seqs.release(id.seq);
        self.scn += 1;
        Ok(span)
    }

    /// Span containing `at`, or with `exact` unset the next one after it
    pub fn lookup(&self, at: u64, exact: bool) -> Option<(Match, &Span)> {
        let x = self
            .spans
            .partition_point(|s| s.range().hi_edge() <= Edge::At(at));
        let span = self.spans.get(x)?;

        if span.range().contains(at) {
            Some((Match::Exact, span))
        } else if !exact {
            Some((Match::Near, span))
        } else {
            None
        }
    }

    /// Spans intersecting `range` in address order
    pub fn spans(&self, range: &Range) -> std::slice::Iter<'_, Span> {
        let (x0, x1) = self.locate(range);
        self.spans[x0..x1].iter()
    }

    /// Spans intersecting `range` with their index in the ring
    pub fn spans_indexed<'a>(
        &'a self,
        range: &Range,
    ) -> impl DoubleEndedIterator<Item = (usize, &'a Span)> + 'a {
        let (x0, x1) = self.locate(range);
        self.spans[x0..x1]
            .iter()
            .enumerate()
            .map(move |(k, span)| (x0 + k, span))
    }

    /// Filtered enumeration in either direction
    pub fn select<'a, P>(
        &'a self,
        range: &Range,
        pred: P,
        reverse: bool,
    ) -> Box<dyn Iterator<Item = &'a Span> + 'a>
    where
        P: Fn(&Span) -> bool + 'a,
    {
        let spans = self.spans(range);
        if reverse {
            Box::new(spans.rev().filter(move |s| pred(s)))
        } else {
            Box::new(spans.filter(move |s| pred(s)))
        }
    }

    /// Detached enumeration that survives releasing the borrow
    pub fn cursor(&self, range: &Range, reverse: bool) -> Cursor {
        let (next, end) = self.locate(range);
        Cursor {
            ring: self.id,
            range: *range,
            scn: self.scn,
            next,
            end,
            reverse,
        }
    }

    /// Range from the first span start to the last span end
    pub fn bound(&self) -> Option<Range> {
        let first = self.spans.first()?;
        let last = self.spans.last()?;
        Some(Range::from_edges(
            first.range().lo_edge(),
            last.range().hi_edge(),
        ))
    }

    /// Total length of all spans
    pub fn bytes(&self) -> u64 {
        self.spans.iter().filter_map(|s| s.range().len()).sum()
    }

    /// Free room around `place`
    ///
    /// When `place` touches no span the surrounding gap is returned. When
    /// it covers every span it touches, the gap between the neighbours of
    /// those spans is returned. Otherwise there is no room.
    pub fn wider(&self, place: &Range) -> Option<Range> {
        let (x0, x1) = self.locate(place);

        if x0 < x1 {
            let first = self.spans[x0].range();
            let last = self.spans[x1 - 1].range();
            if first.lo_edge() < place.lo_edge() || place.hi_edge() < last.hi_edge() {
                return None;
            }
        }

        let lo = x0
            .checked_sub(1)
            .map_or(Edge::NegInf, |x| self.spans[x].range().hi_edge());
        let hi = self
            .spans
            .get(x1)
            .map_or(Edge::PosInf, |s| s.range().lo_edge());

        (lo <= hi).then(|| Range::from_edges(lo, hi))
    }

    /// Move a bound span to `to`, neighbours must stay clear
    pub fn extend(&mut self, id: SpanId, to: Range) -> Result<()> {
        let at = self.index_of(id)?;
        if !to.is_bounded() {
            return Err(Error::Unbounded { range: to });
        }

        let span = self.spans[at].range();
        let left = at
            .checked_sub(1)
            .map_or(Edge::NegInf, |x| self.spans[x].range().hi_edge());
        let right = self
            .spans
            .get(at + 1)
            .map_or(Edge::PosInf, |s| s.range().lo_edge());

        if to.lo_edge() < left || right < to.hi_edge() {
            return Err(Error::Boundary { span, to });
        }

        self.spans[at].retarget(to)?;
        if let Some(lo) = to.lo() {
            self.by_seq.insert(id.seq, lo);
        }
        self.scn += 1;
        Ok(())
    }

    /// Cut a bound span, the dropped side is returned free
    ///
    /// A span cut down to zero length leaves the ring.
    pub fn cut(&mut self, id: SpanId, at: u64, keep: Keep) -> Result<Option<Span>> {
        let x = self.index_of(id)?;
        let dropped = self.spans[x].sever(at, keep)?;

        if self.spans[x].range().is_empty() {
            self.spans.remove(x);
            self.by_seq.remove(&id.seq);
            self.seqs.release(id.seq);
        } else if let Some(lo) = self.spans[x].lo() {
            self.by_seq.insert(id.seq, lo);
        }

        self.scn += 1;
        Ok(dropped)
    }

    /// Update the payload of a bound span in place
    pub fn update<T>(
        &mut self,
        id: SpanId,
        f: impl FnOnce(&mut Extension) -> T,
    ) -> Result<Option<T>> {
        let x = self.index_of(id)?;
        let out = self.spans[x].payload_mut().map(f);
        self.scn += 1;
        Ok(out)
    }

    /// Start a transaction against the current state
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.id, self.scn)
    }

    /// Run `f` and report how much it changed this ring
    pub fn measure<T>(&mut self, f: impl FnOnce(&mut Ring) -> T) -> (T, Delta) {
        let start = Measure::start(self);
        let out = f(self);
        (out, start.finish(self))
    }
}

impl<'a> IntoIterator for &'a Ring {
    type Item = &'a Span;
    type IntoIter = std::slice::Iter<'a, Span>;

    fn into_iter(self) -> Self::IntoIter {
        self.spans.iter()
    }
}

/// Size snapshot of a ring
#[derive(Debug, Clone, Copy)]
pub struct Measure {
    count: usize,
    bytes: u64,
}

impl Measure {
    pub fn start(ring: &Ring) -> Self {
        Self {
            count: ring.len(),
            bytes: ring.bytes(),
        }
    }

    pub fn finish(self, ring: &Ring) -> Delta {
        Delta {
            count: ring.len() as i64 - self.count as i64,
            bytes: ring.bytes() as i64 - self.bytes as i64,
        }
    }
}

/// Restartable enumeration detached from the ring borrow
#[derive(Debug, Clone)]
pub struct Cursor {
    ring: RingId,
    range: Range,
    scn: u64,
    next: usize,
    end: usize,
    reverse: bool,
}

impl Cursor {
    /// Next span, failing when the ring changed since the cursor started
    pub fn next<'a>(&mut self, ring: &'a Ring) -> Result<Option<&'a Span>> {
        if ring.id != self.ring {
            return Err(Error::NotBound);
        }
        if ring.scn != self.scn {
            return Err(Error::OutOfSync);
        }
        if self.next >= self.end {
            return Ok(None);
        }

        let at = if self.reverse {
            self.end -= 1;
            self.end
        } else {
            self.next += 1;
            self.next - 1
        };
        Ok(Some(&ring.spans[at]))
    }

    /// Start over against the ring's current state
    pub fn restart(&mut self, ring: &Ring) {
        *self = ring.cursor(&self.range, self.reverse);
    }
}
