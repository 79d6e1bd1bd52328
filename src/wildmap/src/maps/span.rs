//! Spans: ranges carrying a payload, optionally bound to a ring

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::exten::{Exten, Extension};
use super::range::{Edge, Range};
use crate::error::{Error, Result};

static NEXT_RING: AtomicU64 = AtomicU64::new(1);

/// Process unique identity of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingId(u64);

impl RingId {
    pub(crate) fn next() -> RingId {
        RingId(NEXT_RING.fetch_add(1, Ordering::Relaxed))
    }
}

/// Binding of a span to its ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId {
    pub ring: RingId,
    pub seq: u32,
}

/// Side kept by [`Span::cut`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Before,
    After,
}

/// Pieces selected by [`Span::split`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parts(u8);

impl Parts {
    pub const BEFORE: Parts = Parts(1);
    pub const AFTER: Parts = Parts(2);
    pub const SELF: Parts = Parts(4);
    pub const ALL: Parts = Parts(7);

    pub fn has(self, other: Parts) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Parts {
    type Output = Parts;

    fn bitor(self, rhs: Parts) -> Parts {
        Parts(self.0 | rhs.0)
    }
}

/// A range with an optional payload
///
/// Cloning a span yields a free copy, the binding never travels.
#[derive(Debug, PartialEq, Eq)]
pub struct Span {
    range: Range,
    exten: Option<Extension>,
    bind: Option<SpanId>,
}

impl Clone for Span {
    fn clone(&self) -> Self {
        Self {
            range: self.range,
            exten: self.exten.clone(),
            bind: None,
        }
    }
}

impl Span {
    /// Create a free span, the payload must accept the range
    pub fn new(range: Range, exten: Option<Extension>) -> Result<Span> {
        let mut exten = exten;
        if let Some(ext) = exten.as_mut() {
            if !ext.accept_extend(&range, false) {
                return Err(Error::Boundary {
                    span: range,
                    to: range,
                });
            }
        }

        Ok(Span {
            range,
            exten,
            bind: None,
        })
    }

    /// Free span without payload
    pub fn plain(range: Range) -> Span {
        Span {
            range,
            exten: None,
            bind: None,
        }
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn lo(&self) -> Option<u64> {
        self.range.lo()
    }

    pub fn hi(&self) -> Option<u64> {
        self.range.hi()
    }

    pub fn exten(&self) -> Option<&Extension> {
        self.exten.as_ref()
    }

    pub fn id(&self) -> Option<SpanId> {
        self.bind
    }

    pub fn seq(&self) -> Option<u32> {
        self.bind.map(|id| id.seq)
    }

    pub fn is_bound(&self) -> bool {
        self.bind.is_some()
    }

    /// Payload access for free spans only
    pub fn exten_mut(&mut self) -> Result<Option<&mut Extension>> {
        if self.bind.is_some() {
            return Err(Error::Bound);
        }
        Ok(self.exten.as_mut())
    }

    pub(crate) fn payload_mut(&mut self) -> Option<&mut Extension> {
        self.exten.as_mut()
    }

    pub(crate) fn bind(&mut self, id: SpanId) {
        self.bind = Some(id);
    }

    pub(crate) fn unbind(&mut self) {
        self.bind = None;
    }

    /// Move a free span to a new range that intersects the old one
    pub fn extend(&mut self, to: Range) -> Result<()> {
        if self.bind.is_some() {
            return Err(Error::Bound);
        }
        self.retarget(to)
    }

    pub(crate) fn retarget(&mut self, to: Range) -> Result<()> {
        if to.intersect(&self.range).is_none() && !to.inside(&self.range) {
            return Err(Error::OutOfRange {
                at: to,
                within: self.range,
            });
        }

        if let Some(ext) = self.exten.as_mut() {
            if !ext.accept_extend(&to, false) {
                return Err(Error::Boundary {
                    span: self.range,
                    to,
                });
            }
        }

        self.range = to;
        Ok(())
    }

    /// Split a free span at `at`, returning the dropped side
    ///
    /// The dropped span receives a subset of the payload. Nothing is
    /// returned when the dropped side is empty.
    pub fn cut(&mut self, at: u64, keep: Keep) -> Result<Option<Span>> {
        if self.bind.is_some() {
            return Err(Error::Bound);
        }
        self.sever(at, keep)
    }

    pub(crate) fn sever(&mut self, at: u64, keep: Keep) -> Result<Option<Span>> {
        let edge = Edge::At(at);
        if edge < self.range.lo_edge() || self.range.hi_edge() < edge {
            return Err(Error::OutOfRange {
                at: Range::point(at),
                within: self.range,
            });
        }

        let before = Range::from_edges(self.range.lo_edge(), edge);
        let after = Range::from_edges(edge, self.range.hi_edge());
        let (kept, dropped) = match keep {
            Keep::Before => (before, after),
            Keep::After => (after, before),
        };

        let piece = (!dropped.is_empty()).then(|| Span {
            range: dropped,
            exten: self.exten.as_ref().map(|ext| ext.subset(&dropped)),
            bind: None,
        });

        if let Some(ext) = self.exten.as_mut() {
            ext.accept_extend(&kept, true);
        }
        self.range = kept;

        Ok(piece)
    }

    /// Free copies of the pieces of this span around `by`
    ///
    /// Pieces come in address order, flagged true for the part inside
    /// `by`. Empty pieces are skipped.
    pub fn split(&self, by: &Range, parts: Parts) -> Vec<(bool, Span)> {
        let (lo, hi) = (self.range.lo_edge(), self.range.hi_edge());
        let (a, b) = (by.lo_edge().clamp(lo, hi), by.hi_edge().clamp(lo, hi));

        let pieces = [
            (Parts::BEFORE, false, lo, a),
            (Parts::SELF, true, a, b.max(a)),
            (Parts::AFTER, false, b.max(a), hi),
        ];

        pieces
            .into_iter()
            .filter(|&(part, _, x, y)| parts.has(part) && x < y)
            .map(|(_, mine, x, y)| {
                let range = Range::from_edges(x, y);
                let span = Span {
                    range,
                    exten: self.exten.as_ref().map(|ext| ext.subset(&range)),
                    bind: None,
                };
                (mine, span)
            })
            .collect()
    }

    pub fn describe(&self) -> String {
        match &self.exten {
            Some(ext) => format!("{} {}", self.range, ext.describe()),
            None => self.range.to_string(),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bind {
            Some(id) => write!(f, "#{} {}", id.seq, self.describe()),
            None => write!(f, "{}", self.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::alias::Alias;

    fn b(lo: u64, hi: u64) -> Range {
        Range::bounded(lo, hi).unwrap()
    }

    fn aliased(range: Range, points: &[u64]) -> Span {
        let alias = Alias::with_points(range, points.iter().copied()).unwrap();
        Span::new(range, Some(alias.into())).unwrap()
    }

    #[test]
    fn test_new_rejects_refused_payload() {
        let alias = Alias::with_points(b(0, 0x100), [0x80]).unwrap();
        assert!(matches!(
            Span::new(b(0, 0x40), Some(alias.into())),
            Err(Error::Boundary { .. })
        ));
    }

    #[test]
    fn test_cut_keep_after() {
        let mut span = aliased(b(0x100, 0x400), &[0x100, 0x200, 0x300]);
        let dropped = span.cut(0x200, Keep::After).unwrap().unwrap();

        assert_eq!(span.range(), b(0x200, 0x400));
        assert_eq!(dropped.range(), b(0x100, 0x200));
        assert_eq!(span.exten().unwrap().alias().unwrap().points(), &[0x200, 0x300]);
        assert_eq!(dropped.exten().unwrap().alias().unwrap().points(), &[0x100]);
    }

    #[test]
    fn test_cut_round_trip() {
        let original = b(0x1000, 0x2000);
        for at in [0x1001, 0x1800, 0x1fff] {
            let mut span = Span::plain(original);
            let dropped = span.cut(at, Keep::After).unwrap().unwrap();
            assert_eq!(dropped.range().merge(&span.range()), Some(original));
        }
    }

    #[test]
    fn test_cut_edges() {
        let mut span = Span::plain(b(0x10, 0x20));
        assert!(span.cut(0x10, Keep::After).unwrap().is_none());
        assert_eq!(span.range(), b(0x10, 0x20));

        let dropped = span.cut(0x20, Keep::After).unwrap().unwrap();
        assert_eq!(dropped.range(), b(0x10, 0x20));
        assert!(span.range().is_empty());

        assert!(matches!(
            span.cut(0x30, Keep::Before),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_cut_wild() {
        let mut span = Span::plain(Range::WILD);
        let dropped = span.cut(0x1000, Keep::After).unwrap().unwrap();
        assert_eq!(dropped.range(), Range::new(None, Some(0x1000)).unwrap());
        assert_eq!(span.range(), Range::new(Some(0x1000), None).unwrap());
    }

    #[test]
    fn test_split() {
        let span = aliased(b(0, 0x100), &[0x10, 0x50, 0xc0]);
        let parts = span.split(&b(0x40, 0x80), Parts::ALL);

        let ranges: Vec<_> = parts.iter().map(|(mine, s)| (*mine, s.range())).collect();
        assert_eq!(
            ranges,
            vec![(false, b(0, 0x40)), (true, b(0x40, 0x80)), (false, b(0x80, 0x100))]
        );
        assert_eq!(parts[1].1.exten().unwrap().alias().unwrap().points(), &[0x50]);

        let outer = span.split(&b(0x40, 0x80), Parts::BEFORE | Parts::AFTER);
        assert_eq!(outer.len(), 2);

        let inside = span.split(&b(0x200, 0x300), Parts::SELF);
        assert!(inside.is_empty());
    }

    #[test]
    fn test_extend_free() {
        let mut span = aliased(b(0x100, 0x200), &[0x180]);
        span.extend(b(0x80, 0x300)).unwrap();
        assert_eq!(span.range(), b(0x80, 0x300));

        assert!(matches!(
            span.extend(b(0x400, 0x500)),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            span.extend(b(0x80, 0x150)),
            Err(Error::Boundary { .. })
        ));
    }

    #[test]
    fn test_clone_unbinds() {
        let mut span = Span::plain(b(0, 1));
        span.bind(SpanId {
            ring: RingId::next(),
            seq: 1,
        });
        assert!(span.is_bound());
        assert!(!span.clone().is_bound());
        assert!(matches!(span.cut(0, Keep::After), Err(Error::Bound)));
    }
}
