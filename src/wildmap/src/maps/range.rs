//! Address ranges with optionally unbounded ends
//!
//! A [`Range`] is a half-open interval `[lo, hi)`. An absent `lo` stands
//! for minus infinity and an absent `hi` for plus infinity, so the fully
//! unbounded range describes the whole address line. All comparisons go
//! through [`Edge`], which places both infinities on one total order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

use crate::error::{Error, Result};

/// A position on the address line extended with both infinities
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Edge {
    NegInf,
    At(u64),
    PosInf,
}

impl Edge {
    /// Edge of a lower bound, absent means minus infinity
    pub fn lo(value: Option<u64>) -> Edge {
        value.map_or(Edge::NegInf, Edge::At)
    }

    /// Edge of an upper bound, absent means plus infinity
    pub fn hi(value: Option<u64>) -> Edge {
        value.map_or(Edge::PosInf, Edge::At)
    }

    /// Finite value, if any
    pub fn value(self) -> Option<u64> {
        match self {
            Edge::At(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::NegInf => write!(f, "-inf"),
            Edge::At(v) => write!(f, "{:#x}", v),
            Edge::PosInf => write!(f, "+inf"),
        }
    }
}

/// Sides of a range taken from the bounding range in [`Range::extend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Side(u8);

impl Side {
    pub const NONE: Side = Side(0);
    pub const LEFT: Side = Side(1);
    pub const RIGHT: Side = Side(2);
    pub const BOTH: Side = Side(3);

    pub fn left(self) -> bool {
        self.0 & Self::LEFT.0 != 0
    }

    pub fn right(self) -> bool {
        self.0 & Self::RIGHT.0 != 0
    }
}

impl BitOr for Side {
    type Output = Side;

    fn bitor(self, rhs: Side) -> Side {
        Side(self.0 | rhs.0)
    }
}

/// Half-open address interval with optional bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    lo: Option<u64>,
    hi: Option<u64>,
}

impl Range {
    /// The whole address line
    pub const WILD: Range = Range { lo: None, hi: None };

    /// Create a range, rejecting `lo > hi`
    pub fn new(lo: Option<u64>, hi: Option<u64>) -> Result<Range> {
        if Edge::lo(lo) > Edge::hi(hi) {
            return Err(Error::InvalidRange {
                lo: lo.unwrap_or(0),
                hi: hi.unwrap_or(u64::MAX),
            });
        }
        Ok(Range { lo, hi })
    }

    /// Create a fully bounded range
    pub fn bounded(lo: u64, hi: u64) -> Result<Range> {
        Self::new(Some(lo), Some(hi))
    }

    /// Single address range `[at, at + 1)`
    ///
    /// The last address has no representable end, its range is open above
    /// and still contains it.
    pub fn at(at: u64) -> Range {
        Range {
            lo: Some(at),
            hi: at.checked_add(1),
        }
    }

    /// Zero length range `[at, at)`
    pub fn point(at: u64) -> Range {
        Range {
            lo: Some(at),
            hi: Some(at),
        }
    }

    /// Build from two edges already known to be ordered
    pub(crate) fn from_edges(lo: Edge, hi: Edge) -> Range {
        debug_assert!(lo <= hi, "edges out of order: {} {}", lo, hi);
        Range {
            lo: lo.value(),
            hi: hi.value(),
        }
    }

    pub fn lo(&self) -> Option<u64> {
        self.lo
    }

    pub fn hi(&self) -> Option<u64> {
        self.hi
    }

    pub fn lo_edge(&self) -> Edge {
        Edge::lo(self.lo)
    }

    pub fn hi_edge(&self) -> Edge {
        Edge::hi(self.hi)
    }

    /// Both bounds are known
    pub fn is_bounded(&self) -> bool {
        self.lo.is_some() && self.hi.is_some()
    }

    /// At least one bound is unknown
    pub fn is_wild(&self) -> bool {
        !self.is_bounded()
    }

    /// Nothing is known about either bound
    pub fn is_beast(&self) -> bool {
        self.lo.is_none() && self.hi.is_none()
    }

    /// Length in bytes, `None` for unbounded ranges
    pub fn len(&self) -> Option<u64> {
        match (self.lo, self.hi) {
            (Some(lo), Some(hi)) => Some(hi - lo),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lo_edge() == self.hi_edge()
    }

    /// Emptiness of a raw pair: `None` when the pair is inverted
    pub fn empty(lo: Option<u64>, hi: Option<u64>) -> Option<bool> {
        let (lo, hi) = (Edge::lo(lo), Edge::hi(hi));
        if lo == hi {
            Some(true)
        } else if lo < hi {
            Some(false)
        } else {
            None
        }
    }

    pub fn contains(&self, at: u64) -> bool {
        self.lo_edge() <= Edge::At(at) && Edge::At(at) < self.hi_edge()
    }

    /// Common part of two ranges
    ///
    /// A zero length `by` is treated as a point: it intersects when the
    /// point lies inside `self` and the result is the point itself.
    pub fn intersect(&self, by: &Range) -> Option<Range> {
        if let (Some(lo), Some(hi)) = (by.lo, by.hi) {
            if lo == hi {
                return self.contains(lo).then_some(*by);
            }
        }

        let lo = self.lo_edge().max(by.lo_edge());
        let hi = self.hi_edge().min(by.hi_edge());

        (lo < hi).then(|| Range::from_edges(lo, hi))
    }

    pub fn intersects(&self, by: &Range) -> bool {
        self.intersect(by).is_some()
    }

    /// Whether `by` lies completely inside `self`
    pub fn inside(&self, by: &Range) -> bool {
        self.lo_edge() <= by.lo_edge() && by.hi_edge() <= self.hi_edge()
    }

    /// Take bounds of `by` on the requested sides, clip to it on others
    ///
    /// Returns `None` when clipping leaves an inverted range.
    pub fn extend(&self, by: &Range, side: Side) -> Option<Range> {
        let lo = if side.left() {
            by.lo_edge()
        } else {
            self.lo_edge().max(by.lo_edge())
        };
        let hi = if side.right() {
            by.hi_edge()
        } else {
            self.hi_edge().min(by.hi_edge())
        };

        (lo <= hi).then(|| Range::from_edges(lo, hi))
    }

    /// Union of two overlapping or touching ranges
    pub fn merge(&self, other: &Range) -> Option<Range> {
        if self.hi_edge() < other.lo_edge() || other.hi_edge() < self.lo_edge() {
            return None;
        }
        Some(Range::from_edges(
            self.lo_edge().min(other.lo_edge()),
            self.hi_edge().max(other.hi_edge()),
        ))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lo {
            Some(lo) => write!(f, "[{:#x}, ", lo)?,
            None => write!(f, "(-inf, ")?,
        }
        match self.hi {
            Some(hi) => write!(f, "{:#x})", hi),
            None => write!(f, "+inf)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rg(lo: Option<u64>, hi: Option<u64>) -> Range {
        Range::new(lo, hi).unwrap()
    }

    fn b(lo: u64, hi: u64) -> Range {
        Range::bounded(lo, hi).unwrap()
    }

    #[test]
    fn test_edge_order() {
        assert!(Edge::NegInf < Edge::At(0));
        assert!(Edge::At(u64::MAX) < Edge::PosInf);
        assert_eq!(Edge::lo(None), Edge::NegInf);
        assert_eq!(Edge::hi(None), Edge::PosInf);
    }

    #[test]
    fn test_new_rejects_inverted() {
        assert!(Range::new(Some(10), Some(0)).is_err());
        assert!(Range::new(Some(10), None).is_ok());
        assert!(Range::new(None, Some(0)).is_ok());
    }

    #[test]
    fn test_intersect() {
        assert_eq!(rg(None, Some(10)).intersect(&rg(Some(5), None)), Some(b(5, 10)));
        assert_eq!(b(0, 10).intersect(&b(5, 20)), Some(b(5, 10)));
        assert_eq!(b(0, 10).intersect(&b(10, 20)), None);
        assert_eq!(Range::WILD.intersect(&Range::WILD), Some(Range::WILD));
        assert_eq!(Range::WILD.intersect(&b(0, 10)), Some(b(0, 10)));
        assert_eq!(Range::WILD.intersect(&Range::point(0)), Some(Range::point(0)));
        assert_eq!(b(0, 10).intersect(&Range::point(10)), None);
    }

    #[test]
    fn test_inside() {
        assert!(Range::WILD.inside(&Range::WILD));
        assert!(Range::WILD.inside(&rg(None, Some(0))));
        assert!(Range::WILD.inside(&rg(Some(0), None)));
        assert!(b(0, 10).inside(&b(5, 10)));
        assert!(!b(0, 10).inside(&b(5, 20)));
        assert!(!b(0, 10).inside(&b(10, 20)));
        assert!(!b(0, 10).inside(&b(10, 11)));
    }

    #[test]
    fn test_extend() {
        assert_eq!(b(5, 10).extend(&b(0, 20), Side::NONE), Some(b(5, 10)));
        assert_eq!(b(5, 10).extend(&b(0, 20), Side::LEFT), Some(b(0, 10)));
        assert_eq!(b(5, 10).extend(&b(0, 20), Side::RIGHT), Some(b(5, 20)));
        assert_eq!(b(5, 10).extend(&b(0, 20), Side::BOTH), Some(b(0, 20)));
        assert_eq!(Range::WILD.extend(&b(0, 20), Side::LEFT), Some(b(0, 20)));
        assert_eq!(rg(None, Some(10)).extend(&b(0, 20), Side::LEFT), Some(b(0, 10)));
        assert_eq!(rg(Some(5), None).extend(&b(0, 20), Side::RIGHT), Some(b(5, 20)));
        assert_eq!(b(5, 10).extend(&rg(Some(0), None), Side::RIGHT), Some(rg(Some(5), None)));
        assert_eq!(b(5, 10).extend(&Range::WILD, Side::RIGHT), Some(rg(Some(5), None)));
        assert_eq!(b(5, 10).extend(&Range::WILD, Side::BOTH), Some(Range::WILD));
        assert_eq!(b(5, 10).extend(&b(20, 30), Side::NONE), None);
    }

    #[test]
    fn test_empty() {
        assert_eq!(Range::empty(Some(0), Some(0)), Some(true));
        assert_eq!(Range::empty(Some(0), Some(10)), Some(false));
        assert_eq!(Range::empty(Some(10), Some(0)), None);
        assert_eq!(Range::empty(None, None), Some(false));
        assert_eq!(Range::empty(None, Some(0)), Some(false));
        assert_eq!(Range::empty(Some(1), None), Some(false));
    }

    #[test]
    fn test_len_and_wild() {
        assert_eq!(b(0x100, 0x400).len(), Some(0x300));
        assert_eq!(rg(None, Some(4)).len(), None);
        assert!(Range::WILD.is_beast());
        assert!(rg(Some(1), None).is_wild());
        assert!(!rg(Some(1), None).is_beast());
        assert!(b(1, 2).is_bounded());
    }

    #[test]
    fn test_at_top_of_space() {
        let top = Range::at(u64::MAX);
        assert_eq!(top.hi(), None);
        assert!(top.contains(u64::MAX));
        assert!(!top.contains(u64::MAX - 1));
        assert_eq!(top.len(), None);

        assert_eq!(Range::at(0x10), b(0x10, 0x11));
    }

    #[test]
    fn test_merge() {
        assert_eq!(b(0, 10).merge(&b(10, 20)), Some(b(0, 20)));
        assert_eq!(b(0, 10).merge(&b(11, 20)), None);
        assert_eq!(rg(None, Some(5)).merge(&b(0, 20)), Some(rg(None, Some(20))));
    }

    #[test]
    fn test_display() {
        assert_eq!(b(0, 0x100).to_string(), "[0x0, 0x100)");
        assert_eq!(Range::WILD.to_string(), "(-inf, +inf)");
    }
}
