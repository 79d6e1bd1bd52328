//! Alias points: known chunk starts inside a range
//!
//! Heap walkers cannot step backwards through chunks, so every address
//! proven to start a chunk is remembered here. A lookup then starts a
//! forward walk from the nearest point before the address of interest.

use super::exten::Exten;
use super::range::{Edge, Range};
use crate::error::{Error, Result};

/// Direction of the nearest alias point search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Near {
    Before,
    After,
}

/// Sorted set of alias points bound to a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    range: Range,
    points: Vec<u64>,
}

impl Alias {
    pub fn new(range: Range) -> Self {
        Self {
            range,
            points: Vec::new(),
        }
    }

    /// Create with initial points, every point must lie inside `range`
    pub fn with_points(range: Range, points: impl IntoIterator<Item = u64>) -> Result<Self> {
        let mut alias = Self::new(range);
        for at in points {
            alias.push(at)?;
        }
        Ok(alias)
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn points(&self) -> &[u64] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<u64> {
        self.points.first().copied()
    }

    pub fn last(&self) -> Option<u64> {
        self.points.last().copied()
    }

    fn check(&self, at: u64) -> Result<()> {
        if self.range.inside(&Range::point(at)) {
            Ok(())
        } else {
            Err(Error::OutOfRange {
                at: Range::point(at),
                within: self.range,
            })
        }
    }

    /// Record a chunk start, duplicates are ignored
    pub fn push(&mut self, at: u64) -> Result<()> {
        self.check(at)?;

        let k = self.points.partition_point(|&p| p <= at);
        if k == 0 || self.points[k - 1] != at {
            self.points.insert(k, at);
        }
        Ok(())
    }

    /// Find the alias point nearest to `at` in the given direction
    ///
    /// An exact hit is returned as is. Searching before the first point
    /// yields the range's lower bound, which may be unknown.
    pub fn lookup(&self, at: u64, near: Near) -> Result<Option<u64>> {
        self.check(at)?;

        let k = self.points.partition_point(|&p| p <= at);
        if k > 0 && self.points[k - 1] == at {
            return Ok(Some(at));
        }

        Ok(match near {
            Near::Before if k > 0 => Some(self.points[k - 1]),
            Near::Before => self.range.lo(),
            Near::After => self.points.get(k).copied(),
        })
    }

    /// Derive bounds of a fully unbounded region from its alias points
    pub fn catch(&self, hint: Option<u64>) -> Result<Range> {
        if !self.range.is_beast() {
            return Err(Error::analysis(format!(
                "only an unbounded region may be caught, got {}",
                self.range
            )));
        }

        let (first, last) = match (self.first(), self.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::analysis("no alias points to catch a region")),
        };

        Range::bounded(first, last.max(hint.unwrap_or(last)))
    }

    fn subset_points(&self, range: &Range) -> Vec<u64> {
        let a = range
            .lo()
            .map_or(0, |lo| self.points.partition_point(|&p| p < lo));
        let b = range
            .hi()
            .map_or(self.points.len(), |hi| self.points.partition_point(|&p| p < hi));

        self.points[a..b.max(a)].to_vec()
    }
}

impl Exten for Alias {
    fn describe(&self) -> String {
        format!("{} aliases", self.points.len())
    }

    fn subset(&self, range: &Range) -> Self {
        Self {
            range: *range,
            points: self.subset_points(range),
        }
    }

    fn accept_extend(&mut self, range: &Range, force: bool) -> bool {
        let fits = match (self.first(), self.last()) {
            (Some(first), Some(last)) => {
                range.lo_edge() <= Edge::At(first) && Edge::At(last) <= range.hi_edge()
            }
            _ => true,
        };

        if !fits {
            if !force {
                return false;
            }
            self.points = self.subset_points(range);
        }

        self.range = *range;
        true
    }
}
