//! Chunk size predicates

use serde::{Deserialize, Serialize};

use crate::maps::Range;

/// Requested allocation sizes a chunk listing is restricted to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SizePred {
    #[default]
    Any,
    /// Sizes in `[lo, hi)`, no upper limit when `hi` is unset
    Range(u64, Option<u64>),
    OneOf(Vec<u64>),
}

impl SizePred {
    /// Bind the predicate to an allocator's size rounding
    pub fn prepare(&self, round: impl Fn(u64) -> u64) -> SizeFilter {
        let aligned = match self {
            SizePred::Any => Vec::new(),
            SizePred::Range(lo, hi) => {
                let mut bounds = vec![round(*lo)];
                bounds.extend(hi.map(&round));
                bounds
            }
            SizePred::OneOf(sizes) => {
                let mut sizes: Vec<u64> = sizes.iter().map(|&s| round(s)).collect();
                sizes.sort_unstable();
                sizes.dedup();
                sizes
            }
        };

        SizeFilter {
            pred: self.clone(),
            aligned,
        }
    }
}

/// A [`SizePred`] prepared for one allocator
#[derive(Debug, Clone)]
pub struct SizeFilter {
    pred: SizePred,
    aligned: Vec<u64>,
}

impl SizeFilter {
    /// Whether any chunk with a size inside `class` may match
    pub fn precheck(&self, class: &Range) -> bool {
        match &self.pred {
            SizePred::Any => true,
            SizePred::Range(..) => {
                let lo = self.aligned.first().copied();
                let hi = self.aligned.get(1).copied();
                match Range::new(lo, hi) {
                    Ok(range) if !range.is_empty() => range.intersects(class),
                    _ => false,
                }
            }
            SizePred::OneOf(_) => self.aligned.iter().any(|&s| class.contains(s)),
        }
    }

    /// Whether a chunk of the allocator's reported `size` matches
    pub fn matches(&self, size: u64) -> bool {
        match &self.pred {
            SizePred::Any => true,
            SizePred::Range(lo, hi) => *lo <= size && hi.map_or(true, |hi| size < hi),
            SizePred::OneOf(_) => self.aligned.binary_search(&size).is_ok(),
        }
    }
}
