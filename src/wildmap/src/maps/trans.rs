//! Buffered ring insertions applied all at once

use super::exten::Extension;
use super::range::Range;
use super::ring::Ring;
use super::span::{RingId, Span, SpanId};
use crate::error::{Error, Result};

/// Pending pushes against a snapshot of one ring
///
/// The transaction holds no borrow of its ring. Commit fails as a whole
/// when the ring changed since [`Ring::begin`] or when any pending span
/// would conflict. Dropping the transaction discards it.
#[derive(Debug)]
#[must_use = "a transaction does nothing unless committed"]
pub struct Transaction {
    ring: RingId,
    scn: u64,
    pending: Vec<Span>,
}

impl Transaction {
    pub(crate) fn new(ring: RingId, scn: u64) -> Self {
        Self {
            ring,
            scn,
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, span: Span) -> Result<()> {
        if span.is_bound() {
            return Err(Error::Bound);
        }
        let range = span.range();
        if !range.is_bounded() {
            return Err(Error::Unbounded { range });
        }
        self.pending.push(span);
        Ok(())
    }

    pub fn make(&mut self, range: Range, exten: Option<Extension>) -> Result<()> {
        self.push(Span::new(range, exten)?)
    }

    pub fn pending(&self) -> &[Span] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Total length of pending spans
    pub fn bytes(&self) -> u64 {
        self.pending.iter().filter_map(|s| s.range().len()).sum()
    }

    /// Apply every pending span or none of them
    pub fn commit(mut self, ring: &mut Ring) -> Result<Vec<SpanId>> {
        if ring.id() != self.ring {
            return Err(Error::NotBound);
        }
        if ring.scn() != self.scn {
            return Err(Error::OutOfSync);
        }

        self.pending.sort_by_key(|s| s.range().lo_edge());
        let order: Vec<&Span> = self.pending.iter().collect();
        ring.check_batch(&order)?;

        self.pending
            .into_iter()
            .map(|span| ring.push(span))
            .collect()
    }

    /// Discard pending spans
    pub fn abort(self) {}
}
