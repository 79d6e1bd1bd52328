//! Boundary event sweep over several sorted interval streams
//!
//! Every input lane yields disjoint intervals in address order. The sweep
//! unrolls them into ADD and DEL events and merges the lanes through two
//! position keyed heaps. At one position all DEL events come before any
//! ADD event, so touching intervals are never seen covered at once. The
//! stream is framed by `Start(range.lo)` and `End(range.hi)`, positions in
//! between are clipped to the query range.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use super::range::{Edge, Range};
use super::span::Span;

/// Anything with an address range that a sweep can consume
pub trait Interval {
    fn range(&self) -> Range;
}

impl Interval for Span {
    fn range(&self) -> Range {
        Span::range(self)
    }
}

/// A span seen by a sweep, identified by ring and span index
#[derive(Debug, Clone, Copy)]
pub struct Hit<'a> {
    pub ring: usize,
    pub index: usize,
    pub span: &'a Span,
}

impl Hit<'_> {
    fn key(&self) -> (usize, usize) {
        (self.ring, self.index)
    }
}

impl PartialEq for Hit<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Hit<'_> {}

impl PartialOrd for Hit<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hit<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::hash::Hash for Hit<'_> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl Interval for Hit<'_> {
    fn range(&self) -> Range {
        self.span.range()
    }
}

/// Identity of an item inside a sweep: lane and position in that lane
pub type Key = (usize, usize);

#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    Start,
    Add(Key, T),
    Del(Key),
    End,
}

/// Consumer of a sweep event stream
pub trait Aggregate<T> {
    type Out;

    fn feed(&mut self, at: Edge, event: Event<T>, out: &mut VecDeque<Self::Out>);
}

struct Lane<'a, T> {
    items: Box<dyn Iterator<Item = T> + 'a>,
    current: Option<T>,
    seq: usize,
}

impl<T: Interval> Lane<'_, T> {
    /// Load the next item, returning its start edge
    fn advance(&mut self) -> Option<Edge> {
        let item = self.items.next()?;
        let lo = item.range().lo_edge();
        self.current = Some(item);
        Some(lo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Running,
    Done,
}

/// Merged event stream of several lanes
pub struct Sweep<'a, T> {
    range: Range,
    lanes: Vec<Lane<'a, T>>,
    start: BinaryHeap<Reverse<(Edge, usize)>>,
    end: BinaryHeap<Reverse<(Edge, usize)>>,
    phase: Phase,
}

impl<'a, T: Interval> Sweep<'a, T> {
    pub fn new(range: Range, lanes: Vec<Box<dyn Iterator<Item = T> + 'a>>) -> Self {
        let lanes = lanes
            .into_iter()
            .map(|items| Lane {
                items,
                current: None,
                seq: 0,
            })
            .collect();

        Self {
            range,
            lanes,
            start: BinaryHeap::new(),
            end: BinaryHeap::new(),
            phase: Phase::Fresh,
        }
    }

    /// Feed the stream into an aggregator
    pub fn fold<A: Aggregate<T>>(self, aggr: A) -> Folded<'a, T, A> {
        Folded {
            sweep: self,
            aggr,
            queue: VecDeque::new(),
        }
    }

    fn prime(&mut self) {
        for (k, lane) in self.lanes.iter_mut().enumerate() {
            if let Some(lo) = lane.advance() {
                self.start.push(Reverse((lo, k)));
            }
        }
    }

    fn take_del(&self) -> bool {
        match (self.end.peek(), self.start.peek()) {
            (Some(Reverse((d, _))), Some(Reverse((a, _)))) => d <= a,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

impl<T: Interval> Iterator for Sweep<'_, T> {
    type Item = (Edge, Event<T>);

    fn next(&mut self) -> Option<Self::Item> {
        match self.phase {
            Phase::Done => return None,
            Phase::Fresh => {
                self.prime();
                self.phase = Phase::Running;
                return Some((self.range.lo_edge(), Event::Start));
            }
            Phase::Running => {}
        }

        if self.take_del() {
            let Reverse((hi, k)) = self.end.pop()?;
            let lane = &mut self.lanes[k];
            let key = (k, lane.seq);

            if let Some(lo) = lane.advance() {
                lane.seq += 1;
                self.start.push(Reverse((lo, k)));
            }

            let at = hi.min(self.range.hi_edge());
            return Some((at, Event::Del(key)));
        }

        if let Some(Reverse((lo, k))) = self.start.pop() {
            let lane = &mut self.lanes[k];
            let item = lane.current.take()?;
            let key = (k, lane.seq);

            self.end.push(Reverse((item.range().hi_edge(), k)));

            let at = lo.max(self.range.lo_edge());
            return Some((at, Event::Add(key, item)));
        }

        self.phase = Phase::Done;
        Some((self.range.hi_edge(), Event::End))
    }
}

/// Aggregated sweep, yields whatever the aggregator produces
pub struct Folded<'a, T, A: Aggregate<T>> {
    sweep: Sweep<'a, T>,
    aggr: A,
    queue: VecDeque<A::Out>,
}

impl<T: Interval, A: Aggregate<T>> Iterator for Folded<'_, T, A> {
    type Item = A::Out;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(out) = self.queue.pop_front() {
                return Some(out);
            }
            let (at, event) = self.sweep.next()?;
            self.aggr.feed(at, event, &mut self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Iv(Range);

    impl Interval for Iv {
        fn range(&self) -> Range {
            self.0
        }
    }

    fn lane(ranges: &[(u64, u64)]) -> Box<dyn Iterator<Item = Iv>> {
        let items: Vec<Iv> = ranges
            .iter()
            .map(|&(lo, hi)| Iv(Range::bounded(lo, hi).unwrap()))
            .collect();
        Box::new(items.into_iter())
    }

    fn trace(range: Range, lanes: Vec<Box<dyn Iterator<Item = Iv>>>) -> Vec<(Edge, String)> {
        Sweep::new(range, lanes)
            .map(|(at, ev)| {
                let name = match ev {
                    Event::Start => "start".to_string(),
                    Event::Add((l, s), _) => format!("add {}.{}", l, s),
                    Event::Del((l, s)) => format!("del {}.{}", l, s),
                    Event::End => "end".to_string(),
                };
                (at, name)
            })
            .collect()
    }

    #[test]
    fn test_del_before_add() {
        let events = trace(
            Range::WILD,
            vec![lane(&[(0, 0x100)]), lane(&[(0x100, 0x200)])],
        );
        let names: Vec<_> = events.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["start", "add 0.0", "del 0.0", "add 1.0", "del 1.0", "end"]
        );
        assert_eq!(events[0].0, Edge::NegInf);
        assert_eq!(events[2].0, Edge::At(0x100));
        assert_eq!(events[3].0, Edge::At(0x100));
        assert_eq!(events[5].0, Edge::PosInf);
    }

    #[test]
    fn test_positions_clipped() {
        let events = trace(
            Range::bounded(0x80, 0x180).unwrap(),
            vec![lane(&[(0, 0x100), (0x100, 0x200)])],
        );
        let at: Vec<_> = events.iter().map(|(at, _)| *at).collect();
        assert_eq!(
            at,
            vec![
                Edge::At(0x80),
                Edge::At(0x80),
                Edge::At(0x100),
                Edge::At(0x100),
                Edge::At(0x180),
                Edge::At(0x180)
            ]
        );
        assert_eq!(events[3].1, "add 0.1");
    }

    #[test]
    fn test_no_lanes() {
        let events = trace(Range::WILD, vec![]);
        assert_eq!(
            events,
            vec![
                (Edge::NegInf, "start".to_string()),
                (Edge::PosInf, "end".to_string())
            ]
        );
    }
}
