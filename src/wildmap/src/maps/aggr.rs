//! Aggregators folding sweep events into intervals or per item coverage

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use super::range::{Edge, Range};
use super::sweep::{Aggregate, Event, Interval, Key};

/// Options of interval folding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// Also yield intervals below the depth threshold
    pub empty: bool,
    /// Mark a covered interval ending exactly where the next one starts
    pub brake: bool,
    /// Depth threshold of a covered interval
    pub cuts: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            empty: false,
            brake: false,
            cuts: 1,
        }
    }
}

impl Options {
    pub fn union() -> Self {
        Self::default()
    }

    pub fn isect() -> Self {
        Self {
            cuts: 2,
            ..Self::default()
        }
    }

    pub fn empty(mut self, empty: bool) -> Self {
        self.empty = empty;
        self
    }

    pub fn brake(mut self, brake: bool) -> Self {
        self.brake = brake;
        self
    }

    pub fn cuts(mut self, cuts: usize) -> Self {
        self.cuts = cuts.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Change,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Brake {
    Off,
    Armed,
    At(Edge),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Add,
    Del,
}

/// Interval folding behind both Change and Group
///
/// Change yields a new interval at every depth change while at or above
/// the threshold. Group merges connected runs at or above the threshold
/// and reports every item that took part in the run.
pub struct Flatten<T> {
    mode: Mode,
    empty: bool,
    brake: Brake,
    cuts: usize,
    last: Edge,
    view: BTreeMap<Key, T>,
    acts: BTreeMap<Key, T>,
}

impl<T: Clone> Flatten<T> {
    fn new(mode: Mode, opts: Options) -> Self {
        Self {
            mode,
            empty: opts.empty,
            brake: if opts.brake { Brake::Armed } else { Brake::Off },
            cuts: opts.cuts.max(1),
            last: Edge::NegInf,
            view: BTreeMap::new(),
            acts: BTreeMap::new(),
        }
    }

    pub fn change(opts: Options) -> Self {
        Self::new(Mode::Change, opts)
    }

    pub fn group(opts: Options) -> Self {
        Self::new(Mode::Group, opts)
    }

    fn above(&self) -> bool {
        self.cuts <= self.view.len()
    }

    fn plane(&self, up: usize) -> bool {
        self.cuts == self.view.len() + up
    }

    fn should(&self, kind: Option<Kind>) -> bool {
        let depth = self.view.len();
        let trig = match (self.mode, kind) {
            (_, None) => true,
            (_, Some(Kind::Add)) => depth + 1 == self.cuts,
            (Mode::Group, Some(Kind::Del)) => depth == self.cuts,
            (Mode::Change, Some(Kind::Del)) => false,
        };

        trig || (self.mode == Mode::Change && self.above())
    }

    fn emit(&mut self, at: Edge, out: &mut VecDeque<(Range, Vec<T>)>) {
        let acts = match self.mode {
            Mode::Change => &self.view,
            Mode::Group => &self.acts,
        };
        let empty = acts.len() < self.cuts;

        if (!empty || self.empty) && self.last < at {
            let items: Vec<T> = if empty {
                Vec::new()
            } else {
                acts.values().cloned().collect()
            };

            if let Brake::At(edge) = self.brake {
                if edge == self.last && !empty {
                    if let Edge::At(p) = edge {
                        out.push_back((Range::point(p), Vec::new()));
                    }
                }
                self.brake = Brake::Armed;
            }

            out.push_back((Range::from_edges(self.last, at), items));
        }

        self.last = at;
    }
}

impl<T: Clone> Aggregate<T> for Flatten<T> {
    type Out = (Range, Vec<T>);

    fn feed(&mut self, at: Edge, event: Event<T>, out: &mut VecDeque<Self::Out>) {
        let kind = match &event {
            Event::Start => {
                self.last = at;
                return;
            }
            Event::Add(..) => Some(Kind::Add),
            Event::Del(_) => Some(Kind::Del),
            Event::End => None,
        };

        if self.should(kind) {
            self.emit(at, out);
        }

        match event {
            Event::Start | Event::End => {
                debug_assert!(self.view.is_empty(), "items left at the end of a sweep");
            }
            Event::Add(key, item) => {
                self.view.insert(key, item.clone());

                if self.mode == Mode::Group {
                    if self.plane(0) {
                        self.acts = self.view.clone();
                    } else if self.above() {
                        self.acts.insert(key, item);
                    }
                }
            }
            Event::Del(key) => {
                self.view.remove(&key);

                if self.brake == Brake::Armed && self.plane(1) {
                    self.brake = Brake::At(self.last);
                }
                if self.mode == Mode::Group && self.plane(1) {
                    self.acts.clear();
                }
            }
        }
    }
}

/// Append `place` to a run list, joining it with a touching tail
fn join(regs: &mut Vec<Range>, place: Range) {
    if let Some(tail) = regs.last_mut() {
        debug_assert!(
            tail.hi_edge() <= place.lo_edge(),
            "run {} overlaps {}",
            tail,
            place
        );
        if tail.hi_edge() == place.lo_edge() {
            *tail = Range::from_edges(tail.lo_edge(), place.hi_edge());
            return;
        }
    }
    regs.push(place);
}

/// Item centric folding: per item, the sub-ranges at or above a depth
pub struct Align<T> {
    zero: bool,
    cuts: usize,
    last: Edge,
    map: BTreeMap<Key, (T, Vec<Range>)>,
}

impl<T> Align<T> {
    pub fn new(zero: bool, cuts: usize) -> Self {
        Self {
            zero,
            cuts: cuts.max(1),
            last: Edge::NegInf,
            map: BTreeMap::new(),
        }
    }
}

impl<T> Aggregate<T> for Align<T> {
    type Out = (T, Vec<Range>);

    fn feed(&mut self, at: Edge, event: Event<T>, out: &mut VecDeque<Self::Out>) {
        if let Event::Start = event {
            self.last = at;
            return;
        }

        if self.last < at {
            if self.map.len() >= self.cuts {
                let place = Range::from_edges(self.last, at);
                for (_, regs) in self.map.values_mut() {
                    join(regs, place);
                }
            }
            self.last = at;
        }

        match event {
            Event::Add(key, item) => {
                self.map.insert(key, (item, Vec::new()));
            }
            Event::Del(key) => {
                if let Some((item, regs)) = self.map.remove(&key) {
                    if !regs.is_empty() || self.zero {
                        out.push_back((item, regs));
                    }
                }
            }
            Event::Start | Event::End => {}
        }
    }
}

/// Re-keys a stream of `(range, items)` by item
///
/// An item is flushed with its joined runs once the stream has passed
/// its right edge.
pub struct Combine<T: Ord> {
    view: BTreeMap<T, Vec<Range>>,
    gone: BinaryHeap<Reverse<(Edge, T)>>,
}

impl<T: Ord + Clone + Interval> Default for Combine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + Interval> Combine<T> {
    pub fn new() -> Self {
        Self {
            view: BTreeMap::new(),
            gone: BinaryHeap::new(),
        }
    }

    pub fn feed(&mut self, place: Range, items: &[T], out: &mut VecDeque<(T, Vec<Range>)>) {
        for item in items {
            match self.view.get_mut(item) {
                Some(regs) => join(regs, place),
                None => {
                    self.view.insert(item.clone(), vec![place]);
                    self.gone
                        .push(Reverse((item.range().hi_edge(), item.clone())));
                }
            }
        }

        self.flush(place.hi_edge(), out);
    }

    /// Flush every remaining item
    pub fn finish(&mut self, out: &mut VecDeque<(T, Vec<Range>)>) {
        self.flush(Edge::PosInf, out);
    }

    fn flush(&mut self, upto: Edge, out: &mut VecDeque<(T, Vec<Range>)>) {
        while let Some(Reverse((hi, _))) = self.gone.peek() {
            if *hi > upto {
                break;
            }
            if let Some(Reverse((_, item))) = self.gone.pop() {
                if let Some(regs) = self.view.remove(&item) {
                    out.push_back((item, regs));
                }
            }
        }
    }
}
