//! Multi ring queries built on the sweep engine

use std::collections::VecDeque;
use std::ops::BitOr;

use super::aggr::{Align, Combine, Flatten, Options};
use super::range::Range;
use super::ring::Ring;
use super::span::Span;
use super::sweep::{Folded, Hit, Interval, Sweep};

/// Span filter applied before spans reach a sweep
pub type Pred = fn(&Span) -> bool;

/// Sweeps over a fixed set of rings
#[derive(Clone)]
pub struct Walk<'a> {
    rings: Vec<&'a Ring>,
}

impl<'a> Walk<'a> {
    pub fn new(rings: impl IntoIterator<Item = &'a Ring>) -> Self {
        Self {
            rings: rings.into_iter().collect(),
        }
    }

    pub fn rings(&self) -> &[&'a Ring] {
        &self.rings
    }

    fn sweep(&self, range: Range, pred: Option<Pred>) -> Sweep<'a, Hit<'a>> {
        let lanes = self
            .rings
            .iter()
            .enumerate()
            .map(|(k, ring)| {
                let hits = ring
                    .spans_indexed(&range)
                    .filter(move |(_, span)| pred.map_or(true, |p| p(span)))
                    .map(move |(index, span)| Hit {
                        ring: k,
                        index,
                        span,
                    });
                Box::new(hits) as Box<dyn Iterator<Item = Hit<'a>> + 'a>
            })
            .collect();

        Sweep::new(range, lanes)
    }

    /// Interval at every depth change
    pub fn change(
        &self,
        range: Range,
        pred: Option<Pred>,
        opts: Options,
    ) -> Folded<'a, Hit<'a>, Flatten<Hit<'a>>> {
        self.sweep(range, pred).fold(Flatten::change(opts))
    }

    /// Connected runs with every span that took part
    pub fn group(
        &self,
        range: Range,
        pred: Option<Pred>,
        opts: Options,
    ) -> Folded<'a, Hit<'a>, Flatten<Hit<'a>>> {
        self.sweep(range, pred).fold(Flatten::group(opts))
    }

    /// Per span, the sub-ranges covered by at least `cuts` spans
    pub fn align(
        &self,
        range: Range,
        pred: Option<Pred>,
        zero: bool,
        cuts: usize,
    ) -> Folded<'a, Hit<'a>, Align<Hit<'a>>> {
        self.sweep(range, pred).fold(Align::new(zero, cuts))
    }

    /// Spans of all rings in group order
    pub fn order(&self, range: Range, pred: Option<Pred>) -> impl Iterator<Item = Hit<'a>> + 'a {
        self.group(range, pred, Options::union())
            .flat_map(|(_, hits)| hits)
    }
}

/// Diff classes and class masks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Class(u8);

impl Class {
    pub const NONE: Class = Class(0);
    pub const ONE: Class = Class(1);
    pub const TWO: Class = Class(2);
    pub const ISECT: Class = Class(4);
    pub const ANY: Class = Class(3);
    pub const ALL: Class = Class(7);

    pub fn matches(self, mask: Class) -> bool {
        self.0 & mask.0 != 0
    }

    pub fn name(self) -> &'static str {
        match self {
            Class::NONE => "none",
            Class::ONE => "one",
            Class::TWO => "two",
            Class::ISECT => "isect",
            _ => "mixed",
        }
    }
}

impl BitOr for Class {
    type Output = Class;

    fn bitor(self, rhs: Class) -> Class {
        Class(self.0 | rhs.0)
    }
}

/// Interval produced by one side of a diff
#[derive(Debug, Clone)]
struct Tag<'a> {
    side: usize,
    range: Range,
    hits: Vec<Hit<'a>>,
}

impl Interval for Tag<'_> {
    fn range(&self) -> Range {
        self.range
    }
}

/// Interval of a diff with the spans of both sides
#[derive(Debug, Clone)]
pub struct DiffItem<'a> {
    pub class: Class,
    pub range: Range,
    pub one: Vec<Hit<'a>>,
    pub two: Vec<Hit<'a>>,
}

/// Set algebra over two groups of rings
#[derive(Clone)]
pub struct Diff<'a> {
    sides: [(Walk<'a>, Option<Pred>); 2],
}

impl<'a> Diff<'a> {
    pub fn new(one: Walk<'a>, two: Walk<'a>) -> Self {
        Self {
            sides: [(one, None), (two, None)],
        }
    }

    /// Filter spans of each side
    pub fn filter(mut self, one: Option<Pred>, two: Option<Pred>) -> Self {
        self.sides[0].1 = one;
        self.sides[1].1 = two;
        self
    }

    /// Classify every interval of `range` by the sides covering it
    pub fn run(
        &self,
        range: Range,
        empty: bool,
        what: Class,
    ) -> impl Iterator<Item = DiffItem<'a>> + 'a {
        let lanes = self
            .sides
            .iter()
            .enumerate()
            .map(|(side, (walk, pred))| {
                let tags = walk
                    .change(range, *pred, Options::union().empty(empty))
                    .map(move |(range, hits)| Tag { side, range, hits });
                Box::new(tags) as Box<dyn Iterator<Item = Tag<'a>> + 'a>
            })
            .collect();

        Sweep::new(range, lanes)
            .fold(Flatten::change(Options::union()))
            .filter_map(move |(range, tags)| {
                let mut class = Class::NONE;
                let mut sides: [Vec<Hit<'a>>; 2] = [Vec::new(), Vec::new()];

                for tag in tags {
                    if !tag.hits.is_empty() {
                        let bit = if tag.side == 0 { Class::ONE } else { Class::TWO };
                        class = class | bit;
                    }
                    sides[tag.side] = tag.hits;
                }
                if class == Class::ANY {
                    class = Class::ISECT;
                }

                let [one, two] = sides;
                (class.matches(what) || (class == Class::NONE && empty)).then_some(DiffItem {
                    class,
                    range,
                    one,
                    two,
                })
            })
    }
}

/// Per span coverage of the first side of a diff by the second one
pub struct OneBy<'a> {
    diff: Diff<'a>,
}

impl<'a> OneBy<'a> {
    pub fn new(one: Walk<'a>, two: Walk<'a>) -> Self {
        Self {
            diff: Diff::new(one, two),
        }
    }

    pub fn from_diff(diff: Diff<'a>) -> Self {
        Self { diff }
    }

    /// Sub-ranges of each span of the first side that are covered by the
    /// second side with `isect`, or not covered by it otherwise
    pub fn run(
        &self,
        range: Range,
        isect: bool,
    ) -> impl Iterator<Item = (Hit<'a>, Vec<Range>)> + 'a {
        let what = if isect { Class::ISECT } else { Class::ONE };
        let mut items = self.diff.run(range, false, what);
        let mut combine = Combine::new();
        let mut queue = VecDeque::new();
        let mut done = false;

        std::iter::from_fn(move || loop {
            if let Some(out) = queue.pop_front() {
                return Some(out);
            }
            if done {
                return None;
            }
            match items.next() {
                Some(item) => combine.feed(item.range, &item.one, &mut queue),
                None => {
                    combine.finish(&mut queue);
                    done = true;
                }
            }
        })
    }
}

/// Change sweep keeping the best scored span of every interval
///
/// Consecutive intervals won by the same span are merged. Uncovered
/// intervals are reported without a span, except a trailing one.
pub struct Glide<'a> {
    walk: Walk<'a>,
}

impl<'a> Glide<'a> {
    pub fn new(walk: Walk<'a>) -> Self {
        Self { walk }
    }

    pub fn run<S>(
        &self,
        range: Range,
        pred: Option<Pred>,
        score: S,
    ) -> impl Iterator<Item = (Range, Option<Hit<'a>>)> + 'a
    where
        S: Fn(&Hit<'a>) -> i64 + 'a,
    {
        let mut rows = self.walk.change(range, pred, Options::union().empty(true));
        let mut place: Option<Range> = None;
        let mut last: Option<Hit<'a>> = None;
        let mut done = false;

        std::iter::from_fn(move || {
            if done {
                return None;
            }
            for (rg, hits) in rows.by_ref() {
                let best = hits.iter().map(&score).min();
                let winners: Vec<Hit<'a>> = hits
                    .into_iter()
                    .filter(|hit| Some(score(hit)) == best)
                    .collect();

                match (place, last) {
                    (Some(at), Some(hit)) if winners.contains(&hit) => {
                        place = Some(Range::from_edges(at.lo_edge(), rg.hi_edge()));
                    }
                    (prev, prev_hit) => {
                        place = Some(rg);
                        last = winners.first().copied();
                        if let Some(prev) = prev {
                            return Some((prev, prev_hit));
                        }
                    }
                }
            }

            done = true;
            match (place, last) {
                (Some(at), Some(hit)) => Some((at, Some(hit))),
                _ => None,
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn b(lo: u64, hi: u64) -> Range {
        Range::bounded(lo, hi).unwrap()
    }

    fn ring(ranges: &[(u64, u64)]) -> Ring {
        Ring::from_spans(ranges.iter().map(|&(lo, hi)| Span::plain(b(lo, hi)))).unwrap()
    }

    /// Four overlapping rings shared by the sweep tests
    pub(crate) fn fixture() -> [Ring; 4] {
        [
            ring(&[(0x000, 0x100), (0x400, 0x500), (0x600, 0x800), (0xb00, 0xc00), (0xd00, 0xe00)]),
            ring(&[
                (0x100, 0x400),
                (0x510, 0x580),
                (0x700, 0x900),
                (0xb00, 0xc20),
                (0xd00, 0xe00),
                (0xe80, 0xf00),
            ]),
            ring(&[(0xb00, 0xc20), (0xd80, 0xf00)]),
            ring(&[(0x600, 0x680), (0x700, 0x780), (0xa00, 0xc10), (0xd50, 0xf00)]),
        ]
    }

    fn lo(range: Range) -> Option<u64> {
        range.lo()
    }

    fn rg(lo: Option<u64>, hi: Option<u64>) -> Range {
        Range::new(lo, hi).unwrap()
    }

    type Row = (Range, usize);

    const BRAKE: usize = usize::MAX;

    fn plain() -> Vec<Row> {
        vec![
            (rg(None, Some(0)), 0),
            (b(0x000, 0x100), 1),
            (Range::point(0x100), BRAKE),
            (b(0x100, 0x400), 1),
            (Range::point(0x400), BRAKE),
            (b(0x400, 0x500), 1),
            (b(0x500, 0x510), 0),
            (b(0x510, 0x580), 1),
            (b(0x580, 0x600), 0),
            (b(0x600, 0x700), 1),
            (b(0x700, 0x800), 2),
            (b(0x800, 0x900), 1),
            (b(0x900, 0xb00), 0),
            (b(0xb00, 0xc00), 3),
            (b(0xc00, 0xc20), 2),
            (b(0xc20, 0xd00), 0),
            (b(0xd00, 0xd80), 2),
            (b(0xd80, 0xe00), 3),
            (b(0xe00, 0xe80), 1),
            (b(0xe80, 0xf00), 2),
            (rg(Some(0xf00), None), 0),
        ]
    }

    fn grouped() -> Vec<Row> {
        vec![
            (rg(None, Some(0)), 0),
            (b(0x000, 0x100), 1),
            (Range::point(0x100), BRAKE),
            (b(0x100, 0x400), 1),
            (Range::point(0x400), BRAKE),
            (b(0x400, 0x500), 1),
            (b(0x500, 0x510), 0),
            (b(0x510, 0x580), 1),
            (b(0x580, 0x600), 0),
            (b(0x600, 0x900), 2),
            (b(0x900, 0xb00), 0),
            (b(0xb00, 0xc20), 3),
            (b(0xc20, 0xd00), 0),
            (b(0xd00, 0xf00), 4),
            (rg(Some(0xf00), None), 0),
        ]
    }

    fn isect_change() -> Vec<Row> {
        vec![
            (rg(None, Some(0x700)), 0),
            (b(0x700, 0x800), 2),
            (b(0x800, 0xb00), 0),
            (b(0xb00, 0xc00), 3),
            (b(0xc00, 0xc20), 2),
            (b(0xc20, 0xd00), 0),
            (b(0xd00, 0xd80), 2),
            (b(0xd80, 0xe00), 3),
            (b(0xe00, 0xe80), 0),
            (b(0xe80, 0xf00), 2),
            (rg(Some(0xf00), None), 0),
        ]
    }

    fn isect_group() -> Vec<Row> {
        vec![
            (rg(None, Some(0x700)), 0),
            (b(0x700, 0x800), 2),
            (b(0x800, 0xb00), 0),
            (b(0xb00, 0xc20), 3),
            (b(0xc20, 0xd00), 0),
            (b(0xd00, 0xe00), 3),
            (b(0xe00, 0xe80), 0),
            (b(0xe80, 0xf00), 2),
            (rg(Some(0xf00), None), 0),
        ]
    }

    /// Rows a sweep with these options must produce out of a full table
    fn expect(table: Vec<Row>, opts: Options, skip: usize) -> Vec<Row> {
        table
            .into_iter()
            .skip(skip)
            .filter(|&(_, n)| if n == BRAKE { opts.brake } else { opts.empty || n > 0 })
            .collect()
    }

    fn rows<'a>(it: impl Iterator<Item = (Range, Vec<Hit<'a>>)>) -> Vec<Row> {
        it.map(|(range, hits)| {
            let n = if range.is_empty() && hits.is_empty() {
                BRAKE
            } else {
                hits.len()
            };
            (range, n)
        })
        .collect()
    }

    fn all_options(cuts: usize) -> Vec<Options> {
        let mut out = Vec::new();
        for empty in [true, false] {
            for brake in [true, false] {
                out.push(Options::union().empty(empty).brake(brake).cuts(cuts));
            }
        }
        out
    }

    #[test]
    fn test_change_plain() {
        let rings = fixture();
        let walk = Walk::new(&rings[..3]);

        for opts in all_options(1) {
            let got = rows(walk.change(Range::WILD, None, opts));
            assert_eq!(got, expect(plain(), opts, 0), "{:?}", opts);
        }

        let got = rows(walk.change(rg(Some(0x100), None), None, Options::union()));
        assert_eq!(got, expect(plain(), Options::union(), 2));
    }

    #[test]
    fn test_group_plain() {
        let rings = fixture();
        let walk = Walk::new(&rings[..3]);

        for opts in all_options(1) {
            let got = rows(walk.group(Range::WILD, None, opts));
            assert_eq!(got, expect(grouped(), opts, 0), "{:?}", opts);
        }

        let got = rows(walk.group(rg(Some(0x100), None), None, Options::union()));
        assert_eq!(got, expect(grouped(), Options::union(), 2));
    }

    #[test]
    fn test_change_isect() {
        let rings = fixture();
        let walk = Walk::new(&rings[..3]);

        for opts in all_options(2) {
            let got = rows(walk.change(Range::WILD, None, opts));
            assert_eq!(got, expect(isect_change(), opts, 0), "{:?}", opts);
        }
    }

    #[test]
    fn test_group_isect() {
        let rings = fixture();
        let walk = Walk::new(&rings[..3]);

        for opts in all_options(2) {
            let got = rows(walk.group(Range::WILD, None, opts));
            assert_eq!(got, expect(isect_group(), opts, 0), "{:?}", opts);
        }
    }

    /// `(ring, span start) -> runs` in a stable order
    fn by_span<'a>(it: impl Iterator<Item = (Hit<'a>, Vec<Range>)>) -> Vec<((usize, u64), Vec<Range>)> {
        let mut out: Vec<_> = it
            .map(|(hit, regs)| ((hit.ring, lo(hit.span.range()).unwrap_or(0)), regs))
            .collect();
        out.sort_by_key(|(key, _)| *key);
        out
    }

    #[test]
    fn test_align_isect() {
        let rings = fixture();
        let walk = Walk::new(&rings[..3]);

        let got = by_span(walk.align(Range::WILD, None, false, 2));
        assert_eq!(
            got,
            vec![
                ((0, 0x600), vec![b(0x700, 0x800)]),
                ((0, 0xb00), vec![b(0xb00, 0xc00)]),
                ((0, 0xd00), vec![b(0xd00, 0xe00)]),
                ((1, 0x700), vec![b(0x700, 0x800)]),
                ((1, 0xb00), vec![b(0xb00, 0xc20)]),
                ((1, 0xd00), vec![b(0xd00, 0xe00)]),
                ((1, 0xe80), vec![b(0xe80, 0xf00)]),
                ((2, 0xb00), vec![b(0xb00, 0xc20)]),
                ((2, 0xd80), vec![b(0xd80, 0xe00), b(0xe80, 0xf00)]),
            ]
        );
    }

    #[test]
    fn test_oneby_isect() {
        let rings = fixture();
        let oneby = OneBy::new(Walk::new(&rings[..3]), Walk::new(&rings[3..]));

        let got = by_span(oneby.run(Range::WILD, true));
        assert_eq!(
            got,
            vec![
                ((0, 0x600), vec![b(0x600, 0x680), b(0x700, 0x780)]),
                ((0, 0xb00), vec![b(0xb00, 0xc00)]),
                ((0, 0xd00), vec![b(0xd50, 0xe00)]),
                ((1, 0x700), vec![b(0x700, 0x780)]),
                ((1, 0xb00), vec![b(0xb00, 0xc10)]),
                ((1, 0xd00), vec![b(0xd50, 0xe00)]),
                ((1, 0xe80), vec![b(0xe80, 0xf00)]),
                ((2, 0xb00), vec![b(0xb00, 0xc10)]),
                ((2, 0xd80), vec![b(0xd80, 0xf00)]),
            ]
        );
    }

    #[test]
    fn test_oneby_rest() {
        let rings = fixture();
        let oneby = OneBy::new(Walk::new(&rings[..3]), Walk::new(&rings[3..]));

        let got = by_span(oneby.run(Range::WILD, false));
        assert_eq!(
            got,
            vec![
                ((0, 0x000), vec![b(0x000, 0x100)]),
                ((0, 0x400), vec![b(0x400, 0x500)]),
                ((0, 0x600), vec![b(0x680, 0x700), b(0x780, 0x800)]),
                ((0, 0xd00), vec![b(0xd00, 0xd50)]),
                ((1, 0x100), vec![b(0x100, 0x400)]),
                ((1, 0x510), vec![b(0x510, 0x580)]),
                ((1, 0x700), vec![b(0x780, 0x900)]),
                ((1, 0xb00), vec![b(0xc10, 0xc20)]),
                ((1, 0xd00), vec![b(0xd00, 0xd50)]),
                ((2, 0xb00), vec![b(0xc10, 0xc20)]),
            ]
        );
    }

    #[test]
    fn test_diff_scenario() {
        let one = ring(&[(0, 100)]);
        let two = ring(&[(50, 150)]);
        let diff = Diff::new(Walk::new([&one]), Walk::new([&two]));

        let got: Vec<_> = diff
            .run(Range::WILD, false, Class::ALL)
            .map(|item| (item.class, item.range, item.one.len(), item.two.len()))
            .collect();
        assert_eq!(
            got,
            vec![
                (Class::ONE, b(0, 50), 1, 0),
                (Class::ISECT, b(50, 100), 1, 1),
                (Class::TWO, b(100, 150), 0, 1),
            ]
        );

        let only: Vec<_> = diff
            .run(Range::WILD, true, Class::TWO)
            .map(|item| (item.class, item.range))
            .collect();
        assert_eq!(
            only,
            vec![
                (Class::NONE, rg(None, Some(0))),
                (Class::TWO, b(100, 150)),
                (Class::NONE, rg(Some(150), None)),
            ]
        );
    }

    #[test]
    fn test_union_and_isect_sampling() {
        let rings = fixture();
        let covered = |ring: &Ring, at: u64| ring.lookup(at, true).is_some();

        let union: Vec<_> = Walk::new(&rings[..2])
            .change(Range::WILD, None, Options::union().empty(true))
            .collect();
        let isect: Vec<_> = Walk::new(&rings[..2])
            .change(Range::WILD, None, Options::isect().empty(true))
            .collect();

        for at in (0..0x1000).step_by(0x10) {
            let any = covered(&rings[0], at) || covered(&rings[1], at);
            let both = covered(&rings[0], at) && covered(&rings[1], at);

            let row = union.iter().find(|(rg, _)| rg.contains(at)).unwrap();
            assert_eq!(!row.1.is_empty(), any, "union at {:#x}", at);

            let row = isect.iter().find(|(rg, _)| rg.contains(at)).unwrap();
            assert_eq!(!row.1.is_empty(), both, "isect at {:#x}", at);
        }
    }

    #[test]
    fn test_empty_walk() {
        let walk = Walk::new(std::iter::empty());
        let got: Vec<_> = walk
            .change(Range::WILD, None, Options::union().empty(true))
            .collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, Range::WILD);
        assert!(got[0].1.is_empty());
    }

    #[test]
    fn test_order() {
        let rings = fixture();
        let starts: Vec<_> = Walk::new(&rings[..2])
            .order(b(0, 0x600), None)
            .map(|hit| hit.span.range().lo().unwrap())
            .collect();
        assert_eq!(starts, vec![0x000, 0x100, 0x400, 0x510]);
    }

    #[test]
    fn test_glide() {
        let low = ring(&[(0, 0x100), (0x300, 0x400)]);
        let high = ring(&[(0x80, 0x200)]);
        let glide = Glide::new(Walk::new([&low, &high]));

        let got: Vec<_> = glide
            .run(b(0, 0x500), None, |hit| hit.ring as i64)
            .map(|(range, hit)| (range, hit.map(|h| (h.ring, h.index))))
            .collect();
        assert_eq!(
            got,
            vec![
                (b(0, 0x100), Some((0, 0))),
                (b(0x100, 0x200), Some((1, 0))),
                (b(0x200, 0x300), None),
                (b(0x300, 0x400), Some((0, 1))),
            ]
        );
    }
}
