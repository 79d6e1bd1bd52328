//! Interval engine: ranges, spans, rings and multi ring sweeps

pub mod aggr;
pub mod alias;
pub mod exten;
pub mod range;
pub mod ring;
pub mod span;
pub mod sweep;
pub mod trans;
pub mod walk;

pub use aggr::{Align, Combine, Flatten, Options};
pub use alias::{Alias, Near};
pub use exten::{Exten, Extension, Fragment, FragmentKind, Pool, PoolKind, Provenance};
pub use range::{Edge, Range, Side};
pub use ring::{Cursor, Delta, Match, Measure, Ring};
pub use span::{Keep, Parts, RingId, Span, SpanId};
pub use sweep::{Aggregate, Event, Hit, Interval, Sweep};
pub use trans::Transaction;
pub use walk::{Class, Diff, DiffItem, Glide, OneBy, Pred, Walk};
