//! Error types shared by the interval engine, the World and heap walkers

use crate::maps::Range;
use thiserror::Error;

/// Errors produced while building or querying an address space model
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid range [{lo:#x}, {hi:#x})")]
    InvalidRange { lo: u64, hi: u64 },

    /// A push would overlap a span already held by the ring
    #[error("{range} is already occupied")]
    Conflict { range: Range },

    #[error("cannot extend {span} to {to}")]
    Boundary { span: Range, to: Range },

    /// The ring was mutated while an enumeration or transaction was open
    #[error("ring changed while a cursor or transaction was open")]
    OutOfSync,

    #[error("{at} is out of {within}")]
    OutOfRange { at: Range, within: Range },

    #[error("span is not bound to this ring")]
    NotBound,

    #[error("span is already bound to a ring")]
    Bound,

    #[error("unbounded span {range} cannot be placed into a ring")]
    Unbounded { range: Range },

    /// Allocator bookkeeping contradicts itself, the arena is unusable
    #[error("damaged at {at:#x}: {reason}")]
    Damaged { at: u64, reason: String },

    /// Reconstruction reached a state that must not happen
    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("failed to read {size} bytes at {address:#x}: {reason}")]
    Read {
        address: u64,
        size: usize,
        reason: String,
    },

    #[error("short read at {address:#x}: wanted {wanted} bytes, got {got}")]
    ShortRead {
        address: u64,
        wanted: usize,
        got: usize,
    },

    #[error("symbol not resolved: {0}")]
    Symbol(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid path: {0}")]
    Path(String),

    #[error("interrupted")]
    Interrupted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn damaged(at: u64, reason: impl Into<String>) -> Self {
        Error::Damaged {
            at,
            reason: reason.into(),
        }
    }

    pub fn analysis(reason: impl Into<String>) -> Self {
        Error::Analysis(reason.into())
    }

    /// Whether this error only invalidates a single arena
    pub fn is_damage(&self) -> bool {
        matches!(self, Error::Damaged { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
