//! Chunk geometry for a machine word size

use crate::error::{Error, Result};

pub const PREV_IN_USE: u64 = 1;
pub const MMAPPED: u64 = 2;
pub const NON_MAIN_ARENA: u64 = 4;

/// `malloc_state.flags` bit set for arenas that are not one sbrk() region
pub const NONCONTIGUOUS: u32 = 2;

const FLAG_BITS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    word: u64,
}

impl Scale {
    pub fn new(word: usize) -> Result<Self> {
        match word {
            4 | 8 => Ok(Self { word: word as u64 }),
            _ => Err(Error::analysis(format!("unsupported word size {}", word))),
        }
    }

    pub fn word(self) -> u64 {
        self.word
    }

    pub fn width(self) -> usize {
        self.word as usize
    }

    /// Smallest regular chunk
    pub fn min(self) -> u64 {
        4 * self.word
    }

    /// Size of a fencepost chunk
    pub fn fence(self) -> u64 {
        2 * self.word
    }

    /// Distance from chunk start to the first payload byte
    pub fn offset(self) -> u64 {
        2 * self.word
    }

    pub fn align_size(self) -> u64 {
        2 * self.word
    }

    /// Header bytes not usable by the payload
    pub fn brutt(self) -> u64 {
        self.word
    }

    pub fn minett(self) -> u64 {
        self.min() - self.brutt()
    }

    pub fn csize(raw: u64) -> u64 {
        raw & !FLAG_BITS
    }

    /// Usable size and granularity of a chunk of `size` bytes
    pub fn netto(self, size: u64) -> (u64, u64) {
        let net = size.saturating_sub(self.brutt());
        let gran = if net > self.minett() {
            self.align_size()
        } else {
            self.minett()
        };
        (net, gran)
    }

    /// Round up to the chunk grid
    pub fn align(self, size: u64) -> u64 {
        let mask = self.align_size() - 1;
        (size + mask) & !mask
    }

    /// Chunk size malloc() would carve for a request
    pub fn round(self, size: u64, brutto: bool) -> u64 {
        let size = self.align((size + self.brutt()).max(self.min()));
        if brutto {
            size
        } else {
            size - self.brutt()
        }
    }

    /// Whether a size field describes a chunk at all
    pub fn fits(self, size: u64, fence: bool) -> bool {
        size >= if fence { self.fence() } else { self.min() }
    }
}
