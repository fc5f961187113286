//! Modular arithmetic on the identifier ring.
//!
//! Every node and key lives in `[0, 2^bits)`. Distances are measured clockwise
//! and wrap through zero.

use crate::error::{Error, Result};

pub const MAX_BITS: u32 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    bits: u32,
}

impl Ring {
    pub fn new(bits: u32) -> Result<Self> {
        if bits == 0 || bits > MAX_BITS {
            return Err(Error::Config(format!(
                "ring width must be within 1..={} bits, got {}",
                MAX_BITS, bits
            )));
        }
        Ok(Ring { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn size(&self) -> u64 {
        1u64 << self.bits
    }

    fn mask(&self) -> u64 {
        self.size() - 1
    }

    pub fn wrap(&self, value: u64) -> u64 {
        value & self.mask()
    }

    /// Clockwise steps from `from` to `to`.
    pub fn distance(&self, from: u64, to: u64) -> u64 {
        to.wrapping_sub(from) & self.mask()
    }

    pub fn add(&self, id: u64, offset: u64) -> u64 {
        id.wrapping_add(offset) & self.mask()
    }

    /// Point halfway along the clockwise arc from `from` to `to`.
    pub fn midpoint(&self, from: u64, to: u64) -> u64 {
        self.add(from, self.distance(from, to) / 2)
    }

    /// Start of finger `index` (1-based, below `bits`) for node `id`: `id + 2^(index-1)`.
    pub fn finger_start(&self, id: u64, index: u32) -> u64 {
        debug_assert!(index >= 1 && index < self.bits);
        self.add(id, 1u64 << (index - 1))
    }

    /// Whether `key` lies in the half-open arc `[start, end)`.
    ///
    /// A degenerate arc (`start == end`) covers the whole ring.
    pub fn in_range(&self, key: u64, start: u64, end: u64) -> bool {
        if start == end {
            return true;
        }
        self.distance(start, key) < self.distance(start, end)
    }

    /// Ids of the closed arc `[start, end]`, walking clockwise.
    pub fn arc(&self, start: u64, end: u64) -> impl Iterator<Item = u64> {
        let ring = *self;
        let len = self.distance(start, end);
        (0..=len).map(move |offset| ring.add(start, offset))
    }
}
