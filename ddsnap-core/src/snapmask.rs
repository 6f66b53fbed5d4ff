//! Sharing masks over the 64 internal snapshot bits

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// A set of internal snapshot bits. Bit `n` is snapshot bit `n`, never a tag.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SnapshotMask(u64);

impl SnapshotMask {
    pub const EMPTY: SnapshotMask = SnapshotMask(0);
    pub const ALL: SnapshotMask = SnapshotMask(!0);

    pub const fn from_bits(bits: u64) -> Self {
        SnapshotMask(bits)
    }

    /// The mask holding only `bit`; bits past 63 give the empty mask
    pub fn bit(bit: u8) -> Self {
        if bit < 64 {
            SnapshotMask(1u64 << bit)
        } else {
            SnapshotMask::EMPTY
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, bit: u8) -> bool {
        bit < 64 && self.0 & (1u64 << bit) != 0
    }

    pub fn insert(&mut self, bit: u8) {
        *self |= SnapshotMask::bit(bit);
    }

    pub fn remove(&mut self, bit: u8) {
        self.0 &= !SnapshotMask::bit(bit).0;
    }

    pub fn intersects(self, other: SnapshotMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest bit not in the mask
    pub fn first_free(self) -> Option<u8> {
        let free = !self.0;
        if free == 0 {
            None
        } else {
            Some(free.trailing_zeros() as u8)
        }
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0u8..64).filter(move |&bit| self.contains(bit))
    }
}

impl BitOr for SnapshotMask {
    type Output = SnapshotMask;
    fn bitor(self, rhs: SnapshotMask) -> SnapshotMask {
        SnapshotMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for SnapshotMask {
    fn bitor_assign(&mut self, rhs: SnapshotMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SnapshotMask {
    type Output = SnapshotMask;
    fn bitand(self, rhs: SnapshotMask) -> SnapshotMask {
        SnapshotMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for SnapshotMask {
    fn bitand_assign(&mut self, rhs: SnapshotMask) {
        self.0 &= rhs.0;
    }
}

impl Not for SnapshotMask {
    type Output = SnapshotMask;
    fn not(self) -> SnapshotMask {
        SnapshotMask(!self.0)
    }
}

impl fmt::Debug for SnapshotMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotMask({:#018x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_operations() {
        let mut mask = SnapshotMask::EMPTY;
        mask.insert(0);
        mask.insert(63);
        assert!(mask.contains(63));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.first_free(), Some(1));
        mask.remove(0);
        assert_eq!(mask.bits(), 1 << 63);
        assert_eq!((!mask & SnapshotMask::bit(63)), SnapshotMask::EMPTY);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![63]);
    }

    #[test]
    fn test_squashed_bit_is_outside_every_mask() {
        assert_eq!(SnapshotMask::bit(64), SnapshotMask::EMPTY);
        assert!(!SnapshotMask::ALL.contains(64));
        assert_eq!(SnapshotMask::ALL.first_free(), None);
    }
}
