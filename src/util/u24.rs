use std::fmt::{Display, Formatter};
use std::ops::Add;

/// A 24 bit index with wrap-around semantics. RakNet uses this for datagram sequence numbers
///  as well as reliable, sequence and order indices.
///
/// There is deliberately no `Ord` implementation: after wrap-around, 0 follows 0xff_ffff, so
///  comparisons are only meaningful relative to each other within half the number space (see
///  [U24::is_after]).
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct U24(u32);

impl Display for U24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl U24 {
    pub const ZERO: U24 = U24(0);
    pub const MASK: u32 = 0xff_ffff;
    const HALF: u32 = 0x80_0000;

    pub fn from_raw(value: u32) -> U24 {
        U24(value & Self::MASK)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> U24 {
        self + 1
    }

    /// post-increment: returns the current value and advances `self`
    pub fn advance(&mut self) -> U24 {
        let result = *self;
        *self = self.next();
        result
    }

    /// The number of steps to get from `other` to `self` going forward
    pub fn distance_from(self, other: U24) -> u32 {
        self.0.wrapping_sub(other.0) & Self::MASK
    }

    pub fn is_after(self, other: U24) -> bool {
        let d = self.distance_from(other);
        d != 0 && d < Self::HALF
    }

    pub fn is_before(self, other: U24) -> bool {
        other.is_after(self)
    }

    /// iterate from `self` (inclusive) to `end` (exclusive), going forward
    pub fn to(self, end: U24) -> impl Iterator<Item = U24> {
        let len = end.distance_from(self);
        (0..len).map(move |i| self + i)
    }
}

impl Add<u32> for U24 {
    type Output = U24;

    fn add(self, rhs: u32) -> U24 {
        U24::from_raw(self.0.wrapping_add(rhs))
    }
}
