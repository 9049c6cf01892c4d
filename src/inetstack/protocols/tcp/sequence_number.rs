// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

// This file defines a type to represent a TCP Sequence Number.
//
// RFC 793, Section 3.3 defines TCP sequence numbers.  The sequence number space ranges from 0 to 2^32 - 1.  This space
// "wraps around", so all arithmetic dealing with sequence numbers must be performed modulo 2^32.  This also means that
// excluding equality, all comparisons between sequence numbers are non-transitive.  That is, for any three distinct
// sequence numbers a, b, & c, having a < b and b < c being true does NOT necessarily imply that a < c.  One can have
// the situation that a < b < c < a.  For this reason, we define sequence numbers to be their own type.
//

use ::std::{
    cmp::Ordering,
    convert::From,
    fmt,
};

// Internally, we store sequence numbers as unsigned 32-bit integers.
//
// We allow our sequence numbers to be cloned, copied, created, and checked for equality the same as for u32.  We
// restrict all other behaviors to those we explicitly define below.
//
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SeqNumber {
    value: u32,
}

impl SeqNumber {
    /// Whether this number lies in the half-open range `[first, last)`,
    /// taking wrap-around into account.
    #[inline]
    pub fn in_range(self, first: SeqNumber, last: SeqNumber) -> bool {
        self.value.wrapping_sub(first.value) < last.value.wrapping_sub(first.value)
    }

    /// The number of sequence positions from `self` up to `other`.
    #[inline]
    pub fn size_to(self, other: SeqNumber) -> u32 {
        other.value.wrapping_sub(self.value)
    }
}

// To create a u32 from a sequence number.
impl From<SeqNumber> for u32 {
    #[inline]
    fn from(item: SeqNumber) -> u32 {
        item.value
    }
}

// To create a sequence number from a u32.
impl From<u32> for SeqNumber {
    #[inline]
    fn from(item: u32) -> Self {
        SeqNumber { value: item }
    }
}

// Display a sequence number.
impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.value.fmt(f)
    }
}

// Add a size to a sequence number.
impl std::ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    #[inline]
    fn add(self, other: u32) -> SeqNumber {
        (self.value.wrapping_add(other)).into()
    }
}

// Subtract a sequence number from another one, yielding the distance.
impl std::ops::Sub for SeqNumber {
    type Output = u32;

    #[inline]
    fn sub(self, other: SeqNumber) -> u32 {
        self.value.wrapping_sub(other.value)
    }
}

// We define the PartialOrd trait in order to support the "<", "<=", ">", and ">=" operators on sequence numbers.
// Strictly speaking, however, sequence numbers are not a partially ordered set (much less a totally ordered set) due to
// the fact that they wrap around.  So to avoid problems with other code that might assume our implementation of the
// PartialOrd trait means that sequence numbers can be uniquely ordered, we don't implement the partial_cmp function of
// this trait.  Well, actually we do, because the compiler complains if we don't, but we have it panic if it is called.
impl PartialOrd for SeqNumber {
    fn partial_cmp(&self, _other: &Self) -> Option<Ordering> {
        panic!("sequence numbers have no total order");
    }

    #[inline]
    fn lt(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) < 0
    }

    #[inline]
    fn le(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) <= 0
    }

    #[inline]
    fn gt(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) > 0
    }

    #[inline]
    fn ge(&self, other: &Self) -> bool {
        (self.value.wrapping_sub(other.value) as i32) >= 0
    }
}

// Note that we specifically don't define std::cmp::Ord for sequence numbers, as there is no total order for them.
// There is no max or min value, and if you have more than two of them, they can't be sorted into an unique order.

// Unit tests for SeqNumber type.
#[cfg(test)]
mod tests {
    use super::SeqNumber;
    use ::anyhow::Result;

    // Test basic comparisons between sequence numbers of various values.
    #[test]
    fn comparison() -> Result<()> {
        let s0: SeqNumber = SeqNumber::from(0);
        let s1: SeqNumber = SeqNumber::from(1);
        let s4: SeqNumber = SeqNumber::from(0x7fffffff);
        let s5: SeqNumber = SeqNumber::from(0x80000000);
        let s6: SeqNumber = SeqNumber::from(0x80000001);
        let s7: SeqNumber = SeqNumber::from(0xffffffff);

        crate::ensure_eq!(s0, s0);
        crate::ensure_neq!(s0, s1);
        crate::ensure_neq!(s0, s7);

        crate::ensure_eq!(!(s0 < s0), true);
        crate::ensure_eq!(!(s0 > s0), true);

        crate::ensure_eq!(s0 < s1, true);
        crate::ensure_eq!(s0 < s4, true);
        crate::ensure_eq!(s0 < s5, true);
        crate::ensure_eq!(s0 > s6, true);
        crate::ensure_eq!(s0 > s7, true);
        Ok(())
    }

    // Test that comparisons and addition handle wrap around properly.
    #[test]
    fn wrap_around() -> Result<()> {
        let zero: SeqNumber = SeqNumber::from(0);
        let one: SeqNumber = SeqNumber::from(1);
        let big: SeqNumber = SeqNumber::from(0xffffffff);

        crate::ensure_neq!(zero, big);
        crate::ensure_eq!(big + 1, zero);
        crate::ensure_eq!(big < zero, true);
        crate::ensure_eq!(zero - big, 1);
        crate::ensure_eq!(one.size_to(big + 2), 0xffffffffu32.wrapping_sub(1).wrapping_add(2));
        Ok(())
    }

    #[test]
    fn in_range_wraps() -> Result<()> {
        let a: SeqNumber = SeqNumber::from(0xfffffff0);
        let b: SeqNumber = SeqNumber::from(0x00000010);

        crate::ensure_eq!(SeqNumber::from(0xfffffff0).in_range(a, b), true);
        crate::ensure_eq!(SeqNumber::from(0).in_range(a, b), true);
        crate::ensure_eq!(SeqNumber::from(0x0000000f).in_range(a, b), true);
        crate::ensure_eq!(SeqNumber::from(0x00000010).in_range(a, b), false);
        crate::ensure_eq!(SeqNumber::from(0xffffffef).in_range(a, b), false);
        Ok(())
    }
}
