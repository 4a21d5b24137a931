//! Scalar reference kernels.
//!
//! These are the canonical definitions: every accelerated backend must match
//! them bit for bit on every input it accepts.

use super::KernelTable;
use crate::error::Result;

pub(crate) const TABLE: KernelTable = KernelTable {
    popcount: table_popcount,
    and: table_and,
    or: table_or,
    xor: table_xor,
    carry: table_carry,
};

fn table_popcount(words: &[u64]) -> Result<u64> {
    Ok(popcount(words))
}

fn table_and(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    and(a, b, out);
    Ok(())
}

fn table_or(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    or(a, b, out);
    Ok(())
}

fn table_xor(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    xor(a, b, out);
    Ok(())
}

fn table_carry(src: &[u64], carry_in: u64, out: &mut [u64]) -> Result<u64> {
    Ok(carry_propagate(src, carry_in, out))
}

/// Total set bits across `words`.
#[inline]
pub fn popcount(words: &[u64]) -> u64 {
    words.iter().map(|w| w.count_ones() as u64).sum()
}

#[inline]
pub fn and(a: &[u64], b: &[u64], out: &mut [u64]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x & y;
    }
}

#[inline]
pub fn or(a: &[u64], b: &[u64], out: &mut [u64]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x | y;
    }
}

#[inline]
pub fn xor(a: &[u64], b: &[u64], out: &mut [u64]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x ^ y;
    }
}

/// Word-serial rolling transform `c_i = (c_{i-1} ^ x_i) & x_i`.
///
/// `carry_in` is the full 64-bit carry word fed to word 0. Returns the carry
/// leaving the last word so callers can chain segments.
#[inline]
pub fn carry_propagate(src: &[u64], carry_in: u64, out: &mut [u64]) -> u64 {
    let mut carry = carry_in;
    for (o, &x) in out.iter_mut().zip(src) {
        carry = (carry ^ x) & x;
        *o = carry;
    }
    carry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_popcount() {
        assert_eq!(popcount(&[]), 0);
        assert_eq!(popcount(&[0xAAAA_AAAA_AAAA_AAAA, 1]), 33);
        assert_eq!(popcount(&[!0u64; 3]), 192);
    }

    #[test]
    fn test_bitwise() {
        let a = [0b1100u64, !0];
        let b = [0b1010u64, 0];
        let mut out = [0u64; 2];

        and(&a, &b, &mut out);
        assert_eq!(out, [0b1000, 0]);
        or(&a, &b, &mut out);
        assert_eq!(out, [0b1110, !0]);
        xor(&a, &b, &mut out);
        assert_eq!(out, [0b0110, !0]);
    }

    #[test]
    fn test_carry_recurrence() {
        let src = [6u64, 6, 7, 0];
        let mut out = [0u64; 4];
        let carry_out = carry_propagate(&src, 0, &mut out);
        // 6 → 6, then (6^6)&6 = 0, then (0^7)&7 = 7, then 0
        assert_eq!(out, [6, 0, 7, 0]);
        assert_eq!(carry_out, 0);

        let carry_out = carry_propagate(&src, !0, &mut out);
        // (!0 ^ 6) & 6 = 0
        assert_eq!(out, [0, 6, 1, 0]);
        assert_eq!(carry_out, 0);
    }
}
