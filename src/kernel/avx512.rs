//! AVX-512 kernels: eight u64 lanes per 512-bit register.
//!
//! Popcount uses VPOPCNTDQ directly. The carry transform keeps the AVX2 lane
//! scan, since its cost is dominated by the serial hand-off between groups.

use std::arch::x86_64::*;

use super::{avx2, scalar, KernelTable};
use crate::backend::BackendKind;
use crate::error::{ConsensusError, Result};

/// u64 lanes per register.
pub(crate) const LANES: usize = 8;

pub(crate) fn is_available() -> bool {
    is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512vpopcntdq")
        && is_x86_feature_detected!("avx2")
}

pub(crate) fn table() -> Option<KernelTable> {
    if !is_available() {
        return None;
    }
    Some(KernelTable {
        popcount,
        and,
        or,
        xor,
        carry: avx2::carry_propagate,
    })
}

fn short_input() -> ConsensusError {
    ConsensusError::BackendUnavailable {
        backend: BackendKind::Wide,
        reason: "input shorter than one lane group",
    }
}

fn popcount(words: &[u64]) -> Result<u64> {
    if words.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX-512F/VPOPCNTDQ presence checked in `table()`.
    Ok(unsafe { popcount_vpopcntdq(words) })
}

fn and(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX-512F presence checked in `table()`.
    unsafe { and_avx512(a, b, out) };
    Ok(())
}

fn or(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX-512F presence checked in `table()`.
    unsafe { or_avx512(a, b, out) };
    Ok(())
}

fn xor(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX-512F presence checked in `table()`.
    unsafe { xor_avx512(a, b, out) };
    Ok(())
}

#[target_feature(enable = "avx512f,avx512vpopcntdq")]
unsafe fn popcount_vpopcntdq(words: &[u64]) -> u64 {
    let groups = words.len() / LANES;
    let mut total = _mm512_setzero_si512();

    for g in 0..groups {
        let v = _mm512_loadu_si512(words.as_ptr().add(g * LANES) as *const __m512i);
        total = _mm512_add_epi64(total, _mm512_popcnt_epi64(v));
    }

    // Horizontal sum: store 8 × i64 and sum
    let mut lanes = [0i64; LANES];
    _mm512_storeu_si512(lanes.as_mut_ptr() as *mut __m512i, total);
    let sum: u64 = lanes.iter().map(|&v| v as u64).sum();

    sum + scalar::popcount(&words[groups * LANES..])
}

macro_rules! binary_kernel {
    ($name:ident, $simd:ident, $op:tt) => {
        #[target_feature(enable = "avx512f")]
        unsafe fn $name(a: &[u64], b: &[u64], out: &mut [u64]) {
            let n = out.len().min(a.len()).min(b.len());
            let groups = n / LANES;

            for g in 0..groups {
                let offset = g * LANES;
                let va = _mm512_loadu_si512(a.as_ptr().add(offset) as *const __m512i);
                let vb = _mm512_loadu_si512(b.as_ptr().add(offset) as *const __m512i);
                _mm512_storeu_si512(
                    out.as_mut_ptr().add(offset) as *mut __m512i,
                    $simd(va, vb),
                );
            }

            for w in (groups * LANES)..n {
                out[w] = a[w] $op b[w];
            }
        }
    };
}

binary_kernel!(and_avx512, _mm512_and_si512, &);
binary_kernel!(or_avx512, _mm512_or_si512, |);
binary_kernel!(xor_avx512, _mm512_xor_si512, ^);
