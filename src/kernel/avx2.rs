//! AVX2 kernels: four u64 lanes per 256-bit register.
//!
//! All loads and stores are unaligned, so callers never need 32-byte aligned
//! buffers. Inputs shorter than one lane group are refused with
//! `BackendUnavailable` and the selector reruns them on the scalar path.
//!
//! # Carry propagation
//!
//! The rolling transform `c_i = (c_{i-1} ^ x_i) & x_i` is `c_i = x_i & !c_{i-1}`,
//! a serial chain. Each word applies the bitwise map `f_i(c) = x_i & !c`, and
//! any bitwise map of `c` is fully described by the pair `(f(1), f(0))`:
//!
//! ```text
//!   f(c) = (c & f(1)) | (!c & f(0))        f_i = (0, x_i)
//! ```
//!
//! Composition of such pairs is associative, so a two-step lane scan
//! (distance 1, then 2) yields `f_k ∘ … ∘ f_0` in lane k. Applying that to the
//! incoming carry gives all four carries of the group at once; lane 3 becomes
//! the carry for the next group. The result equals the scalar recurrence bit
//! for bit.

use std::arch::x86_64::*;

use super::{scalar, KernelTable};
use crate::backend::BackendKind;
use crate::error::{ConsensusError, Result};

/// u64 lanes per register.
pub(crate) const LANES: usize = 4;

pub(crate) fn is_available() -> bool {
    is_x86_feature_detected!("avx2")
}

/// Kernel table, or `None` when the CPU lacks AVX2.
pub(crate) fn table() -> Option<KernelTable> {
    if !is_available() {
        return None;
    }
    Some(KernelTable {
        popcount,
        and,
        or,
        xor,
        carry: carry_propagate,
    })
}

fn short_input() -> ConsensusError {
    ConsensusError::BackendUnavailable {
        backend: BackendKind::Avx2,
        reason: "input shorter than one lane group",
    }
}

// The safe wrappers below are only handed out through `table()`, which has
// already confirmed AVX2 support.

fn popcount(words: &[u64]) -> Result<u64> {
    if words.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX2 presence checked in `table()`.
    Ok(unsafe { popcount_avx2(words) })
}

fn and(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX2 presence checked in `table()`.
    unsafe { and_avx2(a, b, out) };
    Ok(())
}

fn or(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX2 presence checked in `table()`.
    unsafe { or_avx2(a, b, out) };
    Ok(())
}

fn xor(a: &[u64], b: &[u64], out: &mut [u64]) -> Result<()> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX2 presence checked in `table()`.
    unsafe { xor_avx2(a, b, out) };
    Ok(())
}

pub(crate) fn carry_propagate(src: &[u64], carry_in: u64, out: &mut [u64]) -> Result<u64> {
    if out.len() < LANES {
        return Err(short_input());
    }
    // SAFETY: AVX2 presence checked in `table()` (or in the wide table, which
    // also requires AVX2).
    Ok(unsafe { carry_avx2(src, carry_in, out) })
}

/// Nibble-lookup popcount: per-byte counts via `vpshufb`, folded into the
/// four u64 lanes with `vpsadbw`.
#[target_feature(enable = "avx2")]
unsafe fn popcount_avx2(words: &[u64]) -> u64 {
    let groups = words.len() / LANES;

    let lookup = _mm256_setr_epi8(
        0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4, //
        0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4,
    );
    let low_mask = _mm256_set1_epi8(0x0f);
    let zero = _mm256_setzero_si256();
    let mut acc = zero;

    for g in 0..groups {
        let v = _mm256_loadu_si256(words.as_ptr().add(g * LANES) as *const __m256i);
        let lo = _mm256_and_si256(v, low_mask);
        let hi = _mm256_and_si256(_mm256_srli_epi16::<4>(v), low_mask);
        let counts = _mm256_add_epi8(
            _mm256_shuffle_epi8(lookup, lo),
            _mm256_shuffle_epi8(lookup, hi),
        );
        acc = _mm256_add_epi64(acc, _mm256_sad_epu8(counts, zero));
    }

    let mut lanes = [0u64; LANES];
    _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, acc);
    let total: u64 = lanes.iter().sum();

    // Scalar remainder
    total + scalar::popcount(&words[groups * LANES..])
}

macro_rules! binary_kernel {
    ($name:ident, $simd:ident, $op:tt) => {
        #[target_feature(enable = "avx2")]
        unsafe fn $name(a: &[u64], b: &[u64], out: &mut [u64]) {
            let n = out.len().min(a.len()).min(b.len());
            let groups = n / LANES;

            for g in 0..groups {
                let offset = g * LANES;
                let va = _mm256_loadu_si256(a.as_ptr().add(offset) as *const __m256i);
                let vb = _mm256_loadu_si256(b.as_ptr().add(offset) as *const __m256i);
                _mm256_storeu_si256(
                    out.as_mut_ptr().add(offset) as *mut __m256i,
                    $simd(va, vb),
                );
            }

            // Scalar remainder
            for w in (groups * LANES)..n {
                out[w] = a[w] $op b[w];
            }
        }
    };
}

binary_kernel!(and_avx2, _mm256_and_si256, &);
binary_kernel!(or_avx2, _mm256_or_si256, |);
binary_kernel!(xor_avx2, _mm256_xor_si256, ^);

/// Evaluate the map `(hi, lo)` at `c`: `(c & hi) | (!c & lo)`.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn apply(hi: __m256i, lo: __m256i, c: __m256i) -> __m256i {
    _mm256_or_si256(_mm256_and_si256(c, hi), _mm256_andnot_si256(c, lo))
}

/// `f ∘ g`: run `g` first, then `f`.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn compose(
    f_hi: __m256i,
    f_lo: __m256i,
    g_hi: __m256i,
    g_lo: __m256i,
) -> (__m256i, __m256i) {
    (apply(f_hi, f_lo, g_hi), apply(f_hi, f_lo, g_lo))
}

#[target_feature(enable = "avx2")]
pub(crate) unsafe fn carry_avx2(src: &[u64], carry_in: u64, out: &mut [u64]) -> u64 {
    let n = src.len().min(out.len());
    let groups = n / LANES;

    // Identity map: f(1) = 1, f(0) = 0
    let ident_hi = _mm256_set1_epi64x(-1);
    let ident_lo = _mm256_setzero_si256();

    let mut carry = carry_in;

    for g in 0..groups {
        let offset = g * LANES;
        let x = _mm256_loadu_si256(src.as_ptr().add(offset) as *const __m256i);

        // f_k(c) = x_k & !c  →  (f(1), f(0)) = (0, x_k)
        let (mut hi, mut lo) = (ident_lo, x);

        // Distance 1: lane k takes lane k-1, lane 0 takes identity
        let prev_hi = _mm256_blend_epi32::<0b0000_0011>(
            _mm256_permute4x64_epi64::<0b10_01_00_00>(hi),
            ident_hi,
        );
        let prev_lo = _mm256_blend_epi32::<0b0000_0011>(
            _mm256_permute4x64_epi64::<0b10_01_00_00>(lo),
            ident_lo,
        );
        (hi, lo) = compose(hi, lo, prev_hi, prev_lo);

        // Distance 2: lanes 2,3 take lanes 0,1; lanes 0,1 take identity
        let prev_hi = _mm256_blend_epi32::<0b0000_1111>(
            _mm256_permute4x64_epi64::<0b01_00_00_00>(hi),
            ident_hi,
        );
        let prev_lo = _mm256_blend_epi32::<0b0000_1111>(
            _mm256_permute4x64_epi64::<0b01_00_00_00>(lo),
            ident_lo,
        );
        (hi, lo) = compose(hi, lo, prev_hi, prev_lo);

        let c = _mm256_set1_epi64x(carry as i64);
        let carries = apply(hi, lo, c);
        _mm256_storeu_si256(out.as_mut_ptr().add(offset) as *mut __m256i, carries);

        carry = _mm256_extract_epi64::<3>(carries) as u64;
    }

    let tail = groups * LANES;
    scalar::carry_propagate(&src[tail..n], carry, &mut out[tail..n])
}
