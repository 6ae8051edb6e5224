//! x86 向け AVX2 行カーネル
//!
//! すべてスカラ実装とビット一致する。テイルはスカラで処理する。

#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;

use super::mulhrs_i16;

/// `dst += add - sub`（i16×16 ラッピング）
#[target_feature(enable = "avx2")]
pub(super) unsafe fn add_sub_i16_avx2(dst: &mut [i16], add: &[i16], sub: &[i16]) {
    let n = dst.len();
    let mut i = 0usize;
    while i + 16 <= n {
        let d = _mm256_loadu_si256(dst.as_ptr().add(i) as *const __m256i);
        let a = _mm256_loadu_si256(add.as_ptr().add(i) as *const __m256i);
        let s = _mm256_loadu_si256(sub.as_ptr().add(i) as *const __m256i);
        let v = _mm256_sub_epi16(_mm256_add_epi16(d, a), s);
        _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, v);
        i += 16;
    }
    while i < n {
        dst[i] = dst[i].wrapping_add(add[i]).wrapping_sub(sub[i]);
        i += 1;
    }
}

/// `out = max(x, mulhrs(x, w))`（PReLU、i16×16）
#[target_feature(enable = "avx2")]
pub(super) unsafe fn prelu_i16_avx2(out: &mut [i16], input: &[i16], weight: &[i16]) {
    let n = out.len();
    let mut i = 0usize;
    while i + 16 <= n {
        let x = _mm256_loadu_si256(input.as_ptr().add(i) as *const __m256i);
        let w = _mm256_loadu_si256(weight.as_ptr().add(i) as *const __m256i);
        let v = _mm256_max_epi16(x, _mm256_mulhrs_epi16(x, w));
        _mm256_storeu_si256(out.as_mut_ptr().add(i) as *mut __m256i, v);
        i += 16;
    }
    while i < n {
        let x = input[i];
        out[i] = x.max(mulhrs_i16(x, weight[i]));
        i += 1;
    }
}

/// `dst += mulhrs(new, w) - mulhrs(old, w)`（i16×16 ラッピング）
#[target_feature(enable = "avx2")]
pub(super) unsafe fn mulhrs_sub_add_i16_avx2(
    dst: &mut [i16],
    old: &[i16],
    new: &[i16],
    weight: &[i16],
) {
    let n = dst.len();
    let mut i = 0usize;
    while i + 16 <= n {
        let d = _mm256_loadu_si256(dst.as_ptr().add(i) as *const __m256i);
        let o = _mm256_loadu_si256(old.as_ptr().add(i) as *const __m256i);
        let x = _mm256_loadu_si256(new.as_ptr().add(i) as *const __m256i);
        let w = _mm256_loadu_si256(weight.as_ptr().add(i) as *const __m256i);
        let v = _mm256_add_epi16(
            _mm256_sub_epi16(d, _mm256_mulhrs_epi16(o, w)),
            _mm256_mulhrs_epi16(x, w),
        );
        _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, v);
        i += 16;
    }
    while i < n {
        dst[i] = dst[i]
            .wrapping_sub(mulhrs_i16(old[i], weight[i]))
            .wrapping_add(mulhrs_i16(new[i], weight[i]));
        i += 1;
    }
}

/// `dst += max(src, 0)`（i16×16 → i32×16）
#[target_feature(enable = "avx2")]
pub(super) unsafe fn add_relu_widen_i32_avx2(dst: &mut [i32], src: &[i16]) {
    let n = dst.len();
    let zero = _mm256_setzero_si256();
    let mut i = 0usize;
    while i + 16 <= n {
        let v = _mm256_max_epi16(
            _mm256_loadu_si256(src.as_ptr().add(i) as *const __m256i),
            zero,
        );
        let lo = _mm256_cvtepi16_epi32(_mm256_castsi256_si128(v));
        let hi = _mm256_cvtepi16_epi32(_mm256_extracti128_si256::<1>(v));
        let d0 = _mm256_loadu_si256(dst.as_ptr().add(i) as *const __m256i);
        let d1 = _mm256_loadu_si256(dst.as_ptr().add(i + 8) as *const __m256i);
        _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, _mm256_add_epi32(d0, lo));
        _mm256_storeu_si256(
            dst.as_mut_ptr().add(i + 8) as *mut __m256i,
            _mm256_add_epi32(d1, hi),
        );
        i += 16;
    }
    while i < n {
        dst[i] = dst[i].wrapping_add(src[i].max(0) as i32);
        i += 1;
    }
}

/// `dst -= max(src, 0)`（i16×16 → i32×16）
#[target_feature(enable = "avx2")]
pub(super) unsafe fn sub_relu_widen_i32_avx2(dst: &mut [i32], src: &[i16]) {
    let n = dst.len();
    let zero = _mm256_setzero_si256();
    let mut i = 0usize;
    while i + 16 <= n {
        let v = _mm256_max_epi16(
            _mm256_loadu_si256(src.as_ptr().add(i) as *const __m256i),
            zero,
        );
        let lo = _mm256_cvtepi16_epi32(_mm256_castsi256_si128(v));
        let hi = _mm256_cvtepi16_epi32(_mm256_extracti128_si256::<1>(v));
        let d0 = _mm256_loadu_si256(dst.as_ptr().add(i) as *const __m256i);
        let d1 = _mm256_loadu_si256(dst.as_ptr().add(i + 8) as *const __m256i);
        _mm256_storeu_si256(dst.as_mut_ptr().add(i) as *mut __m256i, _mm256_sub_epi32(d0, lo));
        _mm256_storeu_si256(
            dst.as_mut_ptr().add(i + 8) as *mut __m256i,
            _mm256_sub_epi32(d1, hi),
        );
        i += 16;
    }
    while i < n {
        dst[i] = dst[i].wrapping_sub(src[i].max(0) as i32);
        i += 1;
    }
}
