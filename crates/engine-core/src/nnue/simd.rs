//! Narrow vector-ops interface for the NNUE hot path
//!
//! 評価ホットパスはこのモジュールの行カーネルに対して書かれる。
//! スカラ実装がポータブルな基準で、x86-64 では AVX2 カーネルに
//! 実行時ディスパッチする（結果はスカラとビット一致）。
//!
//! i16 の加減算はすべてラッピング演算。`mulhrs` は `pmulhrsw`
//! （丸めつき上位乗算）とビット一致のスカラ定義を持つ。

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use std::sync::OnceLock;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod x86;

/// キャッシュラインサイズ（64 バイト）
pub const CACHE_LINE_SIZE: usize = 64;

// =============================================================================
// AlignedBox - 64 バイトアラインメントのヒープ確保スライス
// =============================================================================

/// 64 バイト境界に確保されたスライス
///
/// マッピングテーブルやセル別特徴量のように大きな配列を、aligned
/// load/store 可能な形でヒープに置くために使う。
///
/// # 安全性契約
///
/// - `T: Copy` により `T` は `Drop` を実装できないため、解放は
///   `dealloc` のみで安全
/// - `new_zeroed` はゼロビット列が `T` の有効値であることを前提と
///   する（このクレートでは整数・浮動小数の POD にのみ使用する）
pub struct AlignedBox<T> {
    ptr: *mut T,
    len: usize,
    layout: Layout,
}

impl<T> std::fmt::Debug for AlignedBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBox")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("layout", &self.layout)
            .finish()
    }
}

impl<T: Copy> AlignedBox<T> {
    /// 指定された長さの配列をゼロ初期化して確保
    ///
    /// # Panics
    /// サイズ計算がオーバーフローした場合、またはメモリ確保に
    /// 失敗した場合。
    pub fn new_zeroed(len: usize) -> Self {
        let size = std::mem::size_of::<T>()
            .checked_mul(len)
            .expect("AlignedBox::new_zeroed: size overflow");
        let align = CACHE_LINE_SIZE.max(std::mem::align_of::<T>());
        let layout = Layout::from_size_align(size.max(1), align)
            .expect("invalid AlignedBox layout")
            .pad_to_align();

        // SAFETY: layout は有効。alloc_zeroed は失敗時に null を返す
        let ptr = unsafe { alloc_zeroed(layout) as *mut T };
        if ptr.is_null() {
            std::alloc::handle_alloc_error(layout);
        }

        Self { ptr, len, layout }
    }
}

impl<T> Deref for AlignedBox<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        // SAFETY: ptr は len 要素分確保済みで、ゼロ初期化されている
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> DerefMut for AlignedBox<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: ptr は len 要素分確保済みで、ゼロ初期化されている
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: Copy> Clone for AlignedBox<T> {
    fn clone(&self) -> Self {
        let mut new = Self::new_zeroed(self.len);
        new.copy_from_slice(self);
        new
    }
}

impl<T> Drop for AlignedBox<T> {
    fn drop(&mut self) {
        // SAFETY: ptr / layout は new_zeroed のものと同一。
        // T: Copy のため drop_in_place は不要
        unsafe {
            dealloc(self.ptr as *mut u8, self.layout);
        }
    }
}

// SAFETY: T が Send/Sync なら所有スライスもそれに従う
unsafe impl<T: Send> Send for AlignedBox<T> {}
unsafe impl<T: Sync> Sync for AlignedBox<T> {}

// =============================================================================
// プリフェッチ
// =============================================================================

/// 読み込みプリフェッチのヒントを発行する（性能契約のみ、正しさに無関係）
#[inline(always)]
pub fn prefetch_read<T>(data: *const T) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch はメモリアクセスを伴わないヒント命令
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(data as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = data;
}

// =============================================================================
// i16 行カーネル（ラッピング演算）
// =============================================================================

/// `pmulhrsw` とビット一致する丸めつき上位乗算
///
/// `(a * b + 2^14) >> 15` を飽和なしの 16bit 切り捨てで返す。
/// 唯一の特殊ケース（a = b = -32768）も `pmulhrsw` と同じく
/// -32768 になる。
#[inline(always)]
pub const fn mulhrs_i16(a: i16, b: i16) -> i16 {
    let t = (((a as i32) * (b as i32)) >> 14) + 1;
    (t >> 1) as i16
}

#[inline(always)]
fn add_sub_i16_scalar(dst: &mut [i16], add: &[i16], sub: &[i16]) {
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_add(add[i]).wrapping_sub(sub[i]);
    }
}

#[inline(always)]
fn prelu_i16_scalar(out: &mut [i16], input: &[i16], weight: &[i16]) {
    for i in 0..out.len() {
        let x = input[i];
        out[i] = x.max(mulhrs_i16(x, weight[i]));
    }
}

#[inline(always)]
fn mulhrs_sub_add_i16_scalar(dst: &mut [i16], old: &[i16], new: &[i16], weight: &[i16]) {
    for i in 0..dst.len() {
        dst[i] = dst[i]
            .wrapping_sub(mulhrs_i16(old[i], weight[i]))
            .wrapping_add(mulhrs_i16(new[i], weight[i]));
    }
}

#[inline(always)]
fn add_relu_widen_i32_scalar(dst: &mut [i32], src: &[i16]) {
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_add(src[i].max(0) as i32);
    }
}

#[inline(always)]
fn sub_relu_widen_i32_scalar(dst: &mut [i32], src: &[i16]) {
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_sub(src[i].max(0) as i32);
    }
}

/// `dst[i] += add[i] - sub[i]`（ラッピング）
#[inline]
pub fn add_sub_i16(dst: &mut [i16], add: &[i16], sub: &[i16]) {
    debug_assert_eq!(dst.len(), add.len());
    debug_assert_eq!(dst.len(), sub.len());

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        type Kernel = fn(&mut [i16], &[i16], &[i16]);
        static KERNEL: OnceLock<Kernel> = OnceLock::new();
        let f = KERNEL.get_or_init(|| {
            if std::arch::is_x86_feature_detected!("avx2") {
                |dst: &mut [i16], add: &[i16], sub: &[i16]| unsafe {
                    x86::add_sub_i16_avx2(dst, add, sub)
                }
            } else {
                add_sub_i16_scalar as Kernel
            }
        });
        f(dst, add, sub);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    add_sub_i16_scalar(dst, add, sub);
}

/// `out[i] = max(x, mulhrs(x, w))`（PReLU）
#[inline]
pub fn prelu_i16(out: &mut [i16], input: &[i16], weight: &[i16]) {
    debug_assert_eq!(out.len(), input.len());
    debug_assert_eq!(out.len(), weight.len());

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        type Kernel = fn(&mut [i16], &[i16], &[i16]);
        static KERNEL: OnceLock<Kernel> = OnceLock::new();
        let f = KERNEL.get_or_init(|| {
            if std::arch::is_x86_feature_detected!("avx2") {
                |out: &mut [i16], input: &[i16], weight: &[i16]| unsafe {
                    x86::prelu_i16_avx2(out, input, weight)
                }
            } else {
                prelu_i16_scalar as Kernel
            }
        });
        f(out, input, weight);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    prelu_i16_scalar(out, input, weight);
}

/// `dst[i] += mulhrs(new, w) - mulhrs(old, w)`（dwconv の差し替え）
#[inline]
pub fn mulhrs_sub_add_i16(dst: &mut [i16], old: &[i16], new: &[i16], weight: &[i16]) {
    debug_assert_eq!(dst.len(), old.len());
    debug_assert_eq!(dst.len(), new.len());
    debug_assert_eq!(dst.len(), weight.len());

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        type Kernel = fn(&mut [i16], &[i16], &[i16], &[i16]);
        static KERNEL: OnceLock<Kernel> = OnceLock::new();
        let f = KERNEL.get_or_init(|| {
            if std::arch::is_x86_feature_detected!("avx2") {
                |dst: &mut [i16], old: &[i16], new: &[i16], weight: &[i16]| unsafe {
                    x86::mulhrs_sub_add_i16_avx2(dst, old, new, weight)
                }
            } else {
                mulhrs_sub_add_i16_scalar as Kernel
            }
        });
        f(dst, old, new, weight);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    mulhrs_sub_add_i16_scalar(dst, old, new, weight);
}

/// `dst[i] += max(src[i], 0)`（ReLU + i32 拡張）
#[inline]
pub fn add_relu_widen_i32(dst: &mut [i32], src: &[i16]) {
    debug_assert_eq!(dst.len(), src.len());

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        type Kernel = fn(&mut [i32], &[i16]);
        static KERNEL: OnceLock<Kernel> = OnceLock::new();
        let f = KERNEL.get_or_init(|| {
            if std::arch::is_x86_feature_detected!("avx2") {
                |dst: &mut [i32], src: &[i16]| unsafe { x86::add_relu_widen_i32_avx2(dst, src) }
            } else {
                add_relu_widen_i32_scalar as Kernel
            }
        });
        f(dst, src);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    add_relu_widen_i32_scalar(dst, src);
}

/// `dst[i] -= max(src[i], 0)`（ReLU + i32 拡張）
#[inline]
pub fn sub_relu_widen_i32(dst: &mut [i32], src: &[i16]) {
    debug_assert_eq!(dst.len(), src.len());

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        type Kernel = fn(&mut [i32], &[i16]);
        static KERNEL: OnceLock<Kernel> = OnceLock::new();
        let f = KERNEL.get_or_init(|| {
            if std::arch::is_x86_feature_detected!("avx2") {
                |dst: &mut [i32], src: &[i16]| unsafe { x86::sub_relu_widen_i32_avx2(dst, src) }
            } else {
                sub_relu_widen_i32_scalar as Kernel
            }
        });
        f(dst, src);
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    sub_relu_widen_i32_scalar(dst, src);
}

// 以下はコールドパス（clear / ヘッド評価）用のスカラカーネル。

/// `dst[i] += src[i]`（ラッピング）
#[inline]
pub fn add_i16(dst: &mut [i16], src: &[i16]) {
    debug_assert_eq!(dst.len(), src.len());
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_add(src[i]);
    }
}

/// `dst[i] += mulhrs(feat, w)`（dwconv の初期散布）
#[inline]
pub fn mulhrs_add_i16(dst: &mut [i16], feat: &[i16], weight: &[i16]) {
    debug_assert_eq!(dst.len(), feat.len());
    debug_assert_eq!(dst.len(), weight.len());
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_add(mulhrs_i16(feat[i], weight[i]));
    }
}

/// `dst[i] += src[i]`（i32 拡張、ReLU なし）
#[inline]
pub fn add_widen_i32(dst: &mut [i32], src: &[i16]) {
    debug_assert_eq!(dst.len(), src.len());
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_add(src[i] as i32);
    }
}

/// `dst[i] += new[i] - old[i]`（i32 拡張）
#[inline]
pub fn add_sub_widen_i32(dst: &mut [i32], new: &[i16], old: &[i16]) {
    debug_assert_eq!(dst.len(), new.len());
    debug_assert_eq!(dst.len(), old.len());
    for i in 0..dst.len() {
        dst[i] = dst[i].wrapping_add(new[i] as i32).wrapping_sub(old[i] as i32);
    }
}

// =============================================================================
// f32 カーネル（ヘッドネットワーク用）
// =============================================================================

/// `dst[i] = src[i] as f32 * scale`
#[inline]
pub fn scale_i32_to_f32(dst: &mut [f32], src: &[i32], scale: f32) {
    debug_assert_eq!(dst.len(), src.len());
    for i in 0..dst.len() {
        dst[i] = src[i] as f32 * scale;
    }
}

/// 全結合層: `out[o] = bias[o] + Σ_i weight[o * IN + i] * input[i]`
#[inline]
pub fn linear_layer(out: &mut [f32], input: &[f32], weight: &[f32], bias: &[f32]) {
    debug_assert_eq!(out.len(), bias.len());
    debug_assert_eq!(weight.len(), out.len() * input.len());
    let in_dim = input.len();
    for (o, out_v) in out.iter_mut().enumerate() {
        let row = &weight[o * in_dim..(o + 1) * in_dim];
        let mut sum = bias[o];
        for i in 0..in_dim {
            sum += row[i] * input[i];
        }
        *out_v = sum;
    }
}

/// 全結合層 + ReLU
#[inline]
pub fn linear_layer_relu(out: &mut [f32], input: &[f32], weight: &[f32], bias: &[f32]) {
    linear_layer(out, input, weight, bias);
    for v in out.iter_mut() {
        *v = v.max(0.0);
    }
}

/// PReLU 層: `v = max(v, v * w)`
#[inline]
pub fn prelu_f32(inout: &mut [f32], weight: &[f32]) {
    debug_assert_eq!(inout.len(), weight.len());
    for i in 0..inout.len() {
        inout[i] = inout[i].max(inout[i] * weight[i]);
    }
}

/// `dst[i] += src[i]`
#[inline]
pub fn add_f32(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    for i in 0..dst.len() {
        dst[i] += src[i];
    }
}

/// 内積
#[inline]
pub fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}
