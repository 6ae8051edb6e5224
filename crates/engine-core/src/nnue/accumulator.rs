//! アキュムレータ
//!
//! セルごとの特徴ベクトル（mapSum）、3x3 depthwise conv の特徴マップ、
//! グループ別・全体の value 和を、1 手の変化に対して差分更新で維持
//! する。盤全体の再計算は `clear` のみ。
//!
//! conv 後の value 和 `Σ relu(conv)` は mapSum に対して非線形なので、
//! 「カーネル差分 × 特徴差分」では更新できない。影響ウィンドウ全体を
//! いったん引き、conv マップをその場で差し替え、ウィンドウ全体を足し
//! 直すことで、盤サイズでなくウィンドウ面積に比例する計算量で一致を
//! 保つ。

use super::constants::{
    FEATURE_DIM, FEATURE_DWCONV_DIM, NUM_GROUPS, POLICY_DIM, VALUE_DIM, VALUE_GROUP_DIM,
};
use super::shape;
use super::simd::{self, AlignedBox};
use super::weights::{Weight, VALUE_L1_IN_DIM};
use crate::board::MAX_BOARD_SIZE;
use crate::eval::PolicyBuffer;
use crate::types::Color;

/// value 和（全体 + 3x3 グループ別）
///
/// チャネル `[0, FEATURE_DWCONV_DIM)` は conv 経由（ReLU 後）、
/// `[FEATURE_DWCONV_DIM, FEATURE_DIM)` は mapSum の PReLU 直結。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueSum {
    pub global: [i32; FEATURE_DIM],
    pub group: [[[i32; FEATURE_DIM]; NUM_GROUPS]; NUM_GROUPS],
}

impl ValueSum {
    pub const ZERO: ValueSum = ValueSum {
        global: [0; FEATURE_DIM],
        group: [[[0; FEATURE_DIM]; NUM_GROUPS]; NUM_GROUPS],
    };
}

/// 片側手番ぶんの差分評価状態
#[derive(Debug)]
pub struct Accumulator {
    board_size: i32,
    full_board_size: i32,
    board_size_scale: f32,
    /// 行（= 列）ごとのグループ番号
    group_index: [usize; MAX_BOARD_SIZE],
    group_size_scale: [[f32; NUM_GROUPS]; NUM_GROUPS],
    /// 盤上の石数（ヘッドバケット選択に使う）
    stone_count: i32,
    /// セルごとの 4 方向シェイプインデックス
    index_table: Vec<[u32; 4]>,
    /// セルごとの 4 方向 mapping 和
    map_sum: AlignedBox<[i16; FEATURE_DIM]>,
    /// (N+2)x(N+2) パディンググリッド上の conv 特徴マップ
    map_after_dwconv: AlignedBox<[i16; FEATURE_DWCONV_DIM]>,
    value_sum: ValueSum,
}

impl Accumulator {
    /// 指定盤面サイズのアキュムレータを確保する
    ///
    /// 状態は未初期化に近いので、使用前に必ず `clear` を呼ぶこと。
    pub fn new(board_size: i32) -> Accumulator {
        let n = board_size;
        assert!(
            (5..=MAX_BOARD_SIZE as i32).contains(&n),
            "board size out of range: {n}"
        );
        let full = n + 2;

        // 行を 3 グループへ分割（列も同じ分割を使う）
        let size1 = n / 3 + (n % 3 == 2) as i32;
        let size2 = (n / 3) * 2 + (n % 3 > 0) as i32;
        let mut group_index = [0usize; MAX_BOARD_SIZE];
        for (i, g) in group_index.iter_mut().enumerate().take(n as usize) {
            let i = i as i32;
            *g = (i >= size1) as usize + (i >= size2) as usize;
        }

        let mut group_size = [[0i32; NUM_GROUPS]; NUM_GROUPS];
        for y in 0..n as usize {
            for x in 0..n as usize {
                group_size[group_index[y]][group_index[x]] += 1;
            }
        }
        let mut group_size_scale = [[0.0f32; NUM_GROUPS]; NUM_GROUPS];
        for i in 0..NUM_GROUPS {
            for j in 0..NUM_GROUPS {
                debug_assert!(group_size[i][j] > 0, "empty value-sum group ({i}, {j})");
                group_size_scale[i][j] = 1.0 / group_size[i][j] as f32;
            }
        }

        Accumulator {
            board_size: n,
            full_board_size: full,
            board_size_scale: 1.0 / (n * n) as f32,
            group_index,
            group_size_scale,
            stone_count: 0,
            index_table: vec![[0; 4]; (n * n) as usize],
            map_sum: AlignedBox::new_zeroed((n * n) as usize),
            map_after_dwconv: AlignedBox::new_zeroed((full * full) as usize),
            value_sum: ValueSum::ZERO,
        }
    }

    /// 空盤面の状態へ全再構築する
    pub fn clear(&mut self, w: &Weight) {
        shape::init_index_table(&mut self.index_table, self.board_size);
        self.stone_count = 0;

        for cell in self.map_after_dwconv.iter_mut() {
            *cell = w.feature_dwconv_bias;
        }
        self.value_sum = ValueSum::ZERO;

        let n = self.board_size as usize;
        let full = self.full_board_size as usize;
        let mut feat = [0i16; FEATURE_DIM];
        for y in 0..n {
            for x in 0..n {
                let inner = y * n + x;

                let mut sum = [0i16; FEATURE_DIM];
                for dir in 0..4 {
                    simd::add_i16(&mut sum, &w.mapping[self.index_table[inner][dir] as usize]);
                }
                self.map_sum[inner] = sum;

                simd::prelu_i16(&mut feat, &sum, &w.map_prelu_weight);

                // 先頭チャネルは 3x3 近傍の conv マップへ散布
                for dy in 0..3usize {
                    for dx in 0..3usize {
                        let outer = (y + dy) * full + (x + dx);
                        simd::mulhrs_add_i16(
                            &mut self.map_after_dwconv[outer],
                            &feat[..FEATURE_DWCONV_DIM],
                            &w.feature_dwconv_weight[8 - dy * 3 - dx],
                        );
                    }
                }

                // 残りのチャネルは value 和へ直結
                let (gi, gj) = (self.group_index[y], self.group_index[x]);
                simd::add_widen_i32(
                    &mut self.value_sum.global[FEATURE_DWCONV_DIM..],
                    &feat[FEATURE_DWCONV_DIM..],
                );
                simd::add_widen_i32(
                    &mut self.value_sum.group[gi][gj][FEATURE_DWCONV_DIM..],
                    &feat[FEATURE_DWCONV_DIM..],
                );
            }
        }

        // conv マップの内部を ReLU して value 和へ加算
        for y in 0..n {
            for x in 0..n {
                let conv = self.map_after_dwconv[(y + 1) * full + (x + 1)];
                let (gi, gj) = (self.group_index[y], self.group_index[x]);
                simd::add_relu_widen_i32(
                    &mut self.value_sum.global[..FEATURE_DWCONV_DIM],
                    &conv,
                );
                simd::add_relu_widen_i32(
                    &mut self.value_sum.group[gi][gj][..FEATURE_DWCONV_DIM],
                    &conv,
                );
            }
        }
    }

    /// 着手の差分更新
    pub fn update_move(&mut self, w: &Weight, color: Color, x: i32, y: i32) {
        debug_assert!(color.is_stone());
        self.update_impl::<true>(w, color.digit(), x, y, None);
        self.stone_count += 1;
    }

    /// 取り消しの差分更新
    ///
    /// value 和は再計算せず、対になる着手の前に呼び出し側が保存した
    /// スナップショットから復元する。
    pub fn update_undo(&mut self, w: &Weight, color: Color, x: i32, y: i32, backup: &ValueSum) {
        debug_assert!(color.is_stone());
        self.update_impl::<false>(w, -color.digit(), x, y, Some(backup));
        self.stone_count -= 1;
    }

    fn update_impl<const IS_MOVE: bool>(
        &mut self,
        w: &Weight,
        d_digit: i32,
        x: i32,
        y: i32,
        backup: Option<&ValueSum>,
    ) {
        let n = self.board_size;
        let full = self.full_board_size as usize;

        // 変化セルの conv 出力が依存する範囲（パディング座標）。
        // mapSum はライン上 ±5 まで変わり、3x3 ステンシルで ±1 広がる
        let x0 = (x - 5).max(1) as usize;
        let y0 = (y - 5).max(1) as usize;
        let x1 = (x + 7).min(n) as usize;
        let y1 = (y + 7).min(n) as usize;

        if IS_MOVE {
            // ウィンドウの conv 寄与をいったん引く
            for yi in y0..=y1 {
                let gi = self.group_index[yi - 1];
                for xi in x0..=x1 {
                    let gj = self.group_index[xi - 1];
                    let conv = self.map_after_dwconv[yi * full + xi];
                    simd::sub_relu_widen_i32(
                        &mut self.value_sum.global[..FEATURE_DWCONV_DIM],
                        &conv,
                    );
                    simd::sub_relu_widen_i32(
                        &mut self.value_sum.group[gi][gj][..FEATURE_DWCONV_DIM],
                        &conv,
                    );
                }
            }
        }

        let changes = shape::update_index_table(&mut self.index_table, n, x, y, d_digit);
        let changes = changes.as_slice();

        let mut old_feats = [0i16; FEATURE_DIM];
        let mut new_feats = [0i16; FEATURE_DIM];
        for (i, c) in changes.iter().enumerate() {
            if let Some(next) = changes.get(i + 1) {
                simd::prefetch_read(w.mapping[next.old_shape as usize].as_ptr());
                simd::prefetch_read(w.mapping[next.new_shape as usize].as_ptr());
            }

            // mapSum を差し替え、新旧両方の PReLU を取る
            let old_sum = self.map_sum[c.inner_idx];
            let mut new_sum = old_sum;
            simd::add_sub_i16(
                &mut new_sum,
                &w.mapping[c.new_shape as usize],
                &w.mapping[c.old_shape as usize],
            );
            self.map_sum[c.inner_idx] = new_sum;

            simd::prelu_i16(&mut old_feats, &old_sum, &w.map_prelu_weight);
            simd::prelu_i16(&mut new_feats, &new_sum, &w.map_prelu_weight);

            // conv マップの 3x3 パッチ
            for dy in 0..3usize {
                for dx in 0..3usize {
                    let outer = (c.y as usize + dy) * full + (c.x as usize + dx);
                    simd::mulhrs_sub_add_i16(
                        &mut self.map_after_dwconv[outer],
                        &old_feats[..FEATURE_DWCONV_DIM],
                        &new_feats[..FEATURE_DWCONV_DIM],
                        &w.feature_dwconv_weight[8 - dy * 3 - dx],
                    );
                }
            }

            if IS_MOVE {
                // 直結チャネルの差分
                let (gi, gj) = (
                    self.group_index[c.y as usize],
                    self.group_index[c.x as usize],
                );
                simd::add_sub_widen_i32(
                    &mut self.value_sum.global[FEATURE_DWCONV_DIM..],
                    &new_feats[FEATURE_DWCONV_DIM..],
                    &old_feats[FEATURE_DWCONV_DIM..],
                );
                simd::add_sub_widen_i32(
                    &mut self.value_sum.group[gi][gj][FEATURE_DWCONV_DIM..],
                    &new_feats[FEATURE_DWCONV_DIM..],
                    &old_feats[FEATURE_DWCONV_DIM..],
                );
            }
        }

        if IS_MOVE {
            // 差し替え後のウィンドウを足し直す
            for yi in y0..=y1 {
                let gi = self.group_index[yi - 1];
                for xi in x0..=x1 {
                    let gj = self.group_index[xi - 1];
                    let conv = self.map_after_dwconv[yi * full + xi];
                    simd::add_relu_widen_i32(
                        &mut self.value_sum.global[..FEATURE_DWCONV_DIM],
                        &conv,
                    );
                    simd::add_relu_widen_i32(
                        &mut self.value_sum.group[gi][gj][..FEATURE_DWCONV_DIM],
                        &conv,
                    );
                }
            }
        } else {
            self.value_sum = *backup.expect("undo update requires a value-sum snapshot");
        }
    }

    /// 手番側から見た (win, loss, draw) ロジットを計算する
    pub fn evaluate_value(&self, w: &Weight) -> (f32, f32, f32) {
        let bucket = w.bucket(self.stone_count);

        // int32 和を float へ変換
        let mut layer0 = [0.0f32; VALUE_L1_IN_DIM];
        let mut group0 = [[[0.0f32; FEATURE_DIM]; NUM_GROUPS]; NUM_GROUPS];
        self.value_sum_to_float(
            &mut layer0[..FEATURE_DIM],
            w,
            &self.value_sum.global,
            self.board_size_scale,
        );
        for i in 0..NUM_GROUPS {
            for j in 0..NUM_GROUPS {
                self.value_sum_to_float(
                    &mut group0[i][j],
                    w,
                    &self.value_sum.group[i][j],
                    self.group_size_scale[i][j],
                );
            }
        }

        // グループ射影（角 / 辺 / 中央で重みを使い分ける）
        let mut group1 = [[[0.0f32; VALUE_GROUP_DIM]; NUM_GROUPS]; NUM_GROUPS];
        for i in 0..NUM_GROUPS {
            for j in 0..NUM_GROUPS {
                let (wgt, bias, prelu): (&[f32], &[f32], &[f32]) = if i == 1 && j == 1 {
                    (
                        &bucket.value_center_weight,
                        &bucket.value_center_bias,
                        &bucket.value_center_prelu,
                    )
                } else if i == 1 || j == 1 {
                    (
                        &bucket.value_edge_weight,
                        &bucket.value_edge_bias,
                        &bucket.value_edge_prelu,
                    )
                } else {
                    (
                        &bucket.value_corner_weight,
                        &bucket.value_corner_bias,
                        &bucket.value_corner_prelu,
                    )
                };
                simd::linear_layer(&mut group1[i][j], &group0[i][j], wgt, bias);
                simd::prelu_f32(&mut group1[i][j], prelu);
            }
        }

        // 2x2 クアドラント: 隣接 4 グループの和を射影
        for i in 0..2 {
            for j in 0..2 {
                let mut sum = group1[i][j];
                simd::add_f32(&mut sum, &group1[i][j + 1]);
                simd::add_f32(&mut sum, &group1[i + 1][j]);
                simd::add_f32(&mut sum, &group1[i + 1][j + 1]);

                let mut quad = [0.0f32; VALUE_GROUP_DIM];
                simd::linear_layer(&mut quad, &sum, &bucket.value_quad_weight, &bucket.value_quad_bias);
                simd::prelu_f32(&mut quad, &bucket.value_quad_prelu);

                let offset = FEATURE_DIM + (i * 2 + j) * VALUE_GROUP_DIM;
                layer0[offset..offset + VALUE_GROUP_DIM].copy_from_slice(&quad);
            }
        }

        // 隠れ層 2 段 + 出力層
        let mut layer1 = [0.0f32; VALUE_DIM];
        simd::linear_layer_relu(&mut layer1, &layer0, &bucket.value_l1_weight, &bucket.value_l1_bias);
        let mut layer2 = [0.0f32; VALUE_DIM];
        simd::linear_layer_relu(&mut layer2, &layer1, &bucket.value_l2_weight, &bucket.value_l2_bias);
        let mut out = [0.0f32; 4];
        simd::linear_layer(&mut out, &layer2, &bucket.value_l3_weight, &bucket.value_l3_bias);

        (out[0], out[1], out[2])
    }

    /// compute flag の立ったセルのポリシー値を計算する
    ///
    /// 全体 value 和から動的 point-wise conv の重みを生成し、各セルの
    /// conv 特徴と掛け合わせる。
    pub fn evaluate_policy(&self, w: &Weight, buffer: &mut PolicyBuffer) {
        let bucket = w.bucket(self.stone_count);

        let mut global_mean = [0.0f32; FEATURE_DIM];
        self.value_sum_to_float(
            &mut global_mean,
            w,
            &self.value_sum.global,
            self.board_size_scale,
        );

        // 動的 pwconv の重み（4 本 × POLICY_DIM）
        let mut pwconv1 = [0.0f32; POLICY_DIM];
        simd::linear_layer(
            &mut pwconv1,
            &global_mean,
            &bucket.policy_pwconv_layer_l1_weight,
            &bucket.policy_pwconv_layer_l1_bias,
        );
        simd::prelu_f32(&mut pwconv1, &bucket.policy_pwconv_layer_l1_prelu);

        let mut pwconv2 = [0.0f32; 4 * POLICY_DIM];
        simd::linear_layer(
            &mut pwconv2,
            &pwconv1,
            &bucket.policy_pwconv_layer_l2_weight,
            &bucket.policy_pwconv_layer_l2_bias,
        );

        let n = self.board_size as usize;
        let full = self.full_board_size as usize;
        let mut feat = [0.0f32; POLICY_DIM];
        for y in 0..n {
            for x in 0..n {
                let inner = y * n + x;
                if !buffer.compute_flag_at(inner) {
                    continue;
                }

                let conv = &self.map_after_dwconv[(y + 1) * full + (x + 1)];
                for (f, &c) in feat.iter_mut().zip(conv.iter()) {
                    *f = c.max(0) as f32;
                }

                let mut policy = [0.0f32; 4];
                for k in 0..4 {
                    policy[k] = simd::dot_f32(&feat, &pwconv2[k * POLICY_DIM..(k + 1) * POLICY_DIM]);
                }
                // 出力の split PReLU（符号でチャネル重みを切り替え）
                for k in 0..4 {
                    let pw = if policy[k] < 0.0 {
                        bucket.policy_output_neg_weight[k]
                    } else {
                        bucket.policy_output_pos_weight[k]
                    };
                    policy[k] *= pw;
                }
                buffer.set_by_index(
                    inner,
                    policy[0] + policy[1] + policy[2] + policy[3] + bucket.policy_output_bias,
                );
            }
        }
    }

    fn value_sum_to_float(
        &self,
        out: &mut [f32],
        w: &Weight,
        vsum: &[i32; FEATURE_DIM],
        size_scale: f32,
    ) {
        simd::scale_i32_to_f32(
            &mut out[..FEATURE_DWCONV_DIM],
            &vsum[..FEATURE_DWCONV_DIM],
            size_scale * w.value_sum_scale_after_conv,
        );
        simd::scale_i32_to_f32(
            &mut out[FEATURE_DWCONV_DIM..FEATURE_DIM],
            &vsum[FEATURE_DWCONV_DIM..],
            size_scale * w.value_sum_scale_direct,
        );
    }

    /// 現在の value 和（スナップショット保存用）
    #[inline]
    pub fn value_sum(&self) -> &ValueSum {
        &self.value_sum
    }

    /// セルごとの mapping 和
    #[inline]
    pub fn map_sum(&self) -> &[[i16; FEATURE_DIM]] {
        &self.map_sum
    }

    /// パディンググリッド上の conv 特徴マップ
    #[inline]
    pub fn map_after_dwconv(&self) -> &[[i16; FEATURE_DWCONV_DIM]] {
        &self.map_after_dwconv
    }

    /// 行・列のグループ番号（先頭 N 要素が有効）
    #[inline]
    pub fn group_index(&self) -> &[usize] {
        &self.group_index[..self.board_size as usize]
    }

    /// 盤上の石数
    #[inline]
    pub fn stone_count(&self) -> i32 {
        self.stone_count
    }
}
