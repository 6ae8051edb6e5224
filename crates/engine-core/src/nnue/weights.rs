//! NNUE 重みブロブとバイナリ読み込み
//!
//! 重みは読み込み後に不変で、レジストリ経由で評価器間に共有される。
//! バイナリ本体は標準ヘッダ（`eval::weight_store`）の後ろに続き、
//! 全フィールドがリトルエンディアン。本体の直後が EOF でなければ
//! 不正なファイルとして拒否する。

use super::constants::{
    FEATURE_DIM, FEATURE_DWCONV_DIM, MAX_NUM_BUCKETS, POLICY_DIM, SHAPE_NUM, VALUE_DIM,
    VALUE_GROUP_DIM,
};
use super::simd::AlignedBox;
use crate::eval::{EvaluatorError, WeightLoader};
use std::io::Read;

/// value 隠れ層 l1 の入力次元（global 特徴 + 4 クアドラント）
pub const VALUE_L1_IN_DIM: usize = FEATURE_DIM + 4 * VALUE_GROUP_DIM;

/// ヘッドバケット 1 つ分の密結合層パラメータ（すべて f32）
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct HeadBucket {
    // グループ射影（角 / 辺 / 中央）
    pub value_corner_weight: [f32; VALUE_GROUP_DIM * FEATURE_DIM],
    pub value_corner_bias: [f32; VALUE_GROUP_DIM],
    pub value_corner_prelu: [f32; VALUE_GROUP_DIM],
    pub value_edge_weight: [f32; VALUE_GROUP_DIM * FEATURE_DIM],
    pub value_edge_bias: [f32; VALUE_GROUP_DIM],
    pub value_edge_prelu: [f32; VALUE_GROUP_DIM],
    pub value_center_weight: [f32; VALUE_GROUP_DIM * FEATURE_DIM],
    pub value_center_bias: [f32; VALUE_GROUP_DIM],
    pub value_center_prelu: [f32; VALUE_GROUP_DIM],
    // クアドラント射影
    pub value_quad_weight: [f32; VALUE_GROUP_DIM * VALUE_GROUP_DIM],
    pub value_quad_bias: [f32; VALUE_GROUP_DIM],
    pub value_quad_prelu: [f32; VALUE_GROUP_DIM],
    // value 隠れ層
    pub value_l1_weight: [f32; VALUE_DIM * VALUE_L1_IN_DIM],
    pub value_l1_bias: [f32; VALUE_DIM],
    pub value_l2_weight: [f32; VALUE_DIM * VALUE_DIM],
    pub value_l2_bias: [f32; VALUE_DIM],
    pub value_l3_weight: [f32; 4 * VALUE_DIM],
    pub value_l3_bias: [f32; 4],
    // ポリシーの動的 point-wise conv 重み生成 MLP
    pub policy_pwconv_layer_l1_weight: [f32; POLICY_DIM * FEATURE_DIM],
    pub policy_pwconv_layer_l1_bias: [f32; POLICY_DIM],
    pub policy_pwconv_layer_l1_prelu: [f32; POLICY_DIM],
    pub policy_pwconv_layer_l2_weight: [f32; 4 * POLICY_DIM * POLICY_DIM],
    pub policy_pwconv_layer_l2_bias: [f32; 4 * POLICY_DIM],
    // ポリシー出力
    pub policy_output_pos_weight: [f32; 4],
    pub policy_output_neg_weight: [f32; 4],
    pub policy_output_bias: f32,
}

/// NNUE の重みブロブ
///
/// `mapping` はシェイプインデックス → 特徴ベクトルの大テーブル。
/// 差分更新のホットパスで行単位にランダムアクセスされるため、
/// キャッシュライン境界に揃えて確保する。
#[derive(Debug)]
pub struct Weight {
    pub mapping: AlignedBox<[i16; FEATURE_DIM]>,
    pub map_prelu_weight: [i16; FEATURE_DIM],
    pub feature_dwconv_weight: [[i16; FEATURE_DWCONV_DIM]; 9],
    pub feature_dwconv_bias: [i16; FEATURE_DWCONV_DIM],
    pub value_sum_scale_after_conv: f32,
    pub value_sum_scale_direct: f32,
    pub num_head_buckets: i32,
    pub buckets: AlignedBox<HeadBucket>,
}

impl Weight {
    /// ゼロ初期化された重みを確保する
    pub fn new_zeroed() -> Weight {
        Weight {
            mapping: AlignedBox::new_zeroed(SHAPE_NUM),
            map_prelu_weight: [0; FEATURE_DIM],
            feature_dwconv_weight: [[0; FEATURE_DWCONV_DIM]; 9],
            feature_dwconv_bias: [0; FEATURE_DWCONV_DIM],
            value_sum_scale_after_conv: 0.0,
            value_sum_scale_direct: 0.0,
            num_head_buckets: 1,
            buckets: AlignedBox::new_zeroed(MAX_NUM_BUCKETS),
        }
    }

    /// 局面に対応するヘッドバケットを選択する
    ///
    /// 石数の偶奇（= 手番の周期）で決まる安定・決定的な選択。
    /// 読み込んだバケット数に収まるよう折り返す。
    #[inline]
    pub fn bucket(&self, stone_count: i32) -> &HeadBucket {
        let index = (stone_count & 1) as usize % self.num_head_buckets.max(1) as usize;
        &self.buckets[index]
    }
}

/// 重み本体のバイナリリーダ
///
/// 標準ヘッダ解析の内側で呼ばれる。フィールドの並びはファイル
/// フォーマットそのもの（リオーダ禁止）。
pub struct NnueWeightLoader;

impl WeightLoader for NnueWeightLoader {
    type Weight = Weight;

    fn load(&mut self, reader: &mut dyn Read) -> Result<Box<Weight>, EvaluatorError> {
        let mut w = Box::new(Weight::new_zeroed());

        for row in w.mapping.iter_mut() {
            read_i16_slice(reader, row)?;
        }
        read_i16_slice(reader, &mut w.map_prelu_weight)?;
        for kernel in w.feature_dwconv_weight.iter_mut() {
            read_i16_slice(reader, kernel)?;
        }
        read_i16_slice(reader, &mut w.feature_dwconv_bias)?;
        w.value_sum_scale_after_conv = read_f32(reader)?;
        w.value_sum_scale_direct = read_f32(reader)?;

        w.num_head_buckets = read_i32(reader)?;
        if !(1..=MAX_NUM_BUCKETS as i32).contains(&w.num_head_buckets) {
            return Err(EvaluatorError::IncompatibleWeightFile(format!(
                "head bucket count out of range: {}",
                w.num_head_buckets
            )));
        }

        // 64 バイト境界までのパディング
        let mut padding = [0u8; 60];
        reader.read_exact(&mut padding)?;

        for i in 0..MAX_NUM_BUCKETS {
            if i < w.num_head_buckets as usize {
                read_head_bucket(reader, &mut w.buckets[i])?;
            }
            // 残りはゼロのまま
        }

        // 本体の直後が EOF でなければ拒否する
        let mut probe = [0u8; 1];
        if reader.read(&mut probe)? != 0 {
            return Err(EvaluatorError::IncompatibleWeightFile(
                "trailing bytes after weight body".to_string(),
            ));
        }

        Ok(w)
    }
}

fn read_head_bucket(reader: &mut dyn Read, bucket: &mut HeadBucket) -> Result<(), EvaluatorError> {
    read_f32_slice(reader, &mut bucket.value_corner_weight)?;
    read_f32_slice(reader, &mut bucket.value_corner_bias)?;
    read_f32_slice(reader, &mut bucket.value_corner_prelu)?;
    read_f32_slice(reader, &mut bucket.value_edge_weight)?;
    read_f32_slice(reader, &mut bucket.value_edge_bias)?;
    read_f32_slice(reader, &mut bucket.value_edge_prelu)?;
    read_f32_slice(reader, &mut bucket.value_center_weight)?;
    read_f32_slice(reader, &mut bucket.value_center_bias)?;
    read_f32_slice(reader, &mut bucket.value_center_prelu)?;
    read_f32_slice(reader, &mut bucket.value_quad_weight)?;
    read_f32_slice(reader, &mut bucket.value_quad_bias)?;
    read_f32_slice(reader, &mut bucket.value_quad_prelu)?;
    read_f32_slice(reader, &mut bucket.value_l1_weight)?;
    read_f32_slice(reader, &mut bucket.value_l1_bias)?;
    read_f32_slice(reader, &mut bucket.value_l2_weight)?;
    read_f32_slice(reader, &mut bucket.value_l2_bias)?;
    read_f32_slice(reader, &mut bucket.value_l3_weight)?;
    read_f32_slice(reader, &mut bucket.value_l3_bias)?;
    read_f32_slice(reader, &mut bucket.policy_pwconv_layer_l1_weight)?;
    read_f32_slice(reader, &mut bucket.policy_pwconv_layer_l1_bias)?;
    read_f32_slice(reader, &mut bucket.policy_pwconv_layer_l1_prelu)?;
    read_f32_slice(reader, &mut bucket.policy_pwconv_layer_l2_weight)?;
    read_f32_slice(reader, &mut bucket.policy_pwconv_layer_l2_bias)?;
    read_f32_slice(reader, &mut bucket.policy_output_pos_weight)?;
    read_f32_slice(reader, &mut bucket.policy_output_neg_weight)?;
    bucket.policy_output_bias = read_f32(reader)?;
    Ok(())
}

fn read_i16_slice(reader: &mut dyn Read, out: &mut [i16]) -> std::io::Result<()> {
    // 下層は BufReader / LZ4 デコーダなので、まとめ読みで変換する
    let mut buf = [0u8; 512];
    for chunk in out.chunks_mut(256) {
        let bytes = &mut buf[..chunk.len() * 2];
        reader.read_exact(bytes)?;
        for (i, v) in chunk.iter_mut().enumerate() {
            *v = i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        }
    }
    Ok(())
}

fn read_f32_slice(reader: &mut dyn Read, out: &mut [f32]) -> std::io::Result<()> {
    let mut buf = [0u8; 512];
    for chunk in out.chunks_mut(128) {
        let bytes = &mut buf[..chunk.len() * 4];
        reader.read_exact(bytes)?;
        for (i, v) in chunk.iter_mut().enumerate() {
            *v = f32::from_le_bytes([
                bytes[4 * i],
                bytes[4 * i + 1],
                bytes[4 * i + 2],
                bytes[4 * i + 3],
            ]);
        }
    }
    Ok(())
}

fn read_f32(reader: &mut dyn Read) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_i32(reader: &mut dyn Read) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}
