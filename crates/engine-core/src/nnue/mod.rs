//! インクリメンタル NNUE 評価
//!
//! 盤面の 1 手変化に対して、影響を受ける近傍だけを再計算する
//! 評価ネットワーク。
//!
//! - `constants`: ネットワーク次元とシェイプ定数
//! - `simd`: ベクトル演算の狭いインターフェース（スカラ + AVX2）
//! - `shape`: 4 方向 3 進シェイプインデックステーブル
//! - `weights`: 重みブロブとバイナリ読み込み
//! - `accumulator`: マップ和・dwconv マップ・value 和の差分管理
//! - `evaluator`: 遅延 move cache つきの評価器ファサード

pub mod accumulator;
pub mod constants;
pub mod evaluator;
pub mod shape;
pub mod simd;
pub mod weights;

pub use accumulator::{Accumulator, ValueSum};
pub use evaluator::NnueEvaluator;
pub use weights::{HeadBucket, NnueWeightLoader, Weight};
