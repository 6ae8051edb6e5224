//! 置換表モジュール
//!
//! 探索結果をキャッシュするロッシーな共有テーブル。
//!
//! - `TTEntry`: 16 バイトエントリ（XOR キー保護、2 ワードの
//!   relaxed アトミック load/store）
//! - `Bucket`: キャッシュライン境界に揃えた 4 エントリの束
//! - `HashTable`: probe/store、世代管理、スナップショット入出力
//!
//! エントリ単位のロックは持たない。裂けた書き込み（torn write）は
//! XOR で壊れたキーが 32bit 照合に落ちることで検出される。

mod alloc;
mod entry;
mod table;

pub use entry::{Bucket, TTEntry, TTHit};
pub use table::HashTable;

/// 1 バケットあたりのエントリ数
pub const ENTRIES_PER_BUCKET: usize = 4;
