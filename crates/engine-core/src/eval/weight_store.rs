//! 重みストア
//!
//! 重みファイルの読み込みは合成可能なローダで構成する:
//! 外側から LZ4 展開 → 標準ヘッダ解析 → フォーマット固有の本体読み。
//!
//! `WeightRegistry` は読み込んだ重みブロブのプロセス全体プール。
//! 同一パスの重みは一度だけ読み、`Arc` で共有する。エンジン起動時
//! にしか呼ばれないため、ファイル I/O はロック内で行ってよい。

use super::EvaluatorError;
use crate::types::Rule;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// 標準重みフォーマットのマジック定数
///
/// crc32("gomoku network weight version 1")
pub const WEIGHT_MAGIC: u32 = 0xacd8_cc6a;

/// 重みローダのベーストレイト
pub trait WeightLoader {
    /// 読み込む重みの型
    type Weight;

    /// 入力ストリームから重みを構築する
    fn load(&mut self, reader: &mut dyn Read) -> Result<Box<Self::Weight>, EvaluatorError>;
}

/// 標準重みフォーマットのヘッダ
#[derive(Debug, Clone)]
pub struct StandardHeader {
    /// ネットワーク構造のハッシュ
    pub arch_hash: u32,
    /// 対応ルールのビットマスク
    pub rule_mask: u32,
    /// 対応盤面サイズのビットマスク（bit i = サイズ i+1）
    pub boardsize_mask: u32,
    /// 重みの説明文
    pub description: String,
}

impl StandardHeader {
    /// 指定ルールに対応しているか
    #[inline]
    pub fn supports_rule(&self, rule: Rule) -> bool {
        self.rule_mask & rule.mask_bit() != 0
    }

    /// 指定盤面サイズに対応しているか
    #[inline]
    pub fn supports_board_size(&self, board_size: i32) -> bool {
        (1..=32).contains(&board_size) && (self.boardsize_mask >> (board_size - 1)) & 0x1 != 0
    }
}

/// ヘッダ検証コールバック
pub type HeaderValidator = Box<dyn FnMut(&StandardHeader) -> Result<(), EvaluatorError> + Send>;

/// LZ4 圧縮ストリームを展開してから内側のローダへ渡すラッパ
pub struct CompressedLoader<L> {
    inner: L,
}

impl<L> CompressedLoader<L> {
    pub fn new(inner: L) -> Self {
        Self { inner }
    }
}

impl<L: WeightLoader> WeightLoader for CompressedLoader<L> {
    type Weight = L::Weight;

    fn load(&mut self, reader: &mut dyn Read) -> Result<Box<Self::Weight>, EvaluatorError> {
        let mut decoder = lz4_flex::frame::FrameDecoder::new(reader);
        self.inner.load(&mut decoder)
    }
}

/// 標準ヘッダを解析・検証してから内側のローダへ渡すラッパ
pub struct StandardHeaderLoader<L> {
    inner: L,
    validator: Option<HeaderValidator>,
}

impl<L> StandardHeaderLoader<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            validator: None,
        }
    }

    /// ヘッダ検証コールバックを設定する
    ///
    /// コールバックが `Err` を返すと読み込み全体が失敗する。
    pub fn set_header_validator(&mut self, validator: HeaderValidator) {
        self.validator = Some(validator);
    }
}

impl<L: WeightLoader> WeightLoader for StandardHeaderLoader<L> {
    type Weight = L::Weight;

    fn load(&mut self, reader: &mut dyn Read) -> Result<Box<Self::Weight>, EvaluatorError> {
        let magic = read_u32_le(reader)?;
        if magic != WEIGHT_MAGIC {
            return Err(EvaluatorError::IncompatibleWeightFile(format!(
                "bad magic 0x{magic:08x}"
            )));
        }

        let arch_hash = read_u32_le(reader)?;
        let rule_mask = read_u32_le(reader)?;
        let boardsize_mask = read_u32_le(reader)?;
        let desc_len = read_u32_le(reader)? as usize;

        let mut desc_bytes = vec![0u8; desc_len];
        reader.read_exact(&mut desc_bytes)?;
        let description = String::from_utf8_lossy(&desc_bytes).into_owned();

        if let Some(validator) = self.validator.as_mut() {
            validator(&StandardHeader {
                arch_hash,
                rule_mask,
                boardsize_mask,
                description,
            })?;
        }

        self.inner.load(reader)
    }
}

fn read_u32_le(reader: &mut dyn Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// 読み込んだ重みのプロセス全体プール
///
/// パス（正規化したもの）をキーに `Weak` を保持する。最後の
/// `Arc` が落ちた時点でブロブは解放され、次の `acquire` で死んだ
/// エントリが刈り取られる。
pub struct WeightRegistry<W> {
    pool: Mutex<Vec<PoolEntry<W>>>,
}

struct PoolEntry<W> {
    path: PathBuf,
    weight: Weak<W>,
}

impl<W> WeightRegistry<W> {
    /// 空のレジストリを作成
    pub const fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    /// 重みを取得する
    ///
    /// 同一パスの重みが生きていればそれを共有し、なければローダで
    /// 一度だけ読み込む。
    pub fn acquire<L>(&self, path: &Path, loader: &mut L) -> Result<Arc<W>, EvaluatorError>
    where
        L: WeightLoader<Weight = W>,
    {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut pool = self.pool.lock();
        pool.retain(|entry| entry.weight.strong_count() > 0);

        if let Some(entry) = pool.iter().find(|entry| entry.path == canonical) {
            if let Some(weight) = entry.weight.upgrade() {
                return Ok(weight);
            }
        }

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let weight: Arc<W> = Arc::from(loader.load(&mut reader)?);
        log::info!("weight loaded from {}", canonical.display());

        pool.push(PoolEntry {
            path: canonical,
            weight: Arc::downgrade(&weight),
        });
        Ok(weight)
    }

    /// 生きているエントリ数（テスト・診断用）
    pub fn live_count(&self) -> usize {
        let mut pool = self.pool.lock();
        pool.retain(|entry| entry.weight.strong_count() > 0);
        pool.len()
    }
}

impl<W> Default for WeightRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}
