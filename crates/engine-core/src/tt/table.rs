//! 置換表本体
//!
//! バケット配列・probe/store・世代管理・スナップショット入出力。
//!
//! probe/store はロックなし。resize / clear / load だけは全ワーカの
//! 停止中に呼ぶこと（`&mut self` を要求して誤用をコンパイル時に
//! 防いでいる）。

use super::alloc::Allocation;
use super::entry::{decode, decode_key, pack_pv_bound_best, Bucket, EntryData, TTHit};
use super::ENTRIES_PER_BUCKET;
use crate::types::{Bound, Pos, Value, DEPTH_LOWER_BOUND};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU8, Ordering};

/// スナップショットの先頭 32 バイトマジック（NUL パディング）
const HASH_DUMP_MAGIC: &[u8; 32] = b"RAPFI HASH DUMP VER 001\0\0\0\0\0\0\0\0\0";

/// 共有置換表
pub struct HashTable {
    table: Allocation,
    num_buckets: usize,
    generation: AtomicU8,
}

impl HashTable {
    /// 指定容量（KiB）の置換表を作る
    pub fn new(size_kb: usize) -> HashTable {
        // 確保直後はゼロページなのでクリア不要
        let (table, num_buckets) = allocate_buckets(desired_buckets(size_kb));
        HashTable {
            table,
            num_buckets,
            generation: AtomicU8::new(0),
        }
    }

    /// 容量を変更する（探索停止中のみ）
    pub fn resize(&mut self, size_kb: usize) {
        let desired = desired_buckets(size_kb);
        if desired == self.num_buckets {
            return;
        }

        let (table, num_buckets) = allocate_buckets(desired);
        self.table = table;
        self.num_buckets = num_buckets;
        self.clear();
    }

    /// 全バケットをゼロにして世代を戻す（探索停止中のみ)
    ///
    /// 大きなテーブルは利用可能な並列度でストライプに分けてゼロ化
    /// する。
    pub fn clear(&mut self) {
        let bytes = self.num_buckets * std::mem::size_of::<Bucket>();
        // SAFETY: &mut self なので排他アクセス。確保済み領域全体を指す
        let slice =
            unsafe { std::slice::from_raw_parts_mut(self.table.ptr().as_ptr(), bytes) };

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        // 小さなテーブルにスレッドを立てても仕方がない
        if num_threads <= 1 || self.num_buckets < 64 * 1024 {
            slice.fill(0);
        } else {
            let stride = bytes.div_ceil(num_threads);
            std::thread::scope(|scope| {
                for chunk in slice.chunks_mut(stride) {
                    scope.spawn(move || chunk.fill(0));
                }
            });
        }

        self.generation.store(0, Ordering::Relaxed);
    }

    /// 新しい探索の開始（世代を 1 進める）
    pub fn new_search(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// 現在の世代
    #[inline]
    pub fn generation(&self) -> u8 {
        self.generation.load(Ordering::Relaxed)
    }

    /// バケット数（診断用）
    #[inline]
    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    #[inline]
    fn buckets(&self) -> &[Bucket] {
        // SAFETY: 領域は num_buckets 個の Bucket として確保・ゼロ初期化
        // 済み。エントリはアトミックなので共有参照越しの更新が許される
        unsafe {
            std::slice::from_raw_parts(self.table.ptr().as_ptr() as *const Bucket, self.num_buckets)
        }
    }

    /// ハッシュの一様な上位乗算でバケットを選ぶ（剰余なし）
    #[inline]
    fn bucket_index(&self, hash: u64) -> usize {
        ((hash as u128 * self.num_buckets as u128) >> 64) as usize
    }

    /// バケットのキャッシュラインを先読みする
    #[inline]
    pub fn prefetch(&self, hash: u64) {
        let bucket = &self.buckets()[self.bucket_index(hash)];

        #[cfg(target_arch = "x86_64")]
        // SAFETY: prefetch はメモリアクセスを伴わないヒント命令
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch::<_MM_HINT_T0>(bucket as *const Bucket as *const i8);
        }

        #[cfg(not(target_arch = "x86_64"))]
        let _ = bucket;
    }

    /// 置換表を検索する
    ///
    /// ヒット時はエントリの世代を現世代に更新（キーを再保護）し、
    /// 格納値を ply 基準の探索値に変換して返す。
    pub fn probe(&self, hash: u64, ply: i32) -> Option<TTHit> {
        let bucket = &self.buckets()[self.bucket_index(hash)];
        let key32 = hash as u32;

        for entry in &bucket.entries {
            let (w0, w1) = entry.load();
            if decode_key(w0, w1) == key32 {
                let mut data = decode(w0, w1);
                data.generation8 = self.generation();
                entry.store(&data);

                return Some(TTHit::from_entry(&data, ply));
            }
        }

        None
    }

    /// 探索結果を格納する
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        hash: u64,
        value: Value,
        eval: Value,
        is_pv: bool,
        bound: Bound,
        best_move: Pos,
        depth: i32,
        ply: i32,
    ) {
        let bucket = &self.buckets()[self.bucket_index(hash)];
        let key32 = hash as u32;
        let generation = self.generation();

        // 同一キーのスロットを優先し、なければ置き換え価値最小を選ぶ
        let mut replace = &bucket.entries[0];
        let mut replace_data = {
            let (w0, w1) = replace.load();
            decode(w0, w1)
        };
        for entry in &bucket.entries[1..] {
            if replace_data.key32 == key32 {
                break;
            }
            let (w0, w1) = entry.load();
            let data = decode(w0, w1);
            if data.key32 == key32
                || data.replace_value(generation) < replace_data.replace_value(generation)
            {
                replace = entry;
                replace_data = data;
            }
        }

        let same_key = replace_data.key32 == key32;

        // 同一局面は EXACT か、既存と同程度以上の深さのときだけ上書き
        if bound != Bound::Exact
            && same_key
            && depth + 2 < replace_data.depth8 as i32 + DEPTH_LOWER_BOUND
        {
            return;
        }

        // 今回最善手がないなら前回の手を残す
        let best_move = if best_move == Pos::NONE && same_key {
            replace_data.best_move()
        } else {
            best_move
        };

        debug_assert!(value == Value::NONE || (-Value::INFINITE.raw()..=Value::INFINITE.raw()).contains(&value.raw()));
        debug_assert!(depth > DEPTH_LOWER_BOUND && depth < DEPTH_LOWER_BOUND + 256);

        replace.store(&EntryData {
            key32,
            value16: value.to_stored(ply).raw() as i16,
            eval16: eval.raw() as i16,
            pv_bound_best16: pack_pv_bound_best(is_pv, bound, best_move),
            depth8: (depth - DEPTH_LOWER_BOUND) as u8,
            generation8: generation,
        });
    }

    /// 使用率をパーミルで見積もる
    ///
    /// 先頭 `num_buckets / 1024` バケットをサンプルし、深さが非ゼロ
    /// かつ現世代のエントリを数える。
    pub fn hash_usage(&self) -> i32 {
        let sample_count = self.num_buckets >> 10;
        if sample_count == 0 {
            return 0;
        }

        let generation = self.generation();
        let mut count = 0usize;
        for bucket in &self.buckets()[..sample_count] {
            for entry in &bucket.entries {
                let (w0, w1) = entry.load();
                let data = decode(w0, w1);
                count += (data.depth8 != 0 && data.generation8 == generation) as usize;
            }
        }

        (count * 1000 / (ENTRIES_PER_BUCKET * sample_count)) as i32
    }

    /// テーブル全体を LZ4 スナップショットへ書き出す
    pub fn dump(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(writer);

        encoder.write_all(HASH_DUMP_MAGIC)?;
        encoder.write_all(&(self.num_buckets as u64).to_le_bytes())?;
        encoder.write_all(&[self.generation()])?;

        for bucket in self.buckets() {
            for entry in &bucket.entries {
                let (w0, w1) = entry.raw_words();
                encoder.write_all(&w0.to_le_bytes())?;
                encoder.write_all(&w1.to_le_bytes())?;
            }
        }

        encoder.finish()?;
        Ok(())
    }

    /// LZ4 スナップショットからテーブルを復元する
    ///
    /// 失敗した場合は既存のテーブルに手を付けずにエラーを返す。
    pub fn load(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        use std::io::{Error, ErrorKind};

        let mut decoder = lz4_flex::frame::FrameDecoder::new(reader);

        let mut magic = [0u8; 32];
        decoder.read_exact(&mut magic)?;
        if &magic != HASH_DUMP_MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "bad hash dump magic"));
        }

        let mut buf8 = [0u8; 8];
        decoder.read_exact(&mut buf8)?;
        let num_buckets = u64::from_le_bytes(buf8) as usize;
        if num_buckets == 0 {
            return Err(Error::new(ErrorKind::InvalidData, "empty hash dump"));
        }

        let mut gen_buf = [0u8; 1];
        decoder.read_exact(&mut gen_buf)?;

        // 新しい領域へ読み込んでから差し替える
        let size = num_buckets * std::mem::size_of::<Bucket>();
        let table = Allocation::try_allocate(size, std::mem::align_of::<Bucket>())
            .ok_or_else(|| Error::new(ErrorKind::OutOfMemory, "hash dump allocation failed"))?;

        // SAFETY: 確保直後の排他アクセス
        let bytes = unsafe { std::slice::from_raw_parts_mut(table.ptr().as_ptr(), size) };
        decoder.read_exact(bytes)?;

        // 末尾に余分なバイトがあれば不正
        let mut probe = [0u8; 1];
        if decoder.read(&mut probe)? != 0 {
            return Err(Error::new(ErrorKind::InvalidData, "trailing bytes in hash dump"));
        }

        self.table = table;
        self.num_buckets = num_buckets;
        self.generation.store(gen_buf[0], Ordering::Relaxed);
        Ok(())
    }
}

/// KiB 指定をバケット数へ変換する
fn desired_buckets(size_kb: usize) -> usize {
    (size_kb * 1024 / std::mem::size_of::<Bucket>()).max(1)
}

/// 半減リトライつきの確保
///
/// 1 バケットすら確保できない場合だけ中断する。
fn allocate_buckets(desired: usize) -> (Allocation, usize) {
    let mut num_buckets = desired;
    loop {
        let size = num_buckets * std::mem::size_of::<Bucket>();
        if let Some(table) = Allocation::try_allocate(size, std::mem::align_of::<Bucket>()) {
            if num_buckets != desired {
                log::error!(
                    "failed to allocate {} KiB for transposition table",
                    desired * std::mem::size_of::<Bucket>() / 1024
                );
                log::info!(
                    "allocated {} KiB for transposition table",
                    num_buckets * std::mem::size_of::<Bucket>() / 1024
                );
            }
            log::debug!("transposition table allocation kind: {:?}", table.kind());
            return (table, num_buckets);
        }
        if num_buckets <= 1 {
            std::alloc::handle_alloc_error(
                std::alloc::Layout::from_size_align(size, std::mem::align_of::<Bucket>())
                    .expect("invalid bucket layout"),
            );
        }
        num_buckets /= 2;
    }
}
