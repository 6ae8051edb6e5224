//! 重みファイルフォーマットの受理・拒否テスト
//!
//! ヘッダ（マジック / アーキテクチャハッシュ / ルールマスク / 盤面
//! サイズマスク）の検証と、本体長の厳密チェックを確認する。

use engine_core::eval::weight_store::WEIGHT_MAGIC;
use engine_core::nnue::constants::{
    ARCH_HASH, FEATURE_DIM, FEATURE_DWCONV_DIM, POLICY_DIM, SHAPE_NUM, VALUE_DIM, VALUE_GROUP_DIM,
};
use engine_core::nnue::weights::VALUE_L1_IN_DIM;
use engine_core::{Board, Evaluator, EvaluatorError, NnueEvaluator, Pos, Rule};
use std::io::Write;
use std::path::PathBuf;

/// ヘッドバケット 1 つ分の f32 要素数
fn head_bucket_f32_count() -> usize {
    3 * (VALUE_GROUP_DIM * FEATURE_DIM + 2 * VALUE_GROUP_DIM)
        + (VALUE_GROUP_DIM * VALUE_GROUP_DIM + 2 * VALUE_GROUP_DIM)
        + (VALUE_DIM * VALUE_L1_IN_DIM + VALUE_DIM)
        + (VALUE_DIM * VALUE_DIM + VALUE_DIM)
        + (4 * VALUE_DIM + 4)
        + (POLICY_DIM * FEATURE_DIM + 2 * POLICY_DIM)
        + (4 * POLICY_DIM * POLICY_DIM + 4 * POLICY_DIM)
        + 4
        + 4
        + 1
}

struct FileSpec {
    magic: u32,
    arch_hash: u32,
    rule_mask: u32,
    boardsize_mask: u32,
    num_head_buckets: i32,
    truncate_body: bool,
    trailing_bytes: usize,
}

impl Default for FileSpec {
    fn default() -> Self {
        FileSpec {
            magic: WEIGHT_MAGIC,
            arch_hash: ARCH_HASH,
            rule_mask: 0x7,
            boardsize_mask: 0xFFFF_FFFF,
            num_head_buckets: 1,
            truncate_body: false,
            trailing_bytes: 0,
        }
    }
}

/// LZ4 フレームで包んだ重みファイルを書き出す
fn write_weight_file(dir: &tempfile::TempDir, name: &str, spec: &FileSpec) -> PathBuf {
    let path = dir.path().join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = lz4_flex::frame::FrameEncoder::new(file);

    // 標準ヘッダ
    let desc = b"format test weight";
    encoder.write_all(&spec.magic.to_le_bytes()).unwrap();
    encoder.write_all(&spec.arch_hash.to_le_bytes()).unwrap();
    encoder.write_all(&spec.rule_mask.to_le_bytes()).unwrap();
    encoder.write_all(&spec.boardsize_mask.to_le_bytes()).unwrap();
    encoder.write_all(&(desc.len() as u32).to_le_bytes()).unwrap();
    encoder.write_all(desc).unwrap();

    // 本体（ゼロ埋めで十分）
    let mapping_bytes = SHAPE_NUM * FEATURE_DIM * 2;
    let body_bytes = if spec.truncate_body {
        mapping_bytes / 2
    } else {
        mapping_bytes
            + FEATURE_DIM * 2
            + 9 * FEATURE_DWCONV_DIM * 2
            + FEATURE_DWCONV_DIM * 2
    };

    let zeros = [0u8; 64 * 1024];
    let mut remaining = body_bytes;
    while remaining > 0 {
        let n = remaining.min(zeros.len());
        encoder.write_all(&zeros[..n]).unwrap();
        remaining -= n;
    }

    if !spec.truncate_body {
        encoder.write_all(&1.0f32.to_le_bytes()).unwrap(); // value_sum_scale_after_conv
        encoder.write_all(&1.0f32.to_le_bytes()).unwrap(); // value_sum_scale_direct
        encoder.write_all(&spec.num_head_buckets.to_le_bytes()).unwrap();
        encoder.write_all(&[0u8; 60]).unwrap();

        let mut remaining = head_bucket_f32_count() * 4 * spec.num_head_buckets.max(0) as usize;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            encoder.write_all(&zeros[..n]).unwrap();
            remaining -= n;
        }

        for _ in 0..spec.trailing_bytes {
            encoder.write_all(&[0xA5u8]).unwrap();
        }
    }

    encoder.finish().unwrap();
    path
}

#[test]
fn well_formed_file_loads_and_evaluates() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_weight_file(&dir, "ok.bin", &FileSpec::default());

    let mut evaluator = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap();

    // ゼロ重みならロジットはすべて 0 → レートは 1/3 ずつ
    let mut board = Board::new(15);
    let pos = Pos::new(7, 7);
    evaluator.before_move(&board, pos);
    board.do_move(pos);

    let value = evaluator.evaluate_value(&board);
    assert!((value.win() - 1.0 / 3.0).abs() < 1e-6);
    assert!((value.win() + value.loss() + value.draw() - 1.0).abs() < 1e-5);
}

#[test]
fn same_path_shares_weight_blob() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_weight_file(&dir, "shared.bin", &FileSpec::default());

    // 黒白同一パスなら同じブロブを指す
    let evaluator = NnueEvaluator::new(15, Rule::Standard, &path, &path).unwrap();
    assert!(std::sync::Arc::ptr_eq(
        evaluator.weight(engine_core::Color::Black),
        evaluator.weight(engine_core::Color::White),
    ));
}

#[test]
fn bad_magic_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = FileSpec {
        magic: 0xdead_beef,
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "magic.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(err, EvaluatorError::IncompatibleWeightFile(_)));
}

#[test]
fn arch_hash_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = FileSpec {
        arch_hash: ARCH_HASH ^ 0x100,
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "arch.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(err, EvaluatorError::IncompatibleWeightFile(_)));
}

#[test]
fn missing_rule_bit_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = FileSpec {
        rule_mask: Rule::Standard.mask_bit() | Rule::Renju.mask_bit(),
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "rule.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(
        err,
        EvaluatorError::UnsupportedRule {
            rule: Rule::Freestyle
        }
    ));
}

#[test]
fn missing_boardsize_bit_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    // bit 14（サイズ 15）だけ落とす
    let spec = FileSpec {
        boardsize_mask: !(1u32 << 14),
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "size.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(
        err,
        EvaluatorError::UnsupportedBoardSize { board_size: 15 }
    ));

    // 対応しているサイズなら同じファイルで構築できる
    let evaluator = NnueEvaluator::new(19, Rule::Freestyle, &path, &path);
    assert!(evaluator.is_ok());
}

#[test]
fn truncated_body_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = FileSpec {
        truncate_body: true,
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "short.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(err, EvaluatorError::Io(_)));
}

#[test]
fn trailing_bytes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = FileSpec {
        trailing_bytes: 8,
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "long.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(err, EvaluatorError::IncompatibleWeightFile(_)));
}

#[test]
fn head_bucket_count_out_of_range_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let spec = FileSpec {
        num_head_buckets: 9,
        ..FileSpec::default()
    };
    let path = write_weight_file(&dir, "buckets.bin", &spec);

    let err = NnueEvaluator::new(15, Rule::Freestyle, &path, &path).unwrap_err();
    assert!(matches!(err, EvaluatorError::IncompatibleWeightFile(_)));
}
