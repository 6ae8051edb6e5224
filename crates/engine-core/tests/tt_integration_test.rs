//! 置換表の結合テスト
//!
//! 世代管理と置き換えポリシー、使用率サンプリング、スナップショット
//! 入出力を API 越しに確認する。

use engine_core::{Bound, HashTable, Pos, Value};

/// ハッシュから決定的に導出した格納値
fn value_of(hash: u64) -> Value {
    Value::new((hash % 4000) as i32 - 2000)
}

#[test]
fn bulk_store_probe_consistency() {
    let tt = HashTable::new(1024); // 1 MiB
    let hashes: Vec<u64> = (1..=5000u64).map(|i| i.wrapping_mul(0x2545_f491_4f6c_dd1d)).collect();

    for &h in &hashes {
        tt.store(
            h,
            value_of(h),
            Value::ZERO,
            false,
            Bound::Exact,
            Pos::NONE,
            10,
            0,
        );
    }

    let mut hits = 0usize;
    for &h in &hashes {
        if let Some(hit) = tt.probe(h, 0) {
            assert_eq!(hit.value, value_of(h), "probe returned foreign value");
            assert_eq!(hit.bound, Bound::Exact);
            assert_eq!(hit.depth, 10);
            hits += 1;
        }
    }
    // 1 MiB = 65536 エントリに 5000 件なので、追い出しはごく一部
    assert!(hits > 4500, "unexpected eviction rate: {hits}/5000");
}

#[test]
fn replacement_prefers_old_and_shallow() {
    // 16 バケットの極小テーブル。上位ビットが小さいハッシュは
    // すべてバケット 0 に入る
    let tt = HashTable::new(1);
    let h = [1u64, 2, 3, 4, 5];

    tt.store(h[0], Value::new(1), Value::ZERO, false, Bound::Exact, Pos::NONE, 10, 0);
    tt.new_search();
    tt.store(h[1], Value::new(2), Value::ZERO, false, Bound::Exact, Pos::NONE, 20, 0);
    tt.new_search();
    tt.new_search();
    tt.store(h[2], Value::new(3), Value::ZERO, false, Bound::Exact, Pos::NONE, 8, 0);
    tt.store(h[3], Value::new(4), Value::ZERO, false, Bound::Exact, Pos::NONE, 30, 0);

    // 置き換え価値 depth8 - age は h[0] が最小:
    //   h[0]: (10+5) - 3,  h[1]: (20+5) - 2,  h[2]: (8+5) - 0,  h[3]: (30+5) - 0
    tt.store(h[4], Value::new(5), Value::ZERO, false, Bound::Exact, Pos::NONE, 15, 0);

    assert!(tt.probe(h[0], 0).is_none(), "oldest+shallowest must be evicted");
    assert!(tt.probe(h[1], 0).is_some());
    assert!(tt.probe(h[2], 0).is_some());
    assert!(tt.probe(h[3], 0).is_some());
    assert!(tt.probe(h[4], 0).is_some());
}

#[test]
fn probe_refresh_protects_entry_from_eviction() {
    let tt = HashTable::new(1);
    let h = [11u64, 12, 13, 14, 15];

    // 深さ同一。h[0] と h[1] は古い世代、h[2] と h[3] は現世代
    tt.store(h[0], Value::new(1), Value::ZERO, false, Bound::Exact, Pos::NONE, 10, 0);
    tt.store(h[1], Value::new(2), Value::ZERO, false, Bound::Exact, Pos::NONE, 10, 0);
    tt.new_search();
    tt.new_search();
    tt.store(h[2], Value::new(3), Value::ZERO, false, Bound::Exact, Pos::NONE, 10, 0);
    tt.store(h[3], Value::new(4), Value::ZERO, false, Bound::Exact, Pos::NONE, 10, 0);

    // h[0] を probe して世代を現世代に引き上げる → 追い出し候補から外れ、
    // 古いままの h[1] が犠牲になる
    assert!(tt.probe(h[0], 0).is_some());
    tt.store(h[4], Value::new(5), Value::ZERO, false, Bound::Exact, Pos::NONE, 10, 0);

    assert!(tt.probe(h[0], 0).is_some(), "refreshed entry must survive");
    assert!(tt.probe(h[1], 0).is_none(), "stale entry must be evicted");
}

#[test]
fn hash_usage_tracks_current_generation() {
    let tt = HashTable::new(1024); // 16384 バケット → 16 サンプルバケット
    assert_eq!(tt.hash_usage(), 0);

    // サンプル領域に入るハッシュを 16 件格納する
    let sample_buckets = 16u64;
    let mut stored = 0;
    let mut h = 1u64;
    while stored < 16 {
        let index = ((h as u128 * 16384u128) >> 64) as u64;
        if index < sample_buckets && tt.probe(h, 0).is_none() {
            tt.store(h, Value::new(1), Value::ZERO, false, Bound::Exact, Pos::NONE, 5, 0);
            stored += 1;
        }
        h = h.wrapping_add(0x0000_3f5c_8a2b_11d7);
    }

    let usage = tt.hash_usage();
    assert!(usage > 0, "usage must count stored entries: {usage}");

    // 世代が進むと古いエントリは使用率に数えない
    tt.new_search();
    assert_eq!(tt.hash_usage(), 0);
}

#[test]
fn mate_scores_shift_with_probing_ply() {
    let tt = HashTable::new(64);

    tt.store(
        0xaaaa_bbbb_cccc_ddddu64,
        Value::mate_in(3),
        Value::ZERO,
        true,
        Bound::Exact,
        Pos::new(7, 7),
        12,
        7,
    );
    let hit = tt.probe(0xaaaa_bbbb_cccc_ddddu64, 12).unwrap();
    assert_eq!(hit.value, Value::mate_in(3 - 5));

    tt.store(
        0x1234_5678_9abc_def0u64,
        Value::mated_in(6),
        Value::ZERO,
        false,
        Bound::Upper,
        Pos::NONE,
        9,
        4,
    );
    let hit = tt.probe(0x1234_5678_9abc_def0u64, 10).unwrap();
    assert_eq!(hit.value, Value::mated_in(6 - 6));
    // 非詰みスコアは ply に依存しない
    assert_eq!(hit.eval, Value::ZERO);
}

#[test]
fn snapshot_preserves_entries_and_generation() {
    let tt = HashTable::new(128);
    tt.new_search();
    tt.new_search();

    let hashes: Vec<u64> = (1..=100u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)).collect();
    for (i, &h) in hashes.iter().enumerate() {
        tt.store(
            h,
            value_of(h),
            Value::new(i as i32),
            i % 3 == 0,
            if i % 2 == 0 { Bound::Exact } else { Bound::Lower },
            Pos::new((i % 15) as i32, (i % 7) as i32),
            (i % 30) as i32 + 1,
            0,
        );
    }

    let mut snapshot = Vec::new();
    tt.dump(&mut snapshot).unwrap();

    let mut restored = HashTable::new(16);
    restored.load(&mut snapshot.as_slice()).unwrap();

    assert_eq!(restored.num_buckets(), tt.num_buckets());
    assert_eq!(restored.generation(), tt.generation());

    for &h in &hashes {
        let before = tt.probe(h, 0);
        let after = restored.probe(h, 0);
        match (before, after) {
            (Some(a), Some(b)) => {
                assert_eq!(a.value, b.value);
                assert_eq!(a.eval, b.eval);
                assert_eq!(a.is_pv, b.is_pv);
                assert_eq!(a.bound, b.bound);
                assert_eq!(a.best_move, b.best_move);
                assert_eq!(a.depth, b.depth);
            }
            (None, None) => {}
            _ => panic!("snapshot probe mismatch"),
        }
    }
}

#[test]
fn truncated_snapshot_is_rejected() {
    let tt = HashTable::new(64);
    tt.store(1, Value::new(1), Value::ZERO, false, Bound::Exact, Pos::NONE, 5, 0);

    let mut snapshot = Vec::new();
    tt.dump(&mut snapshot).unwrap();

    // フレームの途中で切る
    snapshot.truncate(snapshot.len() / 2);
    let mut restored = HashTable::new(64);
    assert!(restored.load(&mut snapshot.as_slice()).is_err());
}
