//! NNUE 評価器ファサード
//!
//! 黒視点・白視点のアキュムレータを 1 つずつ持ち、盤面からの
//! move/undo 通知を遅延キュー（move cache）に積む。キューは最初の
//! 評価呼び出しで手番側だけ順に消化される。
//!
//! 白視点のアキュムレータには BLACK/WHITE を入れ替えた色を見せる
//! （ネットワークは常に「自分 vs 相手」で学習されている）。リマップ
//! はキュー投入時、直前レコードとの相殺判定より前に行う。

use super::accumulator::{Accumulator, ValueSum};
use super::constants::ARCH_HASH;
use super::weights::{NnueWeightLoader, Weight};
use crate::board::{Board, MAX_BOARD_SIZE};
use crate::eval::{
    CompressedLoader, Evaluator, EvaluatorError, PolicyBuffer, StandardHeaderLoader, ValueType,
    WeightRegistry,
};
use crate::types::{Color, Pos, Rule};
use std::path::Path;
use std::sync::Arc;

/// NNUE 重みのプロセス全体レジストリ
static WEIGHT_REGISTRY: WeightRegistry<Weight> = WeightRegistry::new();

/// 遅延キューに積む 1 件の色変化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MoveCache {
    old_color: Color,
    new_color: Color,
    x: i8,
    y: i8,
}

impl MoveCache {
    /// 互いに打ち消し合う変化か（play X の直後の undo X）
    #[inline]
    fn is_contrary(&self, other: &MoveCache) -> bool {
        self.x == other.x
            && self.y == other.y
            && self.old_color == other.new_color
            && self.new_color == other.old_color
    }
}

/// インクリメンタル NNUE 評価器
#[derive(Debug)]
pub struct NnueEvaluator {
    board_size: i32,
    rule: Rule,
    /// 視点ごとの重み（同一パスなら同じブロブを共有）
    weight: [Arc<Weight>; 2],
    accumulator: [Accumulator; 2],
    move_cache: [Vec<MoveCache>; 2],
    value_sum_history: [Vec<ValueSum>; 2],
}

impl NnueEvaluator {
    /// 重みファイルを読み込んで評価器を構築する
    ///
    /// ヘッダのアーキテクチャハッシュ・ルールマスク・盤面サイズ
    /// マスクを検証し、不一致なら対応するエラーを返す。
    pub fn new(
        board_size: i32,
        rule: Rule,
        black_weight_path: &Path,
        white_weight_path: &Path,
    ) -> Result<NnueEvaluator, EvaluatorError> {
        let mut header_loader = StandardHeaderLoader::new(NnueWeightLoader);
        header_loader.set_header_validator(Box::new(move |header| {
            if header.arch_hash != ARCH_HASH {
                return Err(EvaluatorError::IncompatibleWeightFile(format!(
                    "architecture hash mismatch: file=0x{:08x} build=0x{:08x}",
                    header.arch_hash, ARCH_HASH
                )));
            }
            if !header.supports_rule(rule) {
                return Err(EvaluatorError::UnsupportedRule { rule });
            }
            if !header.supports_board_size(board_size) {
                return Err(EvaluatorError::UnsupportedBoardSize { board_size });
            }
            Ok(())
        }));
        let mut loader = CompressedLoader::new(header_loader);

        let black = WEIGHT_REGISTRY.acquire(black_weight_path, &mut loader)?;
        let white = WEIGHT_REGISTRY.acquire(white_weight_path, &mut loader)?;

        Self::from_weights(board_size, rule, black, white)
    }

    /// 構築済みの重みから評価器を作る（テスト・組み込み重み用）
    pub fn from_weights(
        board_size: i32,
        rule: Rule,
        black_weight: Arc<Weight>,
        white_weight: Arc<Weight>,
    ) -> Result<NnueEvaluator, EvaluatorError> {
        if !(5..=MAX_BOARD_SIZE as i32).contains(&board_size) {
            return Err(EvaluatorError::UnsupportedBoardSize { board_size });
        }

        let num_cells = (board_size * board_size) as usize;
        let mut evaluator = NnueEvaluator {
            board_size,
            rule,
            weight: [black_weight, white_weight],
            accumulator: [Accumulator::new(board_size), Accumulator::new(board_size)],
            move_cache: [
                Vec::with_capacity(num_cells),
                Vec::with_capacity(num_cells),
            ],
            value_sum_history: [
                Vec::with_capacity(num_cells),
                Vec::with_capacity(num_cells),
            ],
        };
        evaluator.init_empty_board();
        Ok(evaluator)
    }

    /// 対局ルール
    #[inline]
    pub fn rule(&self) -> Rule {
        self.rule
    }

    /// 盤面サイズ
    #[inline]
    pub fn board_size(&self) -> i32 {
        self.board_size
    }

    /// 指定視点のアキュムレータ（診断・テスト用）
    ///
    /// 遅延キューに未消化の変化が残っていることがある点に注意。
    #[inline]
    pub fn accumulator(&self, perspective: Color) -> &Accumulator {
        &self.accumulator[perspective as usize]
    }

    /// 指定視点の重みハンドル
    #[inline]
    pub fn weight(&self, perspective: Color) -> &Arc<Weight> {
        &self.weight[perspective as usize]
    }

    fn add_cache(&mut self, side: Color, x: i32, y: i32, is_undo: bool) {
        debug_assert!(side.is_stone());
        let (old_color, new_color) = if is_undo {
            (side, Color::Empty)
        } else {
            (Color::Empty, side)
        };

        for perspective in [Color::Black, Color::White] {
            let mut cache = MoveCache {
                old_color,
                new_color,
                x: x as i8,
                y: y as i8,
            };
            // 白視点は色を入れ替えてから相殺判定する
            if perspective == Color::White {
                cache.old_color = cache.old_color.opponent();
                cache.new_color = cache.new_color.opponent();
            }

            let queue = &mut self.move_cache[perspective as usize];
            match queue.last() {
                Some(last) if cache.is_contrary(last) => {
                    queue.pop();
                }
                _ => queue.push(cache),
            }
            debug_assert!(queue.len() <= (self.board_size * self.board_size) as usize);
        }
    }

    /// 指定視点の遅延キューを順に消化する
    fn drain_cache(&mut self, side: Color) {
        let si = side as usize;
        let mut cache = std::mem::take(&mut self.move_cache[si]);
        for mc in &cache {
            if mc.old_color == Color::Empty {
                // 着手: value 和を退避してから差分更新
                self.value_sum_history[si].push(*self.accumulator[si].value_sum());
                self.accumulator[si].update_move(
                    &self.weight[si],
                    mc.new_color,
                    mc.x as i32,
                    mc.y as i32,
                );
            } else {
                // 取り消し: 対になる退避を復元
                let backup = self.value_sum_history[si]
                    .pop()
                    .expect("unbalanced undo in move cache");
                self.accumulator[si].update_undo(
                    &self.weight[si],
                    mc.old_color,
                    mc.x as i32,
                    mc.y as i32,
                    &backup,
                );
            }
        }
        cache.clear();
        self.move_cache[si] = cache;
    }
}

impl Evaluator for NnueEvaluator {
    fn init_empty_board(&mut self) {
        for side in [Color::Black, Color::White] {
            let si = side as usize;
            self.move_cache[si].clear();
            self.value_sum_history[si].clear();
            self.accumulator[si].clear(&self.weight[si]);
        }
    }

    fn before_move(&mut self, board: &Board, pos: Pos) {
        self.add_cache(board.side_to_move(), pos.x(), pos.y(), false);
    }

    fn after_undo(&mut self, board: &Board, pos: Pos) {
        self.add_cache(board.side_to_move(), pos.x(), pos.y(), true);
    }

    fn evaluate_value(&mut self, board: &Board) -> ValueType {
        let side = board.side_to_move();
        self.drain_cache(side);

        let (win, loss, draw) = self.accumulator[side as usize].evaluate_value(&self.weight[side as usize]);
        ValueType::new(win, loss, draw, true)
    }

    fn evaluate_policy(&mut self, board: &Board, policy: &mut PolicyBuffer) {
        let side = board.side_to_move();
        self.drain_cache(side);

        self.accumulator[side as usize].evaluate_policy(&self.weight[side as usize], policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_weight() -> Arc<Weight> {
        let mut w = Weight::new_zeroed();
        w.value_sum_scale_after_conv = 1.0 / 512.0;
        w.value_sum_scale_direct = 1.0 / 1024.0;
        Arc::new(w)
    }

    fn make_evaluator(board_size: i32) -> NnueEvaluator {
        let w = zero_weight();
        NnueEvaluator::from_weights(board_size, Rule::Freestyle, Arc::clone(&w), w).unwrap()
    }

    #[test]
    fn test_board_size_range_check() {
        let w = zero_weight();
        let err =
            NnueEvaluator::from_weights(30, Rule::Freestyle, Arc::clone(&w), w).unwrap_err();
        assert!(matches!(
            err,
            EvaluatorError::UnsupportedBoardSize { board_size: 30 }
        ));
    }

    #[test]
    fn test_move_cache_annihilation() {
        let mut evaluator = make_evaluator(15);
        let mut board = Board::new(15);
        let pos = Pos::new(7, 7);

        // play X; undo X はキュー上で相殺される
        evaluator.before_move(&board, pos);
        board.do_move(pos);
        board.undo_move();
        evaluator.after_undo(&board, pos);

        assert!(evaluator.move_cache[0].is_empty());
        assert!(evaluator.move_cache[1].is_empty());
    }

    #[test]
    fn test_white_perspective_remap() {
        let mut evaluator = make_evaluator(15);
        let board = Board::new(15);

        // 黒の着手は白視点では「相手の石」になる
        evaluator.before_move(&board, Pos::new(7, 7));
        assert_eq!(evaluator.move_cache[0][0].new_color, Color::Black);
        assert_eq!(evaluator.move_cache[1][0].new_color, Color::White);
    }

    #[test]
    fn test_drain_consumes_cache_for_side_only() {
        let mut evaluator = make_evaluator(9);
        let mut board = Board::new(9);

        evaluator.before_move(&board, Pos::new(4, 4));
        board.do_move(Pos::new(4, 4));

        let _ = evaluator.evaluate_value(&board);
        // 手番（白）のキューだけ消化され、黒側は残る
        assert!(evaluator.move_cache[Color::White as usize].is_empty());
        assert_eq!(evaluator.move_cache[Color::Black as usize].len(), 1);
    }

    #[test]
    fn test_snapshot_stack_balance() {
        let mut evaluator = make_evaluator(9);
        let mut board = Board::new(9);

        for (x, y) in [(4, 4), (5, 4), (4, 5)] {
            let pos = Pos::new(x, y);
            evaluator.before_move(&board, pos);
            board.do_move(pos);
        }
        let _ = evaluator.evaluate_value(&board);
        assert_eq!(evaluator.value_sum_history[board.side_to_move() as usize].len(), 3);

        let pos = board.undo_move();
        evaluator.after_undo(&board, pos);
        let _ = evaluator.evaluate_value(&board);
        assert_eq!(evaluator.value_sum_history[board.side_to_move() as usize].len(), 2);
    }
}
