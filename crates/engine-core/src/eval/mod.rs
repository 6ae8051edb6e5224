//! 評価器インターフェース
//!
//! 評価実装のプラグインとなるトレイトと、評価結果のコンテナを提供する。
//!
//! - `Evaluator`: move/undo 通知フックと評価呼び出し
//! - `ValueType`: 勝ち/負け/引き分けロジットの softmax コンテナ
//! - `PolicyBuffer`: 盤面上のポリシー値バッファ
//! - `WeightRegistry`: 重みブロブの共有プール

pub mod weight_store;

pub use weight_store::{
    CompressedLoader, StandardHeader, StandardHeaderLoader, WeightLoader, WeightRegistry,
};

use crate::board::Board;
use crate::types::{Pos, Rule, Value};
use thiserror::Error;

/// 評価器の構築・重み読み込みで発生するエラー
#[derive(Debug, Error)]
pub enum EvaluatorError {
    /// 重みファイルが要求ルールに対応していない
    #[error("unsupported rule: {rule}")]
    UnsupportedRule { rule: Rule },
    /// 重みファイルが要求盤面サイズに対応していない
    #[error("unsupported board size: {board_size}")]
    UnsupportedBoardSize { board_size: i32 },
    /// マジック・アーキテクチャハッシュ不一致、本体の欠損・過剰など
    #[error("incompatible weight file: {0}")]
    IncompatibleWeightFile(String),
    /// 下層ストリームの失敗
    #[error("weight io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 評価実装のベーストレイト
///
/// 盤面の move/undo に対するフックと、手番側から見た価値・ポリシーの
/// 評価を提供する。フックはすべて既定で no-op なので、実装は必要な
/// 通知だけ購読すればよい（NNUE 実装は `before_move` と `after_undo`
/// のみ使用する）。
pub trait Evaluator {
    /// 空の盤面に対応する状態へリセット
    fn init_empty_board(&mut self);

    /// `board.do_move()` の直前に呼ばれる
    fn before_move(&mut self, _board: &Board, _pos: Pos) {}
    /// `board.do_move()` の直後に呼ばれる
    fn after_move(&mut self, _board: &Board, _pos: Pos) {}
    /// `board.undo_move()` の直前に呼ばれる
    fn before_undo(&mut self, _board: &Board, _pos: Pos) {}
    /// `board.undo_move()` の直後に呼ばれる
    fn after_undo(&mut self, _board: &Board, _pos: Pos) {}

    /// 評価器の状態を与えられた盤面と同期させる
    ///
    /// 既定実装は `init_empty_board()` の後、着手履歴を順にリプレイ
    /// して `before_move`/`after_move` を流し込む。
    fn sync_with_board(&mut self, board: &Board) {
        self.init_empty_board();
        let mut replay = Board::new(board.size());
        for &pos in board.history() {
            self.before_move(&replay, pos);
            replay.do_move(pos);
            self.after_move(&replay, pos);
        }
    }

    /// 現在の手番側から見た価値を評価する
    fn evaluate_value(&mut self, board: &Board) -> ValueType;

    /// 現在の手番側から見たポリシーを評価する
    fn evaluate_policy(&mut self, board: &Board, policy: &mut PolicyBuffer);
}

/// 勝ち/負け/引き分けレートのコンテナ
///
/// ロジット 3 つから softmax で構築する。レートが負の値のときは
/// 「レートなし」を意味する。
#[derive(Debug, Clone, Copy)]
pub struct ValueType {
    val: Value,
    win_rate: f32,
    loss_rate: f32,
    draw_rate: f32,
}

impl ValueType {
    /// 勝率差 → スコアの変換スケール
    pub const SCALING_FACTOR: f32 = 200.0;

    /// ロジットから構築
    ///
    /// `apply_softmax` が真ならロジットを softmax で確率に変換する。
    pub fn new(win_logit: f32, loss_logit: f32, draw_logit: f32, apply_softmax: bool) -> Self {
        let (win, loss, draw) = if apply_softmax {
            softmax3(win_logit, loss_logit, draw_logit)
        } else {
            (win_logit, loss_logit, draw_logit)
        };
        Self {
            val: value_from_win_loss_rate(win - loss),
            win_rate: win,
            loss_rate: loss,
            draw_rate: draw,
        }
    }

    /// スコアのみから構築（レートなし）
    pub fn from_value(val: Value) -> Self {
        Self {
            val,
            win_rate: -1.0,
            loss_rate: -1.0,
            draw_rate: -1.0,
        }
    }

    /// 勝ち/負けレートを保持しているか
    #[inline]
    pub fn has_win_loss_rate(&self) -> bool {
        self.win_rate >= 0.0 && self.loss_rate >= 0.0
    }

    /// 勝ちレート
    #[inline]
    pub fn win(&self) -> f32 {
        self.win_rate
    }

    /// 負けレート
    #[inline]
    pub fn loss(&self) -> f32 {
        self.loss_rate
    }

    /// 引き分けレート
    #[inline]
    pub fn draw(&self) -> f32 {
        self.draw_rate
    }

    /// 勝ちレート − 負けレート
    #[inline]
    pub fn win_loss_rate(&self) -> f32 {
        self.win_rate - self.loss_rate
    }

    /// スコア値
    #[inline]
    pub fn value(&self) -> Value {
        debug_assert!(self.val != Value::NONE);
        self.val
    }
}

/// 数値安定化つき 3 要素 softmax
fn softmax3(a: f32, b: f32, c: f32) -> (f32, f32, f32) {
    let m = a.max(b).max(c);
    let ea = (a - m).exp();
    let eb = (b - m).exp();
    let ec = (c - m).exp();
    let sum = ea + eb + ec;
    (ea / sum, eb / sum, ec / sum)
}

/// 勝率差 [-1, 1] をスコアへ変換
///
/// atanh でロジスティック写像を逆変換し、詰みスコア帯に入らない
/// 範囲へクランプする。
fn value_from_win_loss_rate(wlr: f32) -> Value {
    let wlr = wlr.clamp(-0.999_999, 0.999_999);
    let raw = ValueType::SCALING_FACTOR * 0.5 * ((1.0 + wlr) / (1.0 - wlr)).ln();
    let clamped = raw
        .round()
        .clamp(
            (Value::MATED_IN_MAX_PLY.raw() + 1) as f32,
            (Value::MATE_IN_MAX_PLY.raw() - 1) as f32,
        );
    Value::new(clamped as i32)
}

/// 盤面上のポリシー値バッファ
///
/// `compute_flag` の立っているセルだけが評価対象となる。評価後は
/// `score()` で move orderer 向けの整数スコアに変換できる。
pub struct PolicyBuffer {
    board_width: i32,
    buffer_size: usize,
    policy: Vec<f32>,
    compute_flag: Vec<bool>,
    policy_score_bias: i32,
}

impl PolicyBuffer {
    /// ポリシー値 → 整数スコアの変換スケール
    pub const SCORE_SCALE: f32 = 32.0;
    /// スコアの基準バイアス
    pub const SCORE_BIAS: i32 = 300;

    /// 指定サイズのバッファを作成（全フラグは落ちた状態）
    pub fn new(board_width: i32) -> Self {
        let buffer_size = (board_width * board_width) as usize;
        Self {
            board_width,
            buffer_size,
            policy: vec![0.0; buffer_size],
            compute_flag: vec![false; buffer_size],
            policy_score_bias: Self::SCORE_BIAS,
        }
    }

    #[inline]
    fn index_of(&self, pos: Pos) -> usize {
        let index = (self.board_width * pos.y() + pos.x()) as usize;
        debug_assert!(pos.x() < self.board_width);
        debug_assert!(index < self.buffer_size);
        index
    }

    /// セルのポリシー値を取得
    #[inline]
    pub fn get(&self, pos: Pos) -> f32 {
        self.policy[self.index_of(pos)]
    }

    /// 内部インデックスでポリシー値を設定（評価器用）
    #[inline]
    pub(crate) fn set_by_index(&mut self, index: usize, value: f32) {
        self.policy[index] = value;
    }

    /// セルの計算フラグを設定
    #[inline]
    pub fn set_compute_flag(&mut self, pos: Pos, enabled: bool) {
        let index = self.index_of(pos);
        self.compute_flag[index] = enabled;
    }

    /// 内部インデックスで計算フラグを取得
    #[inline]
    pub fn compute_flag_at(&self, index: usize) -> bool {
        self.compute_flag[index]
    }

    /// 盤上の全空点に計算フラグを立てる
    pub fn set_compute_flag_for_all_empty_cells(&mut self, board: &Board) {
        for y in 0..self.board_width {
            for x in 0..self.board_width {
                let pos = Pos::new(x, y);
                let empty = board.stone_at(pos) == crate::types::Color::Empty;
                self.compute_flag[(y * self.board_width + x) as usize] = empty;
            }
        }
    }

    /// スコアバイアスを設定（`SCORE_BIAS` に加算される）
    pub fn set_score_bias(&mut self, bias: i32) {
        self.policy_score_bias = Self::SCORE_BIAS + bias;
    }

    /// move orderer 向けの整数スコア
    #[inline]
    pub fn score(&self, pos: Pos) -> i32 {
        (self.get(pos) * Self::SCORE_SCALE).round() as i32 + self.policy_score_bias
    }

    /// 計算済みセル全体に softmax を適用する
    pub fn apply_softmax(&mut self) {
        let mut max = f32::NEG_INFINITY;
        for i in 0..self.buffer_size {
            if self.compute_flag[i] {
                max = max.max(self.policy[i]);
            }
        }
        if max == f32::NEG_INFINITY {
            return;
        }

        let mut sum = 0.0f32;
        for i in 0..self.buffer_size {
            if self.compute_flag[i] {
                self.policy[i] = (self.policy[i] - max).exp();
                sum += self.policy[i];
            } else {
                self.policy[i] = 0.0;
            }
        }
        for p in self.policy.iter_mut() {
            *p /= sum;
        }
    }
}
