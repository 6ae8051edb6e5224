//! 評価値（Value）

use super::depth::MAX_PLY;

/// 探索スコア
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Value(i32);

impl Value {
    /// ゼロ
    pub const ZERO: Value = Value(0);
    /// 引き分け
    pub const DRAW: Value = Value(0);
    /// 詰み（勝ち側の最大スコア）
    pub const MATE: Value = Value(32000);
    /// 無限大
    pub const INFINITE: Value = Value(32001);
    /// 無効値
    pub const NONE: Value = Value(32002);

    /// 最大手数以内の勝ちスコアの下限
    pub const MATE_IN_MAX_PLY: Value = Value(Self::MATE.0 - MAX_PLY);
    /// 最大手数以内の負けスコアの上限
    pub const MATED_IN_MAX_PLY: Value = Value(-Self::MATE_IN_MAX_PLY.0);

    /// 値から生成
    #[inline]
    pub const fn new(v: i32) -> Value {
        Value(v)
    }

    /// ply 手で勝つスコア
    #[inline]
    pub const fn mate_in(ply: i32) -> Value {
        Value(Self::MATE.0 - ply)
    }

    /// ply 手で負けるスコア
    #[inline]
    pub const fn mated_in(ply: i32) -> Value {
        Value(-Self::MATE.0 + ply)
    }

    /// 勝ちスコアかどうか
    #[inline]
    pub const fn is_win(self) -> bool {
        self.0 >= Self::MATE_IN_MAX_PLY.0 && self.0 != Self::NONE.0
    }

    /// 負けスコアかどうか
    #[inline]
    pub const fn is_loss(self) -> bool {
        self.0 <= Self::MATED_IN_MAX_PLY.0
    }

    /// 生の値を取得
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// 探索値 → 格納値（置換表用）
    ///
    /// 詰み距離は格納時に盤面絶対（ルートからの手数に依存しない）へ
    /// 変換する。勝ちスコアは ply を引き、負けスコアは ply を足す。
    #[inline]
    pub const fn to_stored(self, ply: i32) -> Value {
        if self.0 == Self::NONE.0 {
            self
        } else if self.is_win() {
            Value(self.0 - ply)
        } else if self.is_loss() {
            Value(self.0 + ply)
        } else {
            self
        }
    }

    /// 格納値 → 探索値（置換表用）
    ///
    /// `to_stored` の逆変換。探索側の ply を加味して、呼び出し元の
    /// フレームから見た詰み距離に戻す。
    #[inline]
    pub const fn from_stored(self, ply: i32) -> Value {
        if self.0 == Self::NONE.0 {
            self
        } else if self.is_win() {
            Value(self.0 + ply)
        } else if self.is_loss() {
            Value(self.0 - ply)
        } else {
            self
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::ZERO
    }
}

impl std::ops::Neg for Value {
    type Output = Value;

    #[inline]
    fn neg(self) -> Value {
        Value(-self.0)
    }
}

impl std::ops::Add for Value {
    type Output = Value;

    #[inline]
    fn add(self, rhs: Value) -> Value {
        Value(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Value {
    type Output = Value;

    #[inline]
    fn sub(self, rhs: Value) -> Value {
        Value(self.0 - rhs.0)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value(v)
    }
}

impl From<Value> for i32 {
    fn from(v: Value) -> i32 {
        v.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_constants() {
        assert_eq!(Value::ZERO.raw(), 0);
        assert_eq!(Value::MATE.raw(), 32000);
        assert!(Value::INFINITE.raw() > Value::MATE.raw());
    }

    #[test]
    fn test_value_mate_classification() {
        assert!(Value::mate_in(5).is_win());
        assert!(!Value::mate_in(5).is_loss());
        assert!(Value::mated_in(3).is_loss());
        assert!(!Value::ZERO.is_win());
        assert!(!Value::ZERO.is_loss());
        assert!(!Value::NONE.is_win());
    }

    #[test]
    fn test_stored_roundtrip_non_mate() {
        // 非詰みスコアは ply に依存しない
        let v = Value::new(123);
        assert_eq!(v.to_stored(7).from_stored(7), v);
        assert_eq!(v.to_stored(7), v);
    }

    #[test]
    fn test_stored_shifts_mate_by_ply() {
        // store(mate_in_3, ply=7); probe(ply=12) => mate_in(3 - 5)
        let stored = Value::mate_in(3).to_stored(7);
        let probed = stored.from_stored(12);
        assert_eq!(probed, Value::mate_in(3 - 5));

        let stored = Value::mated_in(4).to_stored(2);
        let probed = stored.from_stored(6);
        assert_eq!(probed, Value::mated_in(4 - 4));
    }

    #[test]
    fn test_value_ordering() {
        assert!(Value::MATE > Value::ZERO);
        assert!(Value::mate_in(1) > Value::mate_in(10));
        assert!(Value::mated_in(10) > Value::mated_in(1));
    }
}
