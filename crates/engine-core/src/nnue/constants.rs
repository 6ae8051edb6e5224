//! ネットワーク次元とシェイプ定数

/// マップ特徴量の次元
pub const FEATURE_DIM: usize = 64;
/// depthwise conv を通すチャネル数（先頭から）
pub const FEATURE_DWCONV_DIM: usize = 32;
/// ポリシーヘッドが読むチャネル数
pub const POLICY_DIM: usize = 32;
/// value 隠れ層の次元
pub const VALUE_DIM: usize = 64;
/// グループ射影の出力次元
pub const VALUE_GROUP_DIM: usize = 64;
/// ヘッドバケットの最大数
pub const MAX_NUM_BUCKETS: usize = 4;

/// 行・列それぞれのグループ分割数
pub const NUM_GROUPS: usize = 3;

// チャネルの包含関係はコード全体の前提
const _: () = assert!(POLICY_DIM <= FEATURE_DWCONV_DIM);
const _: () = assert!(FEATURE_DWCONV_DIM <= FEATURE_DIM);

/// 3 の冪乗テーブル
pub const POWER3: [i32; 16] = build_power3();

const fn build_power3() -> [i32; 16] {
    let mut pow3 = [0i32; 16];
    let mut v = 1i32;
    let mut i = 0;
    while i < 16 {
        pow3[i] = v;
        v *= 3;
        i += 1;
    }
    pow3
}

/// シェイプインデックスの総数（4 * 3^11）
pub const SHAPE_NUM: usize = 4 * POWER3[11] as usize;

/// ライン方向の x 増分（横・縦・主対角・反対角）
pub const DX: [i32; 4] = [1, 0, 1, 1];
/// ライン方向の y 増分
pub const DY: [i32; 4] = [0, 1, 1, -1];

/// アーキテクチャハッシュの基底値
pub const ARCH_HASH_BASE: u32 = 0x247e_6c6a;

/// ネットワーク構造のハッシュ
///
/// 各次元を 8 で割った値をパックして基底値と XOR する。重みファイル
/// のヘッダと一致しなければそのファイルはこのビルドでは使えない。
pub const ARCH_HASH: u32 = ARCH_HASH_BASE
    ^ ((((FEATURE_DWCONV_DIM / 8) as u32) << 26)
        | (((VALUE_GROUP_DIM / 8) as u32) << 20)
        | (((VALUE_DIM / 8) as u32) << 14)
        | (((POLICY_DIM / 8) as u32) << 8)
        | ((FEATURE_DIM / 8) as u32));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power3() {
        assert_eq!(POWER3[0], 1);
        assert_eq!(POWER3[1], 3);
        assert_eq!(POWER3[11], 177_147);
    }

    #[test]
    fn test_shape_num() {
        assert_eq!(SHAPE_NUM, 708_588);
    }

    #[test]
    fn test_arch_hash_packs_dims() {
        // 基底値との XOR で各次元フィールドが復元できる
        let packed = ARCH_HASH ^ ARCH_HASH_BASE;
        assert_eq!((packed >> 26) & 0x3F, (FEATURE_DWCONV_DIM / 8) as u32);
        assert_eq!((packed >> 20) & 0x3F, (VALUE_GROUP_DIM / 8) as u32);
        assert_eq!((packed >> 14) & 0x3F, (VALUE_DIM / 8) as u32);
        assert_eq!((packed >> 8) & 0x3F, (POLICY_DIM / 8) as u32);
        assert_eq!(packed & 0xFF, (FEATURE_DIM / 8) as u32);
    }
}
