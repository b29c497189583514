//! ギフト効果ティア
//!
//! ティアは`minimum_value`で全順序付けされ、ギフト1件につき
//! 条件を満たす最上位のティアが1つだけ発動する。
//! 同じ閾値のティアが複数ある場合は先に宣言された方が優先される。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// ティア識別子
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TierId(pub String);

impl From<&str> for TierId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 効果ペイロード（キー → 値）。未知のキーは適用時に無視される
pub type EffectPayload = BTreeMap<String, Value>;

/// ペイロードのキー
pub mod keys {
    pub const CULTIVATION: &str = "cultivation";
    pub const MAX_HP: &str = "max_hp";
    pub const HP: &str = "hp";
    pub const MAX_MP: &str = "max_mp";
    pub const MP: &str = "mp";
    pub const RANDOM_ATTRIBUTE: &str = "random_attribute";
    pub const CAN_RENAME: &str = "can_rename";
    pub const BREAKTHROUGH_BOOST: &str = "breakthrough_boost";
    pub const RESURRECTION: &str = "resurrection";
}

/// 効果ティア
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectTier {
    pub tier_id: TierId,
    /// 表示名
    pub name: String,
    /// 発動に必要な最低価値（元）
    pub minimum_value: f64,
    #[serde(default)]
    pub payload: EffectPayload,
    #[serde(default)]
    pub description: String,
}

impl EffectTier {
    pub fn new(
        tier_id: &str,
        name: &str,
        minimum_value: f64,
        payload: Value,
        description: &str,
    ) -> Self {
        let payload = match payload {
            Value::Object(map) => map.into_iter().collect(),
            _ => EffectPayload::new(),
        };
        Self {
            tier_id: TierId::from(tier_id),
            name: name.to_string(),
            minimum_value,
            payload,
            description: description.to_string(),
        }
    }

    /// 赐名権を付与するティアか
    pub fn grants_rename(&self) -> bool {
        self.payload
            .get(keys::CAN_RENAME)
            .is_some_and(is_truthy)
    }
}

/// ペイロード値を真偽値として解釈
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

/// 標準のティア表（元）
pub fn default_tiers() -> Vec<EffectTier> {
    vec![
        EffectTier::new("cultivation_small", "灵气注入", 0.1, json!({"cultivation": 5}), "获得5点修为"),
        EffectTier::new("cultivation_medium", "灵石馈赠", 1.0, json!({"cultivation": 20}), "获得20点修为"),
        EffectTier::new("cultivation_large", "仙晶灌顶", 10.0, json!({"cultivation": 100}), "获得100点修为"),
        EffectTier::new("hp_boost", "生命祝福", 5.0, json!({"max_hp": 50, "hp": 50}), "最大生命值+50，恢复50生命"),
        EffectTier::new("mp_boost", "灵力灌注", 5.0, json!({"max_mp": 30, "mp": 30}), "最大灵力+30，恢复30灵力"),
        EffectTier::new("attribute_boost", "天赋觉醒", 20.0, json!({"random_attribute": 2}), "随机属性+2"),
        EffectTier::new("rename", "赐名权", 50.0, json!({"can_rename": true}), "可以为主角改名"),
        EffectTier::new("breakthrough_chance", "天道眷顾", 100.0, json!({"breakthrough_boost": 30}), "突破成功率+30%"),
        EffectTier::new("resurrection", "复活秘法", 200.0, json!({"resurrection": true}), "死亡时可复活一次"),
    ]
}

/// 閾値順に並べたティア表
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    tiers: Vec<EffectTier>,
}

impl TierTable {
    /// 閾値の昇順に安定ソートする。閾値が数値でないティアは捨てる
    pub fn new(tiers: Vec<EffectTier>) -> Self {
        let mut tiers: Vec<EffectTier> = tiers
            .into_iter()
            .filter(|tier| {
                let valid = tier.minimum_value.is_finite() && tier.minimum_value >= 0.0;
                if !valid {
                    tracing::warn!(tier = %tier.tier_id, "⚠️ Invalid tier threshold ignored");
                }
                valid
            })
            .collect();
        tiers.sort_by(|a, b| a.minimum_value.total_cmp(&b.minimum_value));
        Self { tiers }
    }

    /// `value`以下で最大の閾値を持つティア
    pub fn resolve(&self, value: f64) -> Option<&EffectTier> {
        if value.is_nan() {
            return None;
        }
        let mut best: Option<&EffectTier> = None;
        for tier in &self.tiers {
            if tier.minimum_value > value {
                break;
            }
            if best.map_or(true, |b| tier.minimum_value > b.minimum_value) {
                best = Some(tier);
            }
        }
        best
    }

    pub fn tiers(&self) -> &[EffectTier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::new(default_tiers())
    }
}
