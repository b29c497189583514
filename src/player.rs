//! プレイヤー状態の境界
//!
//! ギフト効果・物語効果は[`PlayerState`]トレイト越しにプレイヤーを変更する。
//! [`Cultivator`]はその参照実装（修仙キャラクター）。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// 境界名（インデックス = 境界レベル）
pub const CULTIVATION_REALMS: &[&str] = &[
    "凡人", "炼气期", "筑基期", "金丹期", "元婴期", "化神期", "炼虚期", "合体期", "大乘期", "渡劫期",
];

/// 基礎属性
pub const BASE_ATTRIBUTES: &[&str] = &["体魄", "神识", "悟性", "机缘", "心境"];

const BASE_ATTRIBUTE_VALUE: i64 = 10;
const STORY_HISTORY_LIMIT: usize = 20;

/// 修為加算の結果
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CultivationResult {
    pub gained: i64,
    /// 突破後の境界名（突破しなければ`None`）
    pub new_realm: Option<String>,
}

/// 物語生成に渡すプレイヤー概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub name: String,
    pub realm: String,
    pub cultivation: i64,
    pub hp: i64,
    pub max_hp: i64,
    pub mp: i64,
    pub max_mp: i64,
    pub attributes: BTreeMap<String, i64>,
    pub inventory: Vec<String>,
    pub recent_story: String,
}

/// 効果適用の対象となるプレイヤー状態
pub trait PlayerState: Send {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
    fn realm_name(&self) -> &str;
    fn cultivation_progress(&self) -> i64;

    fn add_cultivation(&mut self, amount: i64) -> CultivationResult;
    fn lose_cultivation(&mut self, amount: i64);
    /// 次の境界へ強制的に突破する
    fn force_breakthrough(&mut self) -> Option<String>;

    fn hp(&self) -> i64;
    fn max_hp(&self) -> i64;
    fn raise_max_hp(&mut self, amount: i64);
    /// 実際に回復した量を返す
    fn heal(&mut self, amount: i64) -> i64;
    /// 死亡したら`true`
    fn take_damage(&mut self, amount: i64) -> bool;

    fn mp(&self) -> i64;
    fn max_mp(&self) -> i64;
    fn raise_max_mp(&mut self, amount: i64);
    fn restore_mp(&mut self, amount: i64) -> i64;
    /// 実際に消費した量を返す
    fn drain_mp(&mut self, amount: i64) -> i64;

    fn attribute_names(&self) -> Vec<String>;
    fn add_attribute(&mut self, name: &str, amount: i64);

    fn add_item(&mut self, item: &str);
    fn grant_breakthrough_boost(&mut self, percent: i64);
    fn grant_resurrection(&mut self);
    /// 復活の加護があれば消費して全回復する
    fn try_resurrect(&mut self) -> bool;

    fn record_story(&mut self, story: &str);
    fn snapshot(&self) -> PlayerSnapshot;
}

/// 修仙キャラクター
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cultivator {
    pub name: String,
    pub realm_index: usize,
    pub cultivation_progress: i64,
    pub attributes: BTreeMap<String, i64>,
    pub hp: i64,
    pub max_hp: i64,
    pub mp: i64,
    pub max_mp: i64,
    /// ギフトで上乗せされた最大値
    #[serde(default)]
    pub bonus_hp: i64,
    #[serde(default)]
    pub bonus_mp: i64,
    #[serde(default)]
    pub inventory: Vec<String>,
    #[serde(default)]
    pub story_history: Vec<String>,
    #[serde(default)]
    pub breakthrough_boost: i64,
    #[serde(default)]
    pub resurrections: u32,
    #[serde(default)]
    pub choices_made: u32,
}

impl Cultivator {
    pub fn new(name: impl Into<String>) -> Self {
        let attributes = BASE_ATTRIBUTES
            .iter()
            .map(|a| (a.to_string(), BASE_ATTRIBUTE_VALUE))
            .collect();
        let mut player = Self {
            name: name.into(),
            realm_index: 0,
            cultivation_progress: 0,
            attributes,
            hp: 0,
            max_hp: 0,
            mp: 0,
            max_mp: 0,
            bonus_hp: 0,
            bonus_mp: 0,
            inventory: Vec::new(),
            story_history: Vec::new(),
            breakthrough_boost: 0,
            resurrections: 0,
            choices_made: 0,
        };
        player.recalculate(true);
        player
    }

    fn attribute(&self, name: &str) -> i64 {
        self.attributes
            .get(name)
            .copied()
            .unwrap_or(BASE_ATTRIBUTE_VALUE)
    }

    /// 境界と属性から最大値を再計算。`refill`で全回復
    fn recalculate(&mut self, refill: bool) {
        let realm = self.realm_index as i64;
        self.max_hp = (100 + realm * 50)
            .saturating_add(self.attribute("体魄").saturating_mul(5))
            .saturating_add(self.bonus_hp);
        self.max_mp = (50 + realm * 30)
            .saturating_add(self.attribute("神识").saturating_mul(3))
            .saturating_add(self.bonus_mp);
        if refill {
            self.hp = self.max_hp;
            self.mp = self.max_mp;
        } else {
            self.hp = self.hp.min(self.max_hp);
            self.mp = self.mp.min(self.max_mp);
        }
    }

    fn is_max_realm(&self) -> bool {
        self.realm_index + 1 >= CULTIVATION_REALMS.len()
    }

    pub fn is_dead(&self) -> bool {
        self.hp <= 0
    }

    /// 状態表示
    pub fn status_display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "【{}】 {}", self.name, self.realm_name());
        let _ = writeln!(
            out,
            "生命 {}  {}/{}",
            bar(self.hp, self.max_hp, '♥'),
            self.hp,
            self.max_hp
        );
        let _ = writeln!(
            out,
            "灵力 {}  {}/{}",
            bar(self.mp, self.max_mp, '✦'),
            self.mp,
            self.max_mp
        );
        let _ = writeln!(
            out,
            "修为 {}  {}%",
            bar(self.cultivation_progress, 100, '◆'),
            self.cultivation_progress
        );
        let attrs: Vec<String> = BASE_ATTRIBUTES
            .iter()
            .map(|a| format!("{}:{}", a, self.attribute(a)))
            .collect();
        let _ = write!(out, "{}", attrs.join("  "));
        out
    }
}

fn bar(current: i64, maximum: i64, symbol: char) -> String {
    const LEN: i64 = 20;
    let filled = if maximum > 0 {
        (current.clamp(0, maximum) * LEN / maximum) as usize
    } else {
        0
    };
    format!(
        "[{}{}]",
        symbol.to_string().repeat(filled),
        "·".repeat(LEN as usize - filled)
    )
}

impl PlayerState for Cultivator {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: String) {
        self.name = name;
    }

    fn realm_name(&self) -> &str {
        CULTIVATION_REALMS
            .get(self.realm_index)
            .copied()
            .unwrap_or("凡人")
    }

    fn cultivation_progress(&self) -> i64 {
        self.cultivation_progress
    }

    fn add_cultivation(&mut self, amount: i64) -> CultivationResult {
        let mut result = CultivationResult {
            gained: amount,
            new_realm: None,
        };
        self.cultivation_progress = self.cultivation_progress.saturating_add(amount);

        while self.cultivation_progress >= 100 && !self.is_max_realm() {
            self.cultivation_progress -= 100;
            self.realm_index += 1;
            self.recalculate(true);
            result.new_realm = Some(self.realm_name().to_string());
        }
        if self.is_max_realm() {
            self.cultivation_progress = self.cultivation_progress.min(100);
        }
        result
    }

    fn lose_cultivation(&mut self, amount: i64) {
        self.cultivation_progress = self.cultivation_progress.saturating_sub(amount).max(0);
    }

    fn force_breakthrough(&mut self) -> Option<String> {
        if self.is_max_realm() {
            return None;
        }
        let needed = (100 - self.cultivation_progress).max(0);
        self.add_cultivation(needed).new_realm
    }

    fn hp(&self) -> i64 {
        self.hp
    }

    fn max_hp(&self) -> i64 {
        self.max_hp
    }

    fn raise_max_hp(&mut self, amount: i64) {
        self.bonus_hp = self.bonus_hp.saturating_add(amount);
        self.recalculate(false);
    }

    fn heal(&mut self, amount: i64) -> i64 {
        let before = self.hp;
        self.hp = self.hp.saturating_add(amount).min(self.max_hp);
        self.hp.saturating_sub(before)
    }

    fn take_damage(&mut self, amount: i64) -> bool {
        self.hp = self.hp.saturating_sub(amount).max(0);
        self.hp <= 0
    }

    fn mp(&self) -> i64 {
        self.mp
    }

    fn max_mp(&self) -> i64 {
        self.max_mp
    }

    fn raise_max_mp(&mut self, amount: i64) {
        self.bonus_mp = self.bonus_mp.saturating_add(amount);
        self.recalculate(false);
    }

    fn restore_mp(&mut self, amount: i64) -> i64 {
        let before = self.mp;
        self.mp = self.mp.saturating_add(amount).min(self.max_mp);
        self.mp.saturating_sub(before)
    }

    fn drain_mp(&mut self, amount: i64) -> i64 {
        let before = self.mp;
        self.mp = self.mp.saturating_sub(amount).max(0);
        before.saturating_sub(self.mp)
    }

    fn attribute_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    fn add_attribute(&mut self, name: &str, amount: i64) {
        let value = self
            .attributes
            .entry(name.to_string())
            .or_insert(BASE_ATTRIBUTE_VALUE);
        *value = value.saturating_add(amount);
        self.recalculate(false);
    }

    fn add_item(&mut self, item: &str) {
        self.inventory.push(item.to_string());
    }

    fn grant_breakthrough_boost(&mut self, percent: i64) {
        self.breakthrough_boost = self.breakthrough_boost.saturating_add(percent);
    }

    fn grant_resurrection(&mut self) {
        self.resurrections += 1;
    }

    fn try_resurrect(&mut self) -> bool {
        if self.resurrections == 0 {
            return false;
        }
        self.resurrections -= 1;
        self.hp = self.max_hp;
        self.mp = self.max_mp;
        true
    }

    fn record_story(&mut self, story: &str) {
        self.story_history.push(story.to_string());
        if self.story_history.len() > STORY_HISTORY_LIMIT {
            let excess = self.story_history.len() - STORY_HISTORY_LIMIT;
            self.story_history.drain(..excess);
        }
    }

    fn snapshot(&self) -> PlayerSnapshot {
        let start = self.story_history.len().saturating_sub(3);
        PlayerSnapshot {
            name: self.name.clone(),
            realm: self.realm_name().to_string(),
            cultivation: self.cultivation_progress,
            hp: self.hp,
            max_hp: self.max_hp,
            mp: self.mp,
            max_mp: self.max_mp,
            attributes: self.attributes.clone(),
            inventory: self.inventory.clone(),
            recent_story: self.story_history[start..].join("\n\n"),
        }
    }
}
