//! 物語生成結果の解析
//!
//! 物語生成サービスの自由文から、選択肢と効果タグを取り出す純粋関数群。
//!
//! - 選択肢: `[选项N] 内容`。無ければ `N.` / `N、` で始まる行。どちらも無ければ既定の3択
//! - 効果: `[修为±X]` `[生命±X]` `[灵力±X]` `[物品:名前]` `[突破]`
//!
//! 本文からは選択肢以降の部分と効果タグを取り除く。

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::errors::QuestResult;
use crate::player::PlayerState;

/// 選択肢が見つからない場合の既定値
pub const DEFAULT_OPTIONS: [&str; 3] = ["继续探索", "原地修炼", "寻找机缘"];

/// 効果タグ1個あたりの数値の上限
pub const MAX_TAG_AMOUNT: i64 = 1_000_000;

/// 物語から抽出した効果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeEffects {
    pub cultivation_change: i64,
    pub hp_change: i64,
    pub mp_change: i64,
    pub items: Vec<String>,
    pub breakthrough: bool,
}

impl NarrativeEffects {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 解析済みの物語
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedStory {
    pub story: String,
    pub options: Vec<String>,
    pub effects: NarrativeEffects,
}

struct StoryParser {
    option_tag: Regex,
    stop_tag: Regex,
    numbered_line: Regex,
    stat_tag: Regex,
    item_tag: Regex,
    breakthrough_tag: Regex,
}

impl StoryParser {
    fn new() -> QuestResult<Self> {
        Ok(Self {
            option_tag: Regex::new(r"\[选项\d+\]").map_err(anyhow::Error::from)?,
            stop_tag: Regex::new(r"\[(?:选项\d+\]|修为|生命|灵力|物品|突破)")
                .map_err(anyhow::Error::from)?,
            numbered_line: Regex::new(r"^\d+[.、]\s*(.+)$").map_err(anyhow::Error::from)?,
            stat_tag: Regex::new(r"\[(修为|生命|灵力)([+\-＋－])([0-9]+)\]")
                .map_err(anyhow::Error::from)?,
            item_tag: Regex::new(r"\[物品[:：](.+?)\]").map_err(anyhow::Error::from)?,
            breakthrough_tag: Regex::new(r"\[突破\]").map_err(anyhow::Error::from)?,
        })
    }

    fn tagged_options(&self, text: &str) -> Vec<String> {
        self.option_tag
            .find_iter(text)
            .filter_map(|tag| {
                let rest = &text[tag.end()..];
                let end = self
                    .stop_tag
                    .find(rest)
                    .map(|m| m.start())
                    .unwrap_or(rest.len());
                let option = rest[..end].trim();
                (!option.is_empty()).then(|| option.to_string())
            })
            .collect()
    }

    fn numbered_options(&self, text: &str) -> Vec<String> {
        text.lines()
            .filter_map(|line| {
                self.numbered_line
                    .captures(line.trim())
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().trim().to_string())
            })
            .filter(|option| !option.is_empty())
            .collect()
    }

    fn effects(&self, text: &str) -> NarrativeEffects {
        let mut effects = NarrativeEffects::default();

        for caps in self.stat_tag.captures_iter(text) {
            // 桁あふれする数値も上限に丸める
            let amount = caps[3]
                .parse::<i64>()
                .unwrap_or(MAX_TAG_AMOUNT)
                .min(MAX_TAG_AMOUNT);
            let signed = match &caps[2] {
                "-" | "－" => -amount,
                _ => amount,
            };
            let total = match &caps[1] {
                "修为" => &mut effects.cultivation_change,
                "生命" => &mut effects.hp_change,
                _ => &mut effects.mp_change,
            };
            *total = total.saturating_add(signed);
        }

        effects.items = self
            .item_tag
            .captures_iter(text)
            .map(|c| c[1].trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        effects.breakthrough = self.breakthrough_tag.is_match(text);
        effects
    }

    fn story(&self, text: &str) -> String {
        let body = match self.option_tag.find(text) {
            Some(first) => &text[..first.start()],
            None => text,
        };
        let body = self.stat_tag.replace_all(body, "");
        let body = self.item_tag.replace_all(&body, "");
        let body = self.breakthrough_tag.replace_all(&body, "");
        body.trim().to_string()
    }

    fn parse(&self, text: &str) -> ParsedStory {
        let mut options = self.tagged_options(text);
        if options.is_empty() {
            options = self.numbered_options(text);
        }
        if options.is_empty() {
            options = default_options();
        }

        ParsedStory {
            story: self.story(text),
            options,
            effects: self.effects(text),
        }
    }
}

fn parser() -> Option<&'static StoryParser> {
    static PARSER: OnceLock<Option<StoryParser>> = OnceLock::new();
    PARSER
        .get_or_init(|| match StoryParser::new() {
            Ok(parser) => Some(parser),
            Err(e) => {
                tracing::error!("❌ Failed to build story parser: {}", e);
                None
            }
        })
        .as_ref()
}

pub fn default_options() -> Vec<String> {
    DEFAULT_OPTIONS.iter().map(|s| s.to_string()).collect()
}

/// 物語生成の出力を解析する
pub fn parse_story_response(text: &str) -> ParsedStory {
    match parser() {
        Some(parser) => parser.parse(text),
        None => ParsedStory {
            story: text.trim().to_string(),
            options: default_options(),
            effects: NarrativeEffects::default(),
        },
    }
}

/// 物語効果の適用結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NarrativeReport {
    pub messages: Vec<String>,
    pub new_realm: Option<String>,
    pub died: bool,
    pub resurrected: bool,
}

/// 物語効果をプレイヤーへ適用する。死亡した場合は以降の効果を適用しない
pub fn apply_narrative_effects<P>(player: &mut P, effects: &NarrativeEffects) -> NarrativeReport
where
    P: PlayerState + ?Sized,
{
    let mut report = NarrativeReport::default();

    let change = effects.cultivation_change;
    if change > 0 {
        let result = player.add_cultivation(change);
        report.messages.push(format!("【修为 +{}】", change));
        report.new_realm = result.new_realm;
    } else if change < 0 {
        player.lose_cultivation(change.saturating_neg());
        report.messages.push(format!("【修为 {}】", change));
    }

    if effects.breakthrough {
        if let Some(realm) = player.force_breakthrough() {
            report.new_realm = Some(realm);
        }
    }
    if let Some(realm) = &report.new_realm {
        report.messages.push(format!("★ 恭喜突破至【{}】！", realm));
    }

    let change = effects.hp_change;
    if change > 0 {
        let healed = player.heal(change);
        report.messages.push(format!("【生命 +{}】", healed));
    } else if change < 0 {
        let dead = player.take_damage(change.saturating_neg());
        report.messages.push(format!("【生命 {}】", change));
        if dead {
            if player.try_resurrect() {
                report.resurrected = true;
                report.messages.push("复活秘法生效，起死回生！".to_string());
            } else {
                report.died = true;
                return report;
            }
        }
    }

    let change = effects.mp_change;
    if change > 0 {
        let restored = player.restore_mp(change);
        report.messages.push(format!("【灵力 +{}】", restored));
    } else if change < 0 {
        player.drain_mp(change.saturating_neg());
        report.messages.push(format!("【灵力 {}】", change));
    }

    for item in &effects.items {
        player.add_item(item);
        report.messages.push(format!("【获得物品: {}】", item));
    }

    report
}
