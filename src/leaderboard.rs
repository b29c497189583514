//! ランキング
//!
//! 貢献（ギフト累計）・投票参加・幸運（勝者への投票回数）の3つの独立したランキングと、
//! 配信全体の統計・イベント履歴を管理する。変更のたびに全体をスナップショットとして保存する。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;

use crate::config::LeaderboardConfig;
use crate::events::GlobalIdentity;
use crate::storage::JsonStore;
use crate::vote::VoteOutcome;

/// 永続化ファイル名
pub const LEADERBOARD_FILE: &str = "leaderboard.json";

/// 保存する履歴の件数
const PERSISTED_HISTORY: usize = 100;
/// 貢献エントリーごとに残す直近のギフト明細の件数
const GIFT_NOTES_PER_ENTRY: usize = 100;
/// 勝者に投票した場合の追加点
const WINNING_VOTE_BONUS: f64 = 2.0;

/// ランキングの種類
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub enum LeaderboardKind {
    #[serde(rename = "contribution")]
    #[display("contribution")]
    Contribution,
    #[serde(rename = "vote")]
    #[display("vote")]
    VoteParticipation,
    #[serde(rename = "lucky")]
    #[display("lucky")]
    Lucky,
}

impl LeaderboardKind {
    pub const ALL: [LeaderboardKind; 3] = [
        LeaderboardKind::Contribution,
        LeaderboardKind::VoteParticipation,
        LeaderboardKind::Lucky,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            LeaderboardKind::Contribution => "🏆 贡献榜",
            LeaderboardKind::VoteParticipation => "🗳️ 参与榜",
            LeaderboardKind::Lucky => "🍀 幸运榜",
        }
    }
}

/// 貢献エントリーに残すギフト明細
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftNote {
    pub name: String,
    pub value: f64,
    pub time: DateTime<Utc>,
}

/// エントリーの付加情報
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub total_votes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub correct_votes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gifts: Vec<GiftNote>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// ランキングのエントリー
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub identity: GlobalIdentity,
    pub display_name: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: EntryMetadata,
    pub last_update: DateTime<Utc>,
}

impl LeaderboardEntry {
    fn new(identity: GlobalIdentity, display_name: &str) -> Self {
        Self {
            identity,
            display_name: display_name.to_string(),
            score: 0.0,
            metadata: EntryMetadata::default(),
            last_update: Utc::now(),
        }
    }

    /// プラットフォームアイコン付きの表示名
    pub fn label(&self) -> String {
        format!("{}{}", self.identity.platform.icon(), self.display_name)
    }
}

/// 履歴イベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// 配信全体の統計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStats {
    pub character_name: String,
    pub character_realm: String,
    pub character_cultivation: i64,
    pub total_choices: u64,
    pub total_stories: u64,
    pub breakthroughs: u64,
    pub deaths: u64,
    pub total_votes: u64,
    pub winning_votes: u64,
    pub total_gifts_value: f64,
    pub total_gifts_count: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Default for GameStats {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            character_name: String::new(),
            character_realm: "凡人".to_string(),
            character_cultivation: 0,
            total_choices: 0,
            total_stories: 0,
            breakthroughs: 0,
            deaths: 0,
            total_votes: 0,
            winning_votes: 0,
            total_gifts_value: 0.0,
            total_gifts_count: 0,
            start_time: now,
            last_update: now,
        }
    }
}

/// 統計の更新内容。カウンターは加算、`Some`の値は上書き
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameStatsDelta {
    pub character_name: Option<String>,
    pub character_realm: Option<String>,
    pub character_cultivation: Option<i64>,
    pub choices: u64,
    pub stories: u64,
    pub breakthroughs: u64,
    pub deaths: u64,
    pub votes: u64,
    pub winning_votes: u64,
}

impl GameStats {
    fn apply(&mut self, delta: GameStatsDelta) {
        if let Some(name) = delta.character_name {
            self.character_name = name;
        }
        if let Some(realm) = delta.character_realm {
            self.character_realm = realm;
        }
        if let Some(cultivation) = delta.character_cultivation {
            self.character_cultivation = cultivation;
        }
        self.total_choices += delta.choices;
        self.total_stories += delta.stories;
        self.breakthroughs += delta.breakthroughs;
        self.deaths += delta.deaths;
        self.total_votes += delta.votes;
        self.winning_votes += delta.winning_votes;
        self.last_update = Utc::now();
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaderboardSnapshot {
    #[serde(default)]
    boards: BTreeMap<LeaderboardKind, BTreeMap<String, LeaderboardEntry>>,
    #[serde(default)]
    game_stats: GameStats,
    #[serde(default)]
    history: Vec<HistoryEvent>,
}

#[derive(Default)]
struct BoardState {
    boards: HashMap<LeaderboardKind, HashMap<String, LeaderboardEntry>>,
    game_stats: GameStats,
    history: VecDeque<HistoryEvent>,
}

impl BoardState {
    fn from_snapshot(snapshot: LeaderboardSnapshot, history_limit: usize) -> Self {
        let skip = snapshot.history.len().saturating_sub(history_limit);
        Self {
            boards: snapshot
                .boards
                .into_iter()
                .map(|(kind, entries)| (kind, entries.into_iter().collect()))
                .collect(),
            game_stats: snapshot.game_stats,
            history: snapshot.history.into_iter().skip(skip).collect(),
        }
    }

    fn to_snapshot(&self) -> LeaderboardSnapshot {
        let skip = self.history.len().saturating_sub(PERSISTED_HISTORY);
        LeaderboardSnapshot {
            boards: self
                .boards
                .iter()
                .map(|(kind, entries)| {
                    (
                        *kind,
                        entries
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    )
                })
                .collect(),
            game_stats: self.game_stats.clone(),
            history: self.history.iter().skip(skip).cloned().collect(),
        }
    }

    fn entry_mut(
        &mut self,
        kind: LeaderboardKind,
        identity: &GlobalIdentity,
        display_name: &str,
    ) -> &mut LeaderboardEntry {
        let entry = self
            .boards
            .entry(kind)
            .or_default()
            .entry(identity.key())
            .or_insert_with(|| LeaderboardEntry::new(identity.clone(), display_name));
        entry.display_name = display_name.to_string();
        entry.last_update = Utc::now();
        entry
    }

    /// スコア降順。同点は先に更新された方、さらにキー順
    fn sorted(&self, kind: LeaderboardKind) -> Vec<&LeaderboardEntry> {
        let mut entries: Vec<&LeaderboardEntry> = self
            .boards
            .get(&kind)
            .map(|board| board.values().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.last_update.cmp(&b.last_update))
                .then_with(|| a.identity.key().cmp(&b.identity.key()))
        });
        entries
    }

    fn push_history(&mut self, event: HistoryEvent, limit: usize) {
        self.history.push_back(event);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// ランキング管理
pub struct Leaderboard {
    state: Mutex<BoardState>,
    history_limit: usize,
    store: Option<JsonStore>,
}

impl Leaderboard {
    /// 永続化なしで作成
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
            history_limit: history_limit.max(1),
            store: None,
        }
    }

    /// 設定から作成し、既存のスナップショットがあれば読み込む
    pub fn from_config(config: &LeaderboardConfig, store: Option<JsonStore>) -> Self {
        let mut board = Self::new(config.history_limit);
        if let Some(store) = store {
            let snapshot: LeaderboardSnapshot = store.load_or_default();
            *board.state.get_mut() = BoardState::from_snapshot(snapshot, board.history_limit);
            board.store = Some(store);
        }
        board
    }

    fn persist(&self, state: &BoardState) {
        if let Some(store) = &self.store {
            store.save_or_log(&state.to_snapshot());
        }
    }

    /// 貢献ランキングを更新
    pub fn update_contribution(
        &self,
        identity: &GlobalIdentity,
        display_name: &str,
        value: f64,
        gift_name: &str,
    ) {
        let mut state = self.state.lock();
        let entry = state.entry_mut(LeaderboardKind::Contribution, identity, display_name);
        entry.score += value;
        let gifts = &mut entry.metadata.gifts;
        gifts.push(GiftNote {
            name: gift_name.to_string(),
            value,
            time: Utc::now(),
        });
        if gifts.len() > GIFT_NOTES_PER_ENTRY {
            let excess = gifts.len() - GIFT_NOTES_PER_ENTRY;
            gifts.drain(..excess);
        }
        state.game_stats.total_gifts_value += value;
        state.game_stats.total_gifts_count += 1;
        state.game_stats.last_update = Utc::now();
        self.persist(&state);
    }

    fn credit_participation(state: &mut BoardState, identity: &GlobalIdentity, display_name: &str, won: bool) {
        let entry = state.entry_mut(LeaderboardKind::VoteParticipation, identity, display_name);
        entry.score += 1.0;
        entry.metadata.total_votes += 1;
        if won {
            entry.score += WINNING_VOTE_BONUS;
            entry.metadata.correct_votes += 1;
            let lucky = state.entry_mut(LeaderboardKind::Lucky, identity, display_name);
            lucky.score += 1.0;
        }
    }

    /// 1票分の参加を記録（勝者への投票なら追加点と幸運ランキング）
    pub fn record_vote_participation(
        &self,
        identity: &GlobalIdentity,
        display_name: &str,
        voted_for_winner: bool,
    ) {
        let mut state = self.state.lock();
        Self::credit_participation(&mut state, identity, display_name, voted_for_winner);
        self.persist(&state);
    }

    /// 投票結果をまとめて反映し、履歴と統計を更新する
    pub fn record_vote_outcome(&self, outcome: &VoteOutcome) {
        let mut state = self.state.lock();
        let mut winners = 0u64;
        for ballot in &outcome.ballots {
            let won = ballot.option_index == outcome.winner_index;
            if won {
                winners += 1;
            }
            Self::credit_participation(&mut state, &ballot.identity, &ballot.display_name, won);
        }

        state.game_stats.apply(GameStatsDelta {
            votes: outcome.ballots.len() as u64,
            winning_votes: winners,
            ..GameStatsDelta::default()
        });

        let event = HistoryEvent {
            kind: "vote_end".to_string(),
            description: format!("选项{}【{}】胜出", outcome.winner_key, outcome.winner_text),
            data: serde_json::json!({
                "session_id": outcome.session_id.to_string(),
                "winner": outcome.winner_key,
                "total_votes": outcome.ballots.len(),
                "tally": outcome.tally,
            }),
            timestamp: Utc::now(),
        };
        state.push_history(event, self.history_limit);
        self.persist(&state);
    }

    /// 上位`n`件
    pub fn get_top_n(&self, kind: LeaderboardKind, n: usize) -> Vec<LeaderboardEntry> {
        self.state
            .lock()
            .sorted(kind)
            .into_iter()
            .take(n)
            .cloned()
            .collect()
    }

    /// 1始まりの順位。未登録なら`None`
    pub fn get_rank(&self, kind: LeaderboardKind, identity: &GlobalIdentity) -> Option<usize> {
        let key = identity.key();
        self.state
            .lock()
            .sorted(kind)
            .iter()
            .position(|e| e.identity.key() == key)
            .map(|i| i + 1)
    }

    pub fn entry(&self, kind: LeaderboardKind, identity: &GlobalIdentity) -> Option<LeaderboardEntry> {
        self.state
            .lock()
            .boards
            .get(&kind)
            .and_then(|board| board.get(&identity.key()))
            .cloned()
    }

    /// 履歴イベントを追加
    pub fn add_history_event(&self, kind: &str, description: impl Into<String>, data: Value) {
        let mut state = self.state.lock();
        state.push_history(
            HistoryEvent {
                kind: kind.to_string(),
                description: description.into(),
                data,
                timestamp: Utc::now(),
            },
            self.history_limit,
        );
        self.persist(&state);
    }

    /// 最近の履歴（古い順）
    pub fn history(&self, limit: usize) -> Vec<HistoryEvent> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn update_game_stats(&self, delta: GameStatsDelta) {
        let mut state = self.state.lock();
        state.game_stats.apply(delta);
        self.persist(&state);
    }

    pub fn game_stats(&self) -> GameStats {
        self.state.lock().game_stats.clone()
    }

    /// ランキングの表示用テキスト
    pub fn format_board(&self, kind: LeaderboardKind, n: usize) -> String {
        let entries = self.get_top_n(kind, n);
        if entries.is_empty() {
            return "暂无数据".to_string();
        }

        const MEDALS: [&str; 3] = ["🥇", "🥈", "🥉"];
        let mut out = format!("{}\n{}", kind.title(), "━".repeat(25));
        for (i, entry) in entries.iter().enumerate() {
            let rank = MEDALS
                .get(i)
                .map(|m| m.to_string())
                .unwrap_or_else(|| format!("{}.", i + 1));
            let score = match kind {
                LeaderboardKind::Contribution => format!("¥{:.1}", entry.score),
                LeaderboardKind::VoteParticipation => format!(
                    "{}分 ({}/{})",
                    entry.score as i64, entry.metadata.correct_votes, entry.metadata.total_votes
                ),
                LeaderboardKind::Lucky => format!("{}次", entry.score as i64),
            };
            let _ = write!(out, "\n{} {}: {}", rank, entry.label(), score);
        }
        out
    }

    /// 統計サマリー
    pub fn stats_summary(&self) -> String {
        let stats = self.game_stats();
        let name = if stats.character_name.is_empty() {
            "未创建"
        } else {
            stats.character_name.as_str()
        };
        [
            "📊 直播统计".to_string(),
            "━".repeat(25),
            format!("角色: {}", name),
            format!("境界: {}", stats.character_realm),
            format!("修为: {}%", stats.character_cultivation),
            String::new(),
            format!("📖 故事数: {}", stats.total_stories),
            format!("🎯 选择数: {}", stats.total_choices),
            format!("⬆️ 突破数: {}", stats.breakthroughs),
            String::new(),
            format!("🗳️ 总投票: {}", stats.total_votes),
            format!("🎁 礼物数: {}", stats.total_gifts_count),
            format!("💰 礼物价值: ¥{:.1}", stats.total_gifts_value),
        ]
        .join("\n")
    }

    /// 全データを初期化
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = BoardState::default();
        self.persist(&state);
        tracing::info!("🔄 Leaderboard reset");
    }
}
