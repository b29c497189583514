//! ライブ配信ゲームの統括
//!
//! リスナーから届く弾幕とギフトを投票・ギフト効果・ランキングへ振り分け、
//! 投票で選ばれた選択肢で物語を1ターンずつ進める。

use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::collaborators::{spawn_illustration, Illustrator, Storyteller};
use crate::config::AppConfig;
use crate::errors::{QuestError, QuestResult};
use crate::events::{ChatEvent, GiftEvent};
use crate::gift::{apply_pending_effects, EffectTier, GiftProcessor, GIFT_RECORDS_FILE};
use crate::leaderboard::{GameStatsDelta, Leaderboard, LeaderboardKind, LEADERBOARD_FILE};
use crate::listener::{DanmakuListener, DanmakuListenerExt, ShutdownSignal};
use crate::narrative::{apply_narrative_effects, parse_story_response, NarrativeReport, ParsedStory};
use crate::player::{Cultivator, PlayerSnapshot, PlayerState};
use crate::storage::JsonStore;
use crate::vote::{VoteManager, VoteOutcome};

/// 保持する最近の弾幕数
pub const RECENT_CHAT_LIMIT: usize = 50;
/// 保持する最近のギフト数
pub const RECENT_GIFT_LIMIT: usize = 30;
/// 保持する効果メッセージ数
pub const EFFECT_MESSAGE_LIMIT: usize = 50;

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, limit: usize) {
    queue.push_back(item);
    while queue.len() > limit {
        queue.pop_front();
    }
}

/// 画面表示用の直近イベント
#[derive(Default)]
pub struct Ticker {
    chats: Mutex<VecDeque<String>>,
    gifts: Mutex<VecDeque<String>>,
    effects: Mutex<VecDeque<String>>,
}

impl Ticker {
    fn push_chat(&self, event: &ChatEvent) {
        let line = format!("[{}] {}", event.display_name, event.text);
        push_bounded(&mut self.chats.lock(), line, RECENT_CHAT_LIMIT);
    }

    fn push_gift(&self, event: &GiftEvent) {
        let line = format!(
            "🎁 {} 赠送 {}x{}",
            event.display_name, event.gift_name, event.unit_count
        );
        push_bounded(&mut self.gifts.lock(), line, RECENT_GIFT_LIMIT);
    }

    fn push_effect(&self, message: impl Into<String>) {
        push_bounded(&mut self.effects.lock(), message.into(), EFFECT_MESSAGE_LIMIT);
    }

    pub fn recent_chats(&self, limit: usize) -> Vec<String> {
        tail(&self.chats.lock(), limit)
    }

    pub fn recent_gifts(&self, limit: usize) -> Vec<String> {
        tail(&self.gifts.lock(), limit)
    }

    pub fn effect_messages(&self, limit: usize) -> Vec<String> {
        tail(&self.effects.lock(), limit)
    }
}

fn tail(queue: &VecDeque<String>, limit: usize) -> Vec<String> {
    let skip = queue.len().saturating_sub(limit);
    queue.iter().skip(skip).cloned().collect()
}

/// リスナーのコールバックから共有される状態
struct GameShared {
    votes: VoteManager,
    gifts: Arc<GiftProcessor>,
    leaderboard: Arc<Leaderboard>,
    player: Arc<Mutex<Cultivator>>,
    ticker: Arc<Ticker>,
}

impl GameShared {
    fn handle_chat(&self, event: &ChatEvent) {
        self.ticker.push_chat(event);

        if let Some(index) = self.votes.record_vote(event) {
            tracing::debug!(voter = %event.identity(), option = index + 1, "🗳️ Ballot recorded");
        }

        let Some(request) = self.gifts.check_rename(event) else {
            return;
        };
        let old_name = {
            let mut player = self.player.lock();
            let old_name = player.name().to_string();
            player.set_name(request.new_name.clone());
            old_name
        };

        self.ticker.push_effect(format!(
            "🎭 {} 将主角改名为【{}】",
            request.donor, request.new_name
        ));
        self.leaderboard.add_history_event(
            "rename",
            format!("{} 将主角从 {} 改名为 {}", request.donor, old_name, request.new_name),
            json!({ "old_name": old_name, "new_name": request.new_name }),
        );
        self.leaderboard.update_game_stats(GameStatsDelta {
            character_name: Some(request.new_name),
            ..GameStatsDelta::default()
        });
    }

    fn handle_gift(&self, event: &GiftEvent) {
        self.ticker.push_gift(event);
        self.gifts.process_gift(event);
        self.leaderboard.update_contribution(
            &event.identity(),
            &event.display_name,
            event.total_value(),
            &event.gift_name,
        );
    }
}

/// 1ターン分の結果
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub choice: String,
    pub story: ParsedStory,
    /// ギフト効果の適用結果
    pub gift_messages: Vec<String>,
    pub narrative: NarrativeReport,
}

/// ライブ配信ゲーム本体
pub struct LiveGame {
    shared: Arc<GameShared>,
    listeners: Vec<Box<dyn DanmakuListener>>,
    storyteller: Arc<dyn Storyteller>,
    illustrator: Option<Arc<dyn Illustrator>>,
    options: Mutex<Vec<String>>,
    illustration: Mutex<Option<JoinHandle<Option<Vec<u8>>>>>,
    signal: ShutdownSignal,
}

impl LiveGame {
    /// 設定から構築する。永続化先は`storage.data_dir`
    pub fn from_config(
        config: &AppConfig,
        listeners: Vec<Box<dyn DanmakuListener>>,
        storyteller: Arc<dyn Storyteller>,
    ) -> Self {
        let data_dir = config.storage.resolved_data_dir();
        Self::with_data_dir(config, Some(&data_dir), listeners, storyteller)
    }

    /// `data_dir`が`None`なら永続化しない
    pub fn with_data_dir(
        config: &AppConfig,
        data_dir: Option<&Path>,
        listeners: Vec<Box<dyn DanmakuListener>>,
        storyteller: Arc<dyn Storyteller>,
    ) -> Self {
        let gift_store = data_dir.map(|dir| JsonStore::in_dir(dir, GIFT_RECORDS_FILE));
        let board_store = data_dir.map(|dir| JsonStore::in_dir(dir, LEADERBOARD_FILE));

        let votes =
            VoteManager::new(config.vote.duration()).with_extra_markers(config.vote.extra_markers.clone());
        let gifts = Arc::new(GiftProcessor::from_config(&config.gift, gift_store));
        let leaderboard = Arc::new(Leaderboard::from_config(&config.leaderboard, board_store));
        let player = Arc::new(Mutex::new(Cultivator::new(config.game.player_name.clone())));
        let ticker = Arc::new(Ticker::default());

        {
            let ticker = Arc::clone(&ticker);
            let leaderboard = Arc::clone(&leaderboard);
            gifts.on_effect(Arc::new(move |tier: &EffectTier, event: &GiftEvent| {
                ticker.push_effect(format!("✨ {}: {}", event.display_name, tier.description));
                leaderboard.add_history_event(
                    "gift_effect",
                    format!("{} 触发 {}", event.display_name, tier.name),
                    json!({ "effect": tier.name, "gift": event.gift_name }),
                );
            }));
        }

        leaderboard.update_game_stats(GameStatsDelta {
            character_name: Some(config.game.player_name.clone()),
            character_realm: Some(player.lock().realm_name().to_string()),
            ..GameStatsDelta::default()
        });

        let shared = Arc::new(GameShared {
            votes,
            gifts,
            leaderboard,
            player,
            ticker,
        });

        for listener in &listeners {
            let chat_shared = Arc::clone(&shared);
            listener.on_chat_fn(move |event| chat_shared.handle_chat(event));
            let gift_shared = Arc::clone(&shared);
            listener.on_gift_fn(move |event| gift_shared.handle_gift(event));
        }

        Self {
            shared,
            listeners,
            storyteller,
            illustrator: None,
            options: Mutex::new(crate::narrative::default_options()),
            illustration: Mutex::new(None),
            signal: ShutdownSignal::new(),
        }
    }

    pub fn with_illustrator(mut self, illustrator: Arc<dyn Illustrator>) -> Self {
        self.illustrator = Some(illustrator);
        self
    }

    /// 全リスナーを起動する。起動に失敗したリスナーはスキップ
    pub fn start_listeners(&self) -> usize {
        let mut started = 0;
        for listener in &self.listeners {
            match listener.start() {
                Ok(()) => started += 1,
                Err(e) => tracing::warn!(platform = %listener.platform(), "⚠️ Listener failed to start: {}", e),
            }
        }
        tracing::info!("📡 {}/{} listener(s) started", started, self.listeners.len());
        started
    }

    /// リスナーを停止し、進行中のセッションを終わらせる
    pub fn stop(&self) {
        self.signal.trigger();
        for listener in &self.listeners {
            listener.stop();
        }
        tracing::info!("🛑 Live game stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_triggered()
    }

    /// リスナーを経由せずに弾幕を投入する
    pub fn handle_chat(&self, event: &ChatEvent) {
        self.shared.handle_chat(event);
    }

    /// リスナーを経由せずにギフトを投入する
    pub fn handle_gift(&self, event: &GiftEvent) {
        self.shared.handle_gift(event);
    }

    pub fn votes(&self) -> &VoteManager {
        &self.shared.votes
    }

    pub fn gifts(&self) -> &GiftProcessor {
        &self.shared.gifts
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.shared.leaderboard
    }

    pub fn ticker(&self) -> &Ticker {
        &self.shared.ticker
    }

    pub fn player_snapshot(&self) -> PlayerSnapshot {
        self.shared.player.lock().snapshot()
    }

    pub fn player_status(&self) -> String {
        self.shared.player.lock().status_display()
    }

    pub fn current_options(&self) -> Vec<String> {
        self.options.lock().clone()
    }

    /// 直近の挿絵生成タスクを取り出す
    pub fn take_illustration(&self) -> Option<JoinHandle<Option<Vec<u8>>>> {
        self.illustration.lock().take()
    }

    fn present_story(&self, parsed: &ParsedStory) {
        *self.options.lock() = parsed.options.clone();
        if let Some(illustrator) = &self.illustrator {
            let handle = spawn_illustration(Arc::clone(illustrator), &parsed.story);
            if let Some(previous) = std::mem::replace(&mut *self.illustration.lock(), handle) {
                previous.abort();
            }
        }
    }

    /// 冒頭の物語を生成して最初の選択肢を用意する
    pub async fn open_story(&self) -> QuestResult<ParsedStory> {
        let snapshot = self.player_snapshot();
        let text = self.storyteller.opening(&snapshot).await?;
        let parsed = parse_story_response(&text);

        self.shared.player.lock().record_story(&parsed.story);
        self.shared.leaderboard.update_game_stats(GameStatsDelta {
            stories: 1,
            ..GameStatsDelta::default()
        });
        self.present_story(&parsed);

        tracing::info!(options = parsed.options.len(), "📖 Opening story ready");
        Ok(parsed)
    }

    /// 現在の選択肢で投票を開始する。結果は返された受信側に1度だけ届く
    pub fn start_vote(&self) -> Option<oneshot::Receiver<VoteOutcome>> {
        let options = self.current_options();
        let (tx, rx) = oneshot::channel();
        let leaderboard = Arc::clone(&self.shared.leaderboard);
        let ticker = Arc::clone(&self.shared.ticker);

        self.shared.votes.start_vote(options, move |outcome| {
            leaderboard.record_vote_outcome(outcome);
            ticker.push_effect(format!(
                "🗳️ 选项{}【{}】胜出（{}票）",
                outcome.winner_key,
                outcome.winner_text,
                outcome.total_votes()
            ));
            let _ = tx.send(outcome.clone());
        })?;
        Some(rx)
    }

    /// 選ばれた選択肢で物語を1ターン進める
    pub async fn advance_turn(&self, chosen: &str) -> QuestResult<TurnReport> {
        let pending = self.shared.gifts.take_pending_effects();
        let (gift_messages, snapshot, history, realm_before) = {
            let mut player = self.shared.player.lock();
            let realm_before = player.realm_name().to_string();
            let messages = apply_pending_effects(&mut *player, &pending);
            (
                messages,
                player.snapshot(),
                player.story_history.clone(),
                realm_before,
            )
        };
        for message in &gift_messages {
            self.shared.ticker.push_effect(message.clone());
        }

        let text = self
            .storyteller
            .continue_story(&snapshot, chosen, &history)
            .await?;
        let parsed = parse_story_response(&text);

        let (narrative, realm, cultivation) = {
            let mut player = self.shared.player.lock();
            player.choices_made += 1;
            player.record_story(&parsed.story);
            let report = apply_narrative_effects(&mut *player, &parsed.effects);
            (
                report,
                player.realm_name().to_string(),
                player.cultivation_progress(),
            )
        };
        for message in &narrative.messages {
            self.shared.ticker.push_effect(message.clone());
        }

        let broke_through = realm != realm_before;
        if broke_through {
            self.shared.ticker.push_effect(format!("⬆️ 突破至【{}】！", realm));
            self.shared.leaderboard.add_history_event(
                "breakthrough",
                format!("突破至【{}】", realm),
                json!({ "from": realm_before, "to": realm }),
            );
        }
        if narrative.died {
            self.shared.ticker.push_effect("💀 角色陨落...");
            self.shared.leaderboard.add_history_event(
                "death",
                format!("主角陨落于【{}】", realm),
                json!({ "choice": chosen }),
            );
        }

        self.shared.leaderboard.update_game_stats(GameStatsDelta {
            character_realm: Some(realm),
            character_cultivation: Some(cultivation),
            choices: 1,
            stories: 1,
            breakthroughs: u64::from(broke_through),
            deaths: u64::from(narrative.died),
            ..GameStatsDelta::default()
        });
        self.present_story(&parsed);

        tracing::info!(
            choice = %chosen,
            gift_effects = pending.len(),
            died = narrative.died,
            "📖 Turn advanced"
        );
        Ok(TurnReport {
            choice: chosen.to_string(),
            story: parsed,
            gift_messages,
            narrative,
        })
    }

    /// 投票 → 締め切り待ち → 物語進行を`turns`回繰り返す。
    /// 停止された場合や主角が陨落した場合は途中で終了し、進めたターン数を返す
    pub async fn run_session(&self, turns: u32) -> QuestResult<u32> {
        if self.shared.player.lock().is_dead() {
            return Ok(0);
        }
        let opening = self.open_story().await?;
        tracing::info!("{}", opening.story);

        let mut completed = 0;
        while completed < turns && !self.is_stopped() {
            let receiver = self.start_vote().ok_or_else(|| {
                QuestError::Runtime("a vote session is already open".to_string())
            })?;

            let outcome = tokio::select! {
                outcome = receiver => outcome.ok(),
                _ = self.signal.wait() => None,
            };
            let Some(outcome) = outcome else {
                // 停止時は未締め切りの投票を閉じる
                self.shared.votes.end_vote();
                break;
            };

            let report = self.advance_turn(&outcome.winner_text).await?;
            completed += 1;
            tracing::info!("{}", report.story.story);

            if report.narrative.died {
                tracing::warn!("💀 Session ended: the hero has fallen");
                break;
            }
        }

        tracing::info!(
            turns = completed,
            "🏁 Session finished\n{}",
            self.shared.leaderboard.format_board(LeaderboardKind::Contribution, 10)
        );
        Ok(completed)
    }
}

impl Drop for LiveGame {
    fn drop(&mut self) {
        if !self.is_stopped() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ScriptedStoryteller;
    use crate::events::Platform;

    fn game() -> LiveGame {
        LiveGame::with_data_dir(
            &AppConfig::default(),
            None,
            Vec::new(),
            Arc::new(ScriptedStoryteller::default()),
        )
    }

    #[test]
    fn test_ticker_is_bounded() {
        let game = game();
        for i in 0..(RECENT_CHAT_LIMIT + 5) {
            game.handle_chat(&ChatEvent::new(Platform::Mock, "u1", "观众", format!("弹幕{i}")));
        }
        let chats = game.ticker().recent_chats(usize::MAX);
        assert_eq!(chats.len(), RECENT_CHAT_LIMIT);
        assert_eq!(chats.last().unwrap(), &format!("[观众] 弹幕{}", RECENT_CHAT_LIMIT + 4));
    }

    #[test]
    fn test_rename_flow() {
        let game = game();
        game.handle_gift(&GiftEvent::new(Platform::Mock, "rich", "土豪", "告白气球", 1, 66.0));
        assert!(game.gifts().has_pending_rename());

        // 他人の改名コマンドは無視
        game.handle_chat(&ChatEvent::new(Platform::Mock, "other", "路人", "改名 路人甲"));
        assert_eq!(game.player_snapshot().name, "无名修士");

        game.handle_chat(&ChatEvent::new(Platform::Mock, "rich", "土豪", "改名 萧炎"));
        assert_eq!(game.player_snapshot().name, "萧炎");
        assert!(!game.gifts().has_pending_rename());
        assert_eq!(game.leaderboard().game_stats().character_name, "萧炎");
        assert!(game
            .leaderboard()
            .history(10)
            .iter()
            .any(|event| event.kind == "rename"));
    }

    #[test]
    fn test_gift_feeds_contribution_board() {
        let game = game();
        let gift = GiftEvent::new(Platform::Bilibili, "42", "道友", "小心心", 2, 1.0);
        game.handle_gift(&gift);

        let entry = game
            .leaderboard()
            .entry(LeaderboardKind::Contribution, &gift.identity())
            .unwrap();
        assert!((entry.score - 2.0).abs() < f64::EPSILON);
        assert_eq!(game.ticker().recent_gifts(1), vec!["🎁 道友 赠送 小心心x2"]);
    }

    #[tokio::test]
    async fn test_advance_turn_applies_gift_effects_first() {
        let game = game();
        game.handle_gift(&GiftEvent::new(Platform::Mock, "u1", "道友", "辣条", 1, 1.0));
        assert_eq!(game.gifts().pending_effect_count(), 1);

        let report = game.advance_turn("前进").await.unwrap();
        assert_eq!(game.gifts().pending_effect_count(), 0);
        assert_eq!(report.gift_messages.len(), 1);
        assert!(report.story.story.starts_with("无名修士决定前进。"));
        assert_eq!(game.current_options(), report.story.options);

        let stats = game.leaderboard().game_stats();
        assert_eq!(stats.total_choices, 1);
        assert_eq!(stats.total_stories, 1);
    }
}
