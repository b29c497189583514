//! モック弾幕ジェネレーター
//!
//! 固定間隔で本番と同じ形のイベントを生成する。配信なしでの動作確認用。

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::base::{ChatHandler, GiftHandler, ListenerContext, ListenerCore, ListenerState};
use super::DanmakuListener;
use crate::errors::QuestResult;
use crate::events::{ChatEvent, GiftEvent, Platform};

const TEST_USERS: &[&str] = &["仙道求索", "剑心通明", "云游四海", "逍遥子", "青云弟子"];
const TEST_DANMAKUS: &[&str] = &["1", "2", "3", "4", "选1", "选2", "选3", "666", "加油"];
const TEST_GIFTS: &[&str] = &["小心心", "棒棒糖", "仙女棒", "告白气球", "嘉年华"];

/// モック設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MockConfig {
    /// 有効化フラグ
    pub enabled: bool,
    /// 生成間隔（ミリ秒）
    pub interval_ms: u64,
    /// 弾幕の割合（残りはギフト）
    pub chat_ratio: f64,
    /// 乱数シード（テストの再現用）
    pub seed: Option<u64>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 3000,
            chat_ratio: 0.8,
            seed: None,
        }
    }
}

/// モックリスナー
pub struct MockListener {
    core: ListenerCore,
    config: MockConfig,
}

impl MockListener {
    pub fn new(config: MockConfig) -> Self {
        Self {
            core: ListenerCore::new(Platform::Mock),
            config,
        }
    }

    async fn simulate(context: ListenerContext, config: MockConfig) {
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        context.set_state(ListenerState::Connected);
        tracing::info!("🎮 模拟弹幕监听已启动 (interval: {:?})", interval);

        loop {
            if context.signal.sleep_or_stopped(interval).await {
                break;
            }

            if rng.gen_bool(config.chat_ratio.clamp(0.0, 1.0)) {
                let event = generate_chat(&mut rng);
                context.bus.emit_chat(&event);
            } else {
                let event = generate_gift(&mut rng);
                context.bus.emit_gift(&event);
            }
        }

        context.set_state(ListenerState::Stopped);
        tracing::info!("🛑 模拟弹幕监听已停止");
    }
}

fn pick<'a>(rng: &mut StdRng, pool: &[&'a str]) -> &'a str {
    pool.choose(rng).copied().unwrap_or_default()
}

fn generate_chat(rng: &mut StdRng) -> ChatEvent {
    ChatEvent::new(
        Platform::Mock,
        rng.gen_range(10000..100000).to_string(),
        pick(rng, TEST_USERS),
        pick(rng, TEST_DANMAKUS),
    )
}

fn generate_gift(rng: &mut StdRng) -> GiftEvent {
    GiftEvent::new(
        Platform::Mock,
        rng.gen_range(10000..100000).to_string(),
        pick(rng, TEST_USERS),
        pick(rng, TEST_GIFTS),
        rng.gen_range(1..=10),
        rng.gen_range(0.1..100.0),
    )
}

impl DanmakuListener for MockListener {
    fn platform(&self) -> Platform {
        Platform::Mock
    }

    fn start(&self) -> QuestResult<()> {
        let config = self.config.clone();
        self.core
            .spawn(move |context| Self::simulate(context, config))
    }

    fn stop(&self) {
        let _ = self.core.stop();
    }

    fn on_chat(&self, handler: ChatHandler) {
        self.core.bus().add_chat_handler(handler);
    }

    fn on_gift(&self, handler: GiftHandler) {
        self.core.bus().add_gift_handler(handler);
    }

    fn state(&self) -> ListenerState {
        self.core.state()
    }
}
