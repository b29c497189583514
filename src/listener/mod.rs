//! 弾幕リスナー
//!
//! 配信プラットフォームごとに1つの実装を持ち、プラットフォーム固有の
//! ペイロードを[`ChatEvent`]/[`GiftEvent`]に正規化して購読者へ配信する。
//!
//! - [`BilibiliListener`]: B站の弾幕サーバーへ直接プッシュ購読
//! - [`DouyinListener`]: 中継WebSocketからのストリーム購読（再接続あり）
//! - [`MockListener`]: テスト用の固定間隔ジェネレーター

pub mod bilibili;
pub mod base;
pub mod douyin;
pub mod mock;

pub use self::bilibili::{BilibiliConfig, BilibiliListener};
pub use self::base::{
    run_reconnect_loop, ChatHandler, EventBus, GiftHandler, ListenerContext, ListenerCore,
    ListenerState, ShutdownSignal,
};
pub use self::douyin::{DouyinConfig, DouyinListener};
pub use self::mock::{MockConfig, MockListener};

use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::QuestResult;
use crate::events::{ChatEvent, GiftEvent, Platform};

/// 弾幕リスナーの共通インターフェース
pub trait DanmakuListener: Send + Sync {
    /// 対象プラットフォーム
    fn platform(&self) -> Platform;

    /// バックグラウンドでの受信を開始
    fn start(&self) -> QuestResult<()>;

    /// 停止を要求（未接続でも安全）
    fn stop(&self);

    /// 弾幕コールバックを登録
    fn on_chat(&self, handler: ChatHandler);

    /// ギフトコールバックを登録
    fn on_gift(&self, handler: GiftHandler);

    /// 現在の接続状態
    fn state(&self) -> ListenerState;
}

/// クロージャから弾幕コールバックを登録するための拡張
pub trait DanmakuListenerExt: DanmakuListener {
    fn on_chat_fn<F>(&self, f: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.on_chat(Arc::new(f));
    }

    fn on_gift_fn<F>(&self, f: F)
    where
        F: Fn(&GiftEvent) + Send + Sync + 'static,
    {
        self.on_gift(Arc::new(f));
    }
}

impl<T: DanmakuListener + ?Sized> DanmakuListenerExt for T {}

/// 設定から有効なリスナー群を構築
pub fn build_listeners(config: &AppConfig) -> Vec<Box<dyn DanmakuListener>> {
    let mut listeners: Vec<Box<dyn DanmakuListener>> = Vec::new();
    let reconnect_delay = config.listener.reconnect_delay();

    if config.platforms.mock.enabled {
        listeners.push(Box::new(MockListener::new(config.platforms.mock.clone())));
    }

    if let Some(bilibili) = &config.platforms.bilibili {
        if bilibili.room_id > 0 {
            listeners.push(Box::new(BilibiliListener::new(
                bilibili.clone(),
                reconnect_delay,
            )));
        }
    }

    if let Some(douyin) = &config.platforms.douyin {
        if !douyin.room_id.is_empty() {
            listeners.push(Box::new(DouyinListener::new(douyin.clone(), reconnect_delay)));
        }
    }

    tracing::info!("📡 {} listener(s) configured", listeners.len());
    listeners
}
