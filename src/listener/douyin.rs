//! 抖音弾幕リスナー
//!
//! 抖音の弾幕は公式APIで取得できないため、外部の中継ツールが提供する
//! WebSocket（JSON 1行 = 1イベント）を購読する。切断時は固定間隔で再接続する。

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::base::{
    run_reconnect_loop, ChatHandler, GiftHandler, ListenerContext, ListenerCore, ListenerState,
};
use super::DanmakuListener;
use crate::errors::{QuestError, QuestResult};
use crate::events::{ChatEvent, GiftEvent, Platform};

/// 抖音接続設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DouyinConfig {
    /// 房间号
    pub room_id: String,
    /// 中継WebSocketのURL（省略時は`ws://localhost:8888/douyin/{room_id}`）
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl DouyinConfig {
    pub fn ws_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("ws://localhost:8888/douyin/{}", self.room_id))
    }
}

/// 中継ツールから届くJSONメッセージ
#[derive(Debug, Deserialize)]
struct RelayMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    user_id: serde_json::Value,
    #[serde(default)]
    username: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    gift_name: String,
    #[serde(default)]
    gift_count: Option<u32>,
    #[serde(default)]
    gift_value: Option<f64>,
}

/// 正規化済みの中継イベント
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Chat(ChatEvent),
    Gift(GiftEvent),
}

fn id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// 中継メッセージ1件を解析する。未知の`type`は`Ok(None)`
pub fn parse_relay_message(raw: &str) -> QuestResult<Option<RelayEvent>> {
    let message: RelayMessage = serde_json::from_str(raw)?;

    match message.kind.as_str() {
        "danmaku" | "chat" => Ok(Some(RelayEvent::Chat(ChatEvent::new(
            Platform::Douyin,
            id_to_string(&message.user_id),
            message.username,
            message.content,
        )))),
        "gift" => {
            let user_id = id_to_string(&message.user_id);
            if user_id.is_empty() {
                return Err(QuestError::protocol("douyin", "gift without user_id"));
            }
            Ok(Some(RelayEvent::Gift(GiftEvent::new(
                Platform::Douyin,
                user_id,
                message.username,
                message.gift_name,
                message.gift_count.unwrap_or(1),
                message.gift_value.unwrap_or(0.0),
            ))))
        }
        other => {
            tracing::debug!(kind = other, "Ignoring relay message");
            Ok(None)
        }
    }
}

/// 抖音リスナー
pub struct DouyinListener {
    core: ListenerCore,
    config: DouyinConfig,
    reconnect_delay: Duration,
}

impl DouyinListener {
    pub fn new(config: DouyinConfig, reconnect_delay: Duration) -> Self {
        Self {
            core: ListenerCore::new(Platform::Douyin),
            config,
            reconnect_delay,
        }
    }

    /// 1回分の接続。切断されるか停止されるまで受信を続ける
    async fn session(context: ListenerContext, url: String) -> QuestResult<()> {
        let (mut ws, _response) = connect_async(url.as_str()).await?;
        context.set_state(ListenerState::Connected);
        tracing::info!(url = %url, "✅ 已连接到抖音弹幕服务");

        loop {
            let frame = tokio::select! {
                _ = context.signal.wait() => return Ok(()),
                frame = ws.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => dispatch(&context, &text),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatch(&context, text),
                    Err(e) => tracing::warn!("⚠️ Non UTF-8 relay frame skipped: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn dispatch(context: &ListenerContext, text: &str) {
    match parse_relay_message(text) {
        Ok(Some(RelayEvent::Chat(event))) => context.bus.emit_chat(&event),
        Ok(Some(RelayEvent::Gift(event))) => context.bus.emit_gift(&event),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(
                error = %e,
                payload_preview = %text.chars().take(80).collect::<String>(),
                "⚠️ Malformed relay message skipped"
            );
        }
    }
}

impl DanmakuListener for DouyinListener {
    fn platform(&self) -> Platform {
        Platform::Douyin
    }

    fn start(&self) -> QuestResult<()> {
        let url = self.config.ws_url();
        let delay = self.reconnect_delay;
        tracing::info!(room_id = %self.config.room_id, url = %url, "▶️ 抖音弹幕监听已启动");

        self.core.spawn(move |context| async move {
            run_reconnect_loop(context, delay, move |ctx, _attempt| {
                Self::session(ctx, url.clone())
            })
            .await;
        })
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
