//! B站弾幕リスナー
//!
//! B站の弾幕サーバーへWebSocketで接続し、バイナリパケットを解析する。
//!
//! パケット構造（ビッグエンディアン）:
//!
//! | offset | size | 内容          |
//! |--------|------|---------------|
//! | 0      | 4    | パケット全長  |
//! | 4      | 2    | ヘッダー長(16)|
//! | 6      | 2    | プロトコル版  |
//! | 8      | 4    | オペレーション|
//! | 12     | 4    | シーケンス    |
//!
//! 認証時に`protover = 1`を指定し、本文を非圧縮JSONで受け取る。

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::base::{
    run_reconnect_loop, ChatHandler, GiftHandler, ListenerContext, ListenerCore, ListenerState,
};
use super::DanmakuListener;
use crate::errors::{QuestError, QuestResult};
use crate::events::{ChatEvent, GiftEvent, Platform};

const HEADER_LEN: usize = 16;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_ENDPOINT: &str = "wss://broadcastlv.chat.bilibili.com/sub";
const ROOM_INIT_URL: &str = "https://api.live.bilibili.com/room/v1/Room/room_init";
const DANMU_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo";

/// パケットのオペレーション種別
pub mod operation {
    pub const HEARTBEAT: u32 = 2;
    pub const HEARTBEAT_REPLY: u32 = 3;
    pub const SEND_MSG_REPLY: u32 = 5;
    pub const AUTH: u32 = 7;
    pub const AUTH_REPLY: u32 = 8;
}

/// B站接続設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BilibiliConfig {
    /// 房间号（短号でも可）
    pub room_id: u64,
    /// 弾幕サーバーURLの上書き
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 認証トークン（省略時はdanmu-info APIから取得）
    #[serde(default)]
    pub token: Option<String>,
    /// ログインユーザーのUID（匿名は0）
    #[serde(default)]
    pub uid: u64,
    #[serde(default)]
    pub buvid: Option<String>,
    /// HTTPリクエストに付与するCookie
    #[serde(default)]
    pub cookie: Option<String>,
}

/// デコード済みパケット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub protover: u16,
    pub operation: u32,
    pub sequence: u32,
    pub body: Vec<u8>,
}

/// パケットをエンコード
pub fn encode_packet(operation: u32, body: &[u8]) -> Vec<u8> {
    let total = (HEADER_LEN + body.len()) as u32;
    let mut buf = Vec::with_capacity(total as usize);
    buf.extend_from_slice(&total.to_be_bytes());
    buf.extend_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&operation.to_be_bytes());
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(body);
    buf
}

/// 1フレームに連結された複数パケットを分解
pub fn decode_packets(mut data: &[u8]) -> QuestResult<Vec<Packet>> {
    let mut packets = Vec::new();

    while !data.is_empty() {
        if data.len() < HEADER_LEN {
            return Err(QuestError::protocol(
                "bilibili",
                format!("truncated header ({} bytes)", data.len()),
            ));
        }

        let packet_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let header_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let protover = u16::from_be_bytes([data[6], data[7]]);
        let operation = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let sequence = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);

        if header_len < HEADER_LEN || packet_len < header_len || packet_len > data.len() {
            return Err(QuestError::protocol(
                "bilibili",
                format!(
                    "invalid lengths (packet={}, header={}, available={})",
                    packet_len,
                    header_len,
                    data.len()
                ),
            ));
        }

        packets.push(Packet {
            protover,
            operation,
            sequence,
            body: data[header_len..packet_len].to_vec(),
        });
        data = &data[packet_len..];
    }

    Ok(packets)
}

/// 正規化済みのB站コマンド
#[derive(Debug, Clone, PartialEq)]
pub enum BilibiliEvent {
    Chat(ChatEvent),
    Gift(GiftEvent),
}

/// コマンドJSONを解析。対象外のコマンドは`Ok(None)`
pub fn parse_command(body: &[u8]) -> QuestResult<Option<BilibiliEvent>> {
    let value: Value = serde_json::from_slice(body)?;
    let cmd = value.get("cmd").and_then(Value::as_str).unwrap_or_default();

    // DANMU_MSG:4:0:2:2:2:0 のような派生形も含む
    if cmd.starts_with("DANMU_MSG") {
        let info = value
            .get("info")
            .and_then(Value::as_array)
            .ok_or_else(|| QuestError::protocol("bilibili", "DANMU_MSG without info"))?;
        let text = info
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| QuestError::protocol("bilibili", "DANMU_MSG without text"))?;
        let user = info
            .get(2)
            .and_then(Value::as_array)
            .ok_or_else(|| QuestError::protocol("bilibili", "DANMU_MSG without user"))?;
        let uid = user.first().map(value_to_id).unwrap_or_default();
        let uname = user.get(1).and_then(Value::as_str).unwrap_or_default();

        return Ok(Some(BilibiliEvent::Chat(ChatEvent::new(
            Platform::Bilibili,
            uid,
            uname,
            text,
        ))));
    }

    if cmd == "SEND_GIFT" {
        let data = value
            .get("data")
            .ok_or_else(|| QuestError::protocol("bilibili", "SEND_GIFT without data"))?;
        let uid = data.get("uid").map(value_to_id).unwrap_or_default();
        if uid.is_empty() {
            return Err(QuestError::protocol("bilibili", "SEND_GIFT without uid"));
        }
        let uname = data.get("uname").and_then(Value::as_str).unwrap_or_default();
        let gift_name = data
            .get("giftName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let num = data
            .get("num")
            .and_then(Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(1)
            .max(1);
        let coin_type = data
            .get("coin_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let total_coin = data.get("total_coin").and_then(Value::as_f64).unwrap_or(0.0);

        // 金瓜子 1000 = 1元。銀瓜子は無価値として扱う
        let total_yuan = if coin_type == "gold" {
            total_coin / 1000.0
        } else {
            0.0
        };

        return Ok(Some(BilibiliEvent::Gift(GiftEvent::new(
            Platform::Bilibili,
            uid,
            uname,
            gift_name,
            num,
            total_yuan / f64::from(num),
        ))));
    }

    Ok(None)
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RoomInit {
    room_id: u64,
}

#[derive(Debug, Deserialize)]
struct DanmuInfo {
    token: String,
    #[serde(default)]
    host_list: Vec<DanmuHost>,
}

#[derive(Debug, Deserialize)]
struct DanmuHost {
    host: String,
    wss_port: u16,
}

/// 接続先サーバー情報
#[derive(Debug, Clone, PartialEq)]
struct ServerInfo {
    room_id: u64,
    url: String,
    token: Option<String>,
}

/// B站リスナー
pub struct BilibiliListener {
    core: ListenerCore,
    config: BilibiliConfig,
    reconnect_delay: Duration,
}

impl BilibiliListener {
    pub fn new(config: BilibiliConfig, reconnect_delay: Duration) -> Self {
        Self {
            core: ListenerCore::new(Platform::Bilibili),
            config,
            reconnect_delay,
        }
    }

    /// 実ルームIDと弾幕サーバーを解決。API失敗時は設定値で続行する
    async fn resolve_server(client: &reqwest::Client, config: &BilibiliConfig) -> ServerInfo {
        // 接続先とトークンが指定済みならAPIを使わない
        if let (Some(url), Some(token)) = (&config.endpoint, &config.token) {
            return ServerInfo {
                room_id: config.room_id,
                url: url.clone(),
                token: Some(token.clone()),
            };
        }

        let room_id = match Self::fetch_room_init(client, config).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(room_id = config.room_id, "⚠️ room_init failed, using configured id: {}", e);
                config.room_id
            }
        };

        let danmu_info = match Self::fetch_danmu_info(client, config, room_id).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(room_id, "⚠️ getDanmuInfo failed: {}", e);
                None
            }
        };

        let url = config.endpoint.clone().unwrap_or_else(|| {
            danmu_info
                .as_ref()
                .and_then(|info| info.host_list.first())
                .map(|host| format!("wss://{}:{}/sub", host.host, host.wss_port))
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
        });
        let token = config
            .token
            .clone()
            .or_else(|| danmu_info.map(|info| info.token));

        ServerInfo {
            room_id,
            url,
            token,
        }
    }

    fn request(
        client: &reqwest::Client,
        config: &BilibiliConfig,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let builder = client.get(url);
        match &config.cookie {
            Some(cookie) => builder.header(reqwest::header::COOKIE, cookie),
            None => builder,
        }
    }

    async fn fetch_room_init(client: &reqwest::Client, config: &BilibiliConfig) -> QuestResult<u64> {
        let envelope: ApiEnvelope<RoomInit> = Self::request(client, config, ROOM_INIT_URL)
            .query(&[("id", config.room_id)])
            .send()
            .await?
            .json()
            .await?;
        match envelope.data {
            Some(data) if envelope.code == 0 => Ok(data.room_id),
            _ => Err(QuestError::protocol(
                "bilibili",
                format!("room_init code {}: {}", envelope.code, envelope.message),
            )),
        }
    }

    async fn fetch_danmu_info(
        client: &reqwest::Client,
        config: &BilibiliConfig,
        room_id: u64,
    ) -> QuestResult<DanmuInfo> {
        let envelope: ApiEnvelope<DanmuInfo> = Self::request(client, config, DANMU_INFO_URL)
            .query(&[("id", room_id), ("type", 0)])
            .send()
            .await?
            .json()
            .await?;
        match envelope.data {
            Some(data) if envelope.code == 0 => Ok(data),
            _ => Err(QuestError::protocol(
                "bilibili",
                format!("getDanmuInfo code {}: {}", envelope.code, envelope.message),
            )),
        }
    }

    fn auth_body(config: &BilibiliConfig, server: &ServerInfo) -> QuestResult<Vec<u8>> {
        let mut body = serde_json::json!({
            "uid": config.uid,
            "roomid": server.room_id,
            "protover": 1,
            "platform": "web",
            "type": 2,
        });
        if let Some(token) = &server.token {
            body["key"] = Value::String(token.clone());
        }
        if let Some(buvid) = &config.buvid {
            body["buvid"] = Value::String(buvid.clone());
        }
        Ok(serde_json::to_vec(&body)?)
    }

    /// 1回分の接続
    async fn session(
        context: ListenerContext,
        client: reqwest::Client,
        config: BilibiliConfig,
    ) -> QuestResult<()> {
        let server = Self::resolve_server(&client, &config).await;
        tracing::info!(room_id = server.room_id, url = %server.url, "🔗 Connecting to bilibili danmaku server");

        let (ws, _response) = connect_async(server.url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        let auth = encode_packet(operation::AUTH, &Self::auth_body(&config, &server)?);
        write.send(Message::Binary(auth)).await?;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                _ = context.signal.wait() => {
                    let _ = write.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    let packet = encode_packet(operation::HEARTBEAT, b"[object Object]");
                    write.send(Message::Binary(packet)).await?;
                    tracing::trace!("💓 bilibili heartbeat sent");
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Binary(bytes))) => handle_frame(&context, &bytes)?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}

/// 受信フレームを処理。不正なコマンドは記録して読み飛ばす
fn handle_frame(context: &ListenerContext, bytes: &[u8]) -> QuestResult<()> {
    let packets = match decode_packets(bytes) {
        Ok(packets) => packets,
        Err(e) => {
            tracing::warn!(error = %e, "⚠️ Malformed bilibili frame skipped");
            return Ok(());
        }
    };

    for packet in packets {
        match packet.operation {
            operation::AUTH_REPLY => {
                let code = serde_json::from_slice::<Value>(&packet.body)
                    .ok()
                    .and_then(|v| v.get("code").and_then(Value::as_i64))
                    .unwrap_or(0);
                if code != 0 {
                    return Err(QuestError::protocol(
                        "bilibili",
                        format!("auth rejected (code {code})"),
                    ));
                }
                context.set_state(ListenerState::Connected);
                tracing::info!("✅ B站弹幕认证成功");
            }
            operation::HEARTBEAT_REPLY => {
                if packet.body.len() >= 4 {
                    let popularity = u32::from_be_bytes([
                        packet.body[0],
                        packet.body[1],
                        packet.body[2],
                        packet.body[3],
                    ]);
                    tracing::debug!(popularity, "💓 bilibili heartbeat reply");
                }
            }
            operation::SEND_MSG_REPLY => {
                if packet.protover >= 2 {
                    tracing::warn!(protover = packet.protover, "⚠️ Compressed bilibili packet skipped");
                    continue;
                }
                match parse_command(&packet.body) {
                    Ok(Some(BilibiliEvent::Chat(event))) => context.bus.emit_chat(&event),
                    Ok(Some(BilibiliEvent::Gift(event))) => context.bus.emit_gift(&event),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "⚠️ Malformed bilibili command skipped"),
                }
            }
            other => tracing::debug!(operation = other, "Unhandled bilibili operation"),
        }
    }

    Ok(())
}

impl DanmakuListener for BilibiliListener {
    fn platform(&self) -> Platform {
        Platform::Bilibili
    }

    fn start(&self) -> QuestResult<()> {
        let config = self.config.clone();
        let delay = self.reconnect_delay;
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; danmaku-quest/0.1)")
            .timeout(Duration::from_secs(10))
            .build()?;
        tracing::info!(room_id = config.room_id, "▶️ B站弹幕监听已启动");

        self.core.spawn(move |context| async move {
            run_reconnect_loop(context, delay, move |ctx, _attempt| {
                Self::session(ctx, client.clone(), config.clone())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let packet = encode_packet(operation::HEARTBEAT, b"[object Object]");
        assert_eq!(packet.len(), HEADER_LEN + 15);

        let decoded = decode_packets(&packet).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].operation, operation::HEARTBEAT);
        assert_eq!(decoded[0].body, b"[object Object]");
    }

    #[test]
    fn test_concatenated_packets_are_split() {
        let mut frame = encode_packet(operation::SEND_MSG_REPLY, br#"{"cmd":"A"}"#);
        frame.extend(encode_packet(operation::SEND_MSG_REPLY, br#"{"cmd":"B"}"#));

        let decoded = decode_packets(&frame).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].body, br#"{"cmd":"B"}"#);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let packet = encode_packet(operation::SEND_MSG_REPLY, b"{}");
        assert!(decode_packets(&packet[..10]).is_err());
        assert!(decode_packets(&packet[..packet.len() - 1]).is_err());
    }

    #[test]
    fn test_parse_danmu_msg() {
        let body = r#"{"cmd":"DANMU_MSG:4:0:2:2:2:0","info":[[0,1,25],"选择2",[123456,"剑心通明",0,0]]}"#.as_bytes();
        let Some(BilibiliEvent::Chat(event)) = parse_command(body).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(event.voter_id, "123456");
        assert_eq!(event.display_name, "剑心通明");
        assert_eq!(event.text, "选择2");
    }

    #[test]
    fn test_parse_send_gift_gold() {
        let body = r#"{"cmd":"SEND_GIFT","data":{"uid":42,"uname":"A","giftName":"小心心","num":5,"coin_type":"gold","total_coin":5000}}"#.as_bytes();
        let Some(BilibiliEvent::Gift(event)) = parse_command(body).unwrap() else {
            panic!("expected gift");
        };
        assert_eq!(event.unit_count, 5);
        assert!((event.total_value() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_send_gift_silver_is_worthless() {
        let body = r#"{"cmd":"SEND_GIFT","data":{"uid":42,"uname":"A","giftName":"辣条","num":1,"coin_type":"silver","total_coin":100}}"#.as_bytes();
        let Some(BilibiliEvent::Gift(event)) = parse_command(body).unwrap() else {
            panic!("expected gift");
        };
        assert_eq!(event.total_value(), 0.0);
    }

    #[test]
    fn test_oversized_gift_count_saturates() {
        let body = br#"{"cmd":"SEND_GIFT","data":{"uid":42,"uname":"A","giftName":"x","num":8589934593,"coin_type":"gold","total_coin":1000}}"#;
        let Some(BilibiliEvent::Gift(event)) = parse_command(body).unwrap() else {
            panic!("expected gift");
        };
        assert_eq!(event.unit_count, u32::MAX);
        assert!((event.total_value() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_other_commands_are_ignored() {
        let body = br#"{"cmd":"INTERACT_WORD","data":{}}"#;
        assert!(parse_command(body).unwrap().is_none());
    }

    #[test]
    fn test_broken_danmu_msg_is_error() {
        let body = br#"{"cmd":"DANMU_MSG","info":"oops"}"#;
        assert!(parse_command(body).is_err());
    }
}
