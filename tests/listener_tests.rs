//! リスナーの統合テスト
//!
//! ローカルのWebSocketサーバーを相手に、受信・不正ペイロードの読み飛ばし・
//! 再接続・停止を確認する。

use danmaku_quest::listener::bilibili::{decode_packets, encode_packet, operation};
use danmaku_quest::listener::{
    BilibiliConfig, BilibiliListener, DouyinConfig, DouyinListener, MockConfig, MockListener,
};
use danmaku_quest::{ChatEvent, DanmakuListener, DanmakuListenerExt, GiftEvent, ListenerState};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
struct Collected {
    chats: Mutex<Vec<ChatEvent>>,
    gifts: Mutex<Vec<GiftEvent>>,
}

fn subscribe(listener: &dyn DanmakuListener) -> Arc<Collected> {
    let collected = Arc::new(Collected::default());
    let chats = Arc::clone(&collected);
    listener.on_chat_fn(move |event| chats.chats.lock().push(event.clone()));
    let gifts = Arc::clone(&collected);
    listener.on_gift_fn(move |event| gifts.gifts.lock().push(event.clone()));
    collected
}

/// 条件が満たされるまで待つ
async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// 接続を受け付けないポート
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_douyin_relay_skips_malformed_payloads() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let frames = [
            "{ this is not json".to_string(),
            json!({"type": "danmaku", "user_id": "u1", "username": "道友", "content": "1"}).to_string(),
            json!({"type": "like", "user_id": "u1"}).to_string(),
            json!({"type": "gift", "username": "无名"}).to_string(),
            json!({
                "type": "gift",
                "user_id": 9527,
                "username": "土豪",
                "gift_name": "嘉年华",
                "gift_count": 2,
                "gift_value": 30.0
            })
            .to_string(),
        ];
        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    let listener = DouyinListener::new(
        DouyinConfig {
            room_id: "7300000000".into(),
            endpoint: Some(format!("ws://{addr}/relay")),
        },
        Duration::from_millis(50),
    );
    let collected = subscribe(&listener);
    listener.start().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            collected.chats.lock().len() == 1 && collected.gifts.lock().len() == 1
        })
        .await
    );
    assert_eq!(listener.state(), ListenerState::Connected);

    let chat = collected.chats.lock()[0].clone();
    assert_eq!(chat.text, "1");
    assert_eq!(chat.identity().key(), "douyin_u1");

    let gift = collected.gifts.lock()[0].clone();
    assert_eq!(gift.donor_id, "9527");
    assert!((gift.total_value() - 60.0).abs() < 1e-9);

    listener.stop();
    assert!(wait_until(Duration::from_secs(2), || listener.state() == ListenerState::Stopped).await);
}

#[tokio::test]
async fn test_douyin_keeps_retrying_until_stopped() {
    let port = closed_port().await;
    let listener = DouyinListener::new(
        DouyinConfig {
            room_id: "1".into(),
            endpoint: Some(format!("ws://127.0.0.1:{port}/relay")),
        },
        Duration::from_millis(20),
    );
    listener.start().unwrap();

    let retried = wait_until(Duration::from_secs(5), || {
        matches!(
            listener.state(),
            ListenerState::Connecting { attempt } | ListenerState::Reconnecting { attempt }
                if attempt >= 3
        )
    })
    .await;
    assert!(retried);

    listener.stop();
    assert!(wait_until(Duration::from_secs(2), || listener.state() == ListenerState::Stopped).await);
}

#[tokio::test]
async fn test_stop_is_observed_while_handshake_stalls() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    // TCP接続は受け付けるがWebSocketのアップグレードには応答しない
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = server.accept().await {
            held.push(stream);
        }
    });

    let listener = DouyinListener::new(
        DouyinConfig {
            room_id: "1".into(),
            endpoint: Some(format!("ws://{addr}/relay")),
        },
        Duration::from_millis(50),
    );
    listener.start().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.state(), ListenerState::Connecting { attempt: 1 });

    listener.stop();
    assert!(wait_until(Duration::from_millis(500), || listener.state() == ListenerState::Stopped).await);
}

#[tokio::test]
async fn test_stop_before_start_is_harmless() {
    let listener = DouyinListener::new(
        DouyinConfig {
            room_id: "1".into(),
            endpoint: None,
        },
        Duration::from_millis(20),
    );
    listener.stop();
    listener.stop();
    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[tokio::test]
async fn test_bilibili_handshake_and_commands() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let (auth_tx, auth_rx) = tokio::sync::oneshot::channel::<serde_json::Value>();

    tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // 最初のフレームは認証パケット
        let auth = loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => break bytes,
                Some(Ok(_)) => continue,
                _ => return,
            }
        };
        let packets = decode_packets(&auth).unwrap();
        assert_eq!(packets[0].operation, operation::AUTH);
        let _ = auth_tx.send(serde_json::from_slice(&packets[0].body).unwrap());

        ws.send(Message::Binary(encode_packet(
            operation::AUTH_REPLY,
            br#"{"code":0}"#,
        )))
        .await
        .unwrap();

        // 1フレームに不正なコマンドと正しい弾幕を連結
        let danmu = json!({
            "cmd": "DANMU_MSG:4:0:2:2:2:0",
            "info": [[0, 1, 25], "2号", [1001, "剑仙"]]
        });
        let mut frame = encode_packet(operation::SEND_MSG_REPLY, b"{broken");
        frame.extend(encode_packet(
            operation::SEND_MSG_REPLY,
            danmu.to_string().as_bytes(),
        ));
        ws.send(Message::Binary(frame)).await.unwrap();

        // ヘッダーにも満たないフレーム
        ws.send(Message::Binary(vec![0, 1, 2])).await.unwrap();

        let gift = json!({
            "cmd": "SEND_GIFT",
            "data": {
                "uid": 2002,
                "uname": "金主",
                "giftName": "小电视飞船",
                "num": 2,
                "coin_type": "gold",
                "total_coin": 2_490_000
            }
        });
        ws.send(Message::Binary(encode_packet(
            operation::SEND_MSG_REPLY,
            gift.to_string().as_bytes(),
        )))
        .await
        .unwrap();

        while let Some(Ok(_)) = ws.next().await {}
    });

    let listener = BilibiliListener::new(
        BilibiliConfig {
            room_id: 21452505,
            endpoint: Some(format!("ws://{addr}/sub")),
            token: Some("test-token".into()),
            ..BilibiliConfig::default()
        },
        Duration::from_millis(50),
    );
    let collected = subscribe(&listener);
    listener.start().unwrap();

    let auth = tokio::time::timeout(Duration::from_secs(3), auth_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(auth["roomid"], 21452505);
    assert_eq!(auth["protover"], 1);
    assert_eq!(auth["key"], "test-token");

    assert!(
        wait_until(Duration::from_secs(3), || {
            collected.chats.lock().len() == 1 && collected.gifts.lock().len() == 1
        })
        .await
    );
    assert_eq!(listener.state(), ListenerState::Connected);

    let chat = collected.chats.lock()[0].clone();
    assert_eq!(chat.text, "2号");
    assert_eq!(chat.display_name, "剑仙");
    assert_eq!(chat.identity().key(), "bilibili_1001");

    let gift = collected.gifts.lock()[0].clone();
    assert_eq!(gift.unit_count, 2);
    assert!((gift.total_value() - 2490.0).abs() < 1e-6);

    listener.stop();
    assert!(wait_until(Duration::from_secs(2), || listener.state() == ListenerState::Stopped).await);
}

#[tokio::test]
async fn test_mock_listener_stops_emitting_after_stop() {
    let listener = MockListener::new(MockConfig {
        enabled: true,
        interval_ms: 5,
        chat_ratio: 0.5,
        seed: Some(7),
    });
    let collected = subscribe(&listener);
    listener.start().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            collected.chats.lock().len() + collected.gifts.lock().len() >= 10
        })
        .await
    );

    listener.stop();
    assert!(wait_until(Duration::from_secs(2), || listener.state() == ListenerState::Stopped).await);
    let seen = collected.chats.lock().len() + collected.gifts.lock().len();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(collected.chats.lock().len() + collected.gifts.lock().len(), seen);
}
