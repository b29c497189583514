//! ライブゲーム全体の統合テスト
//!
//! 投票 → 物語進行のセッションを、弾幕を直接投入しながら通しで実行する。

use danmaku_quest::{
    build_listeners,
    collaborators::{NullIllustrator, ScriptedStoryteller},
    config::AppConfig,
    ChatEvent, GiftEvent, GlobalIdentity, LeaderboardKind, LiveGame, Platform,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn config_in(dir: &std::path::Path, vote_secs: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.vote.duration_secs = vote_secs;
    config.storage.data_dir = Some(dir.to_path_buf());
    config.game.player_name = "石昊".to_string();
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_session_with_injected_votes() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path(), 1);
    let game = Arc::new(
        LiveGame::from_config(&config, Vec::new(), Arc::new(ScriptedStoryteller::default()))
            .with_illustrator(Arc::new(NullIllustrator)),
    );

    let voter = {
        let game = Arc::clone(&game);
        tokio::spawn(async move {
            while !game.is_stopped() {
                if game.votes().is_voting() {
                    game.handle_chat(&ChatEvent::new(Platform::Bilibili, "1", "甲", "2"));
                    game.handle_chat(&ChatEvent::new(Platform::Douyin, "1", "乙", "选2"));
                    game.handle_chat(&ChatEvent::new(Platform::Douyin, "2", "丙", "1"));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
    };

    game.handle_gift(&GiftEvent::new(Platform::Bilibili, "9", "金主", "灵石", 1, 12.0));

    let completed = tokio::time::timeout(Duration::from_secs(15), game.run_session(2))
        .await
        .expect("session should finish")
        .unwrap();
    assert_eq!(completed, 2);

    game.stop();
    voter.await.unwrap();

    let stats = game.leaderboard().game_stats();
    assert_eq!(stats.character_name, "石昊");
    assert_eq!(stats.total_choices, 2);
    assert_eq!(stats.total_stories, 3);
    assert_eq!(stats.total_votes, 6);
    assert_eq!(stats.winning_votes, 4);
    assert_eq!(stats.total_gifts_count, 1);

    let jia = GlobalIdentity::new(Platform::Bilibili, "1");
    let bing = GlobalIdentity::new(Platform::Douyin, "2");
    let jia_entry = game
        .leaderboard()
        .entry(LeaderboardKind::VoteParticipation, &jia)
        .unwrap();
    assert!((jia_entry.score - 6.0).abs() < f64::EPSILON);
    assert_eq!(jia_entry.metadata.correct_votes, 2);
    assert_eq!(game.leaderboard().get_rank(LeaderboardKind::Lucky, &bing), None);

    let vote_ends = game
        .leaderboard()
        .history(50)
        .into_iter()
        .filter(|event| event.kind == "vote_end")
        .count();
    assert_eq!(vote_ends, 2);

    // ギフト効果は最初のターンで消費される
    assert_eq!(game.gifts().pending_effect_count(), 0);
    assert_eq!(game.player_snapshot().name, "石昊");
    assert!(game.current_options().len() >= 2);

    assert!(dir.path().join("leaderboard.json").exists());
    assert!(dir.path().join("gift_records.json").exists());
}

#[tokio::test]
async fn test_stop_interrupts_open_vote() {
    let dir = tempdir().unwrap();
    let config = config_in(dir.path(), 30);
    let game = Arc::new(LiveGame::from_config(
        &config,
        Vec::new(),
        Arc::new(ScriptedStoryteller::default()),
    ));

    let session = {
        let game = Arc::clone(&game);
        tokio::spawn(async move { game.run_session(5).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !game.votes().is_voting() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(game.votes().is_voting());

    game.stop();
    let completed = tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .expect("session should stop promptly")
        .unwrap()
        .unwrap();
    assert_eq!(completed, 0);
    assert!(!game.votes().is_voting());
}

#[tokio::test]
async fn test_mock_listener_feeds_the_game() {
    let dir = tempdir().unwrap();
    let mut config = config_in(dir.path(), 30);
    config.platforms.mock.enabled = true;
    config.platforms.mock.interval_ms = 5;
    config.platforms.mock.chat_ratio = 0.5;
    config.platforms.mock.seed = Some(42);

    let listeners = build_listeners(&config);
    assert_eq!(listeners.len(), 1);

    let game = LiveGame::from_config(&config, listeners, Arc::new(ScriptedStoryteller::default()));
    assert_eq!(game.start_listeners(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline
        && (game.ticker().recent_chats(1).is_empty() || game.ticker().recent_gifts(1).is_empty())
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    game.stop();

    assert!(!game.ticker().recent_chats(1).is_empty());
    assert!(!game.ticker().recent_gifts(1).is_empty());
    assert!(game.leaderboard().game_stats().total_gifts_count >= 1);
}
