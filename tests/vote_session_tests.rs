//! 投票セッションの統合テスト
//!
//! タイマーによる締め切り、明示的な締め切りとの競合、複数プラットフォームからの投票を確認する。

use danmaku_quest::{ChatEvent, Platform, VoteManager, VoteOutcome};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn options() -> Vec<String> {
    vec!["御剑飞行".into(), "闭关修炼".into(), "下山历练".into()]
}

fn chat(platform: Platform, user: &str, text: &str) -> ChatEvent {
    ChatEvent::new(platform, user, user, text)
}

#[tokio::test]
async fn test_timer_closes_session_and_resolves_once() {
    let manager = VoteManager::new(Duration::from_millis(100));
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = oneshot::channel::<VoteOutcome>();

    let counter = Arc::clone(&calls);
    manager
        .start_vote(options(), move |outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome.clone());
        })
        .unwrap();

    assert_eq!(manager.record_vote(&chat(Platform::Bilibili, "u1", "1")), Some(0));
    assert_eq!(manager.record_vote(&chat(Platform::Bilibili, "u2", "选2")), Some(1));
    assert_eq!(manager.record_vote(&chat(Platform::Douyin, "u3", "2号")), Some(1));
    assert_eq!(manager.record_vote(&chat(Platform::Douyin, "u4", "加油")), None);

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("vote should close on its own")
        .unwrap();

    assert_eq!(outcome.winner_index, 1);
    assert_eq!(outcome.winner_key, "2");
    assert_eq!(outcome.winner_text, "闭关修炼");
    assert_eq!(outcome.total_votes(), 3);
    assert_eq!(outcome.tally.iter().map(|t| t.votes).collect::<Vec<_>>(), vec![1, 2, 0]);

    // 締め切り後の操作は何も起こさない
    assert!(!manager.is_voting());
    assert!(manager.end_vote().is_none());
    assert_eq!(manager.record_vote(&chat(Platform::Bilibili, "u5", "3")), None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_explicit_end_beats_timer() {
    let manager = VoteManager::new(Duration::from_millis(80));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    manager
        .start_vote(options(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    manager.record_vote(&chat(Platform::Mock, "u1", "3"));

    let outcome = manager.end_vote().unwrap();
    assert_eq!(outcome.winner_index, 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_session_is_not_closed_by_stale_timer() {
    let manager = VoteManager::new(Duration::from_millis(150));
    manager.start_vote(options(), |_| {}).unwrap();
    manager.end_vote().unwrap();

    // 直後に開始したセッションは前回のタイマーでは閉じない
    let second = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&second);
    manager
        .start_vote(options(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(manager.is_voting());
    assert!(manager.get_remaining_time() > Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert!(!manager.is_voting());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_votes_and_close_resolve_exactly_once() {
    let manager = VoteManager::new(Duration::from_secs(30));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    manager
        .start_vote(options(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let user = format!("w{worker}-{i}");
                manager.record_vote(&chat(Platform::Mock, &user, &format!("{}", i % 3 + 1)));
            }
            manager.end_vote()
        }));
    }

    let mut outcomes = 0;
    for task in tasks {
        if task.await.unwrap().is_some() {
            outcomes += 1;
        }
    }

    assert_eq!(outcomes, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!manager.is_voting());
}

#[tokio::test]
async fn test_same_user_id_on_two_platforms_votes_twice() {
    let manager = VoteManager::new(Duration::from_secs(30));
    manager.start_vote(options(), |_| {}).unwrap();

    manager.record_vote(&chat(Platform::Bilibili, "10086", "1"));
    manager.record_vote(&chat(Platform::Douyin, "10086", "1"));
    // 同じ人の再投票は票を移動するだけ
    manager.record_vote(&chat(Platform::Douyin, "10086", "3"));

    let outcome = manager.end_vote().unwrap();
    assert_eq!(outcome.total_votes(), 2);
    assert_eq!(outcome.tally[0].votes, 1);
    assert_eq!(outcome.tally[2].votes, 1);
    assert_eq!(outcome.winner_index, 0);
}
