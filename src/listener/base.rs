//! リスナー共通部品
//!
//! 購読者へのファンアウト、停止シグナル、固定バックオフの再接続ループ。
//! 各リスナーはこれらを所有（合成）して自分の接続ライフサイクルを実装する。

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::errors::{QuestError, QuestResult};
use crate::events::{ChatEvent, GiftEvent, Platform};

/// 弾幕購読コールバック
pub type ChatHandler = Arc<dyn Fn(&ChatEvent) + Send + Sync>;
/// ギフト購読コールバック
pub type GiftHandler = Arc<dyn Fn(&GiftEvent) + Send + Sync>;

/// リスナーの接続状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32 },
    Stopped,
}

/// 購読者レジストリ。イベントは登録済みの全コールバックへ配信される
#[derive(Clone, Default)]
pub struct EventBus {
    chat_handlers: Arc<RwLock<Vec<ChatHandler>>>,
    gift_handlers: Arc<RwLock<Vec<GiftHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chat_handler(&self, handler: ChatHandler) {
        self.chat_handlers.write().push(handler);
    }

    pub fn add_gift_handler(&self, handler: GiftHandler) {
        self.gift_handlers.write().push(handler);
    }

    pub fn handler_counts(&self) -> (usize, usize) {
        (
            self.chat_handlers.read().len(),
            self.gift_handlers.read().len(),
        )
    }

    /// 弾幕を全購読者へ配信
    pub fn emit_chat(&self, event: &ChatEvent) {
        // コールバック内からの再登録でデッドロックしないよう複製してから呼ぶ
        let handlers: Vec<ChatHandler> = self.chat_handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(platform = %event.platform, "❌ 弾幕コールバックでパニックが発生しました");
            }
        }
    }

    /// ギフトを全購読者へ配信
    pub fn emit_gift(&self, event: &GiftEvent) {
        let handlers: Vec<GiftHandler> = self.gift_handlers.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(platform = %event.platform, "❌ ギフトコールバックでパニックが発生しました");
            }
        }
    }
}

/// 停止シグナル
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// 停止されるまで待機
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }

    /// `delay`だけ待つ。途中で停止された場合は即座に`true`を返す
    pub async fn sleep_or_stopped(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(delay) => self.is_triggered(),
        }
    }
}

/// 接続セッションに渡されるコンテキスト
#[derive(Clone)]
pub struct ListenerContext {
    pub platform: Platform,
    pub bus: EventBus,
    pub signal: ShutdownSignal,
    status: Arc<RwLock<ListenerState>>,
}

impl ListenerContext {
    pub fn set_state(&self, state: ListenerState) {
        let mut current = self.status.write();
        if *current != state {
            tracing::debug!(platform = %self.platform, old_state = ?*current, new_state = ?state, "🔄 Listener state changed");
            *current = state;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.is_triggered()
    }
}

struct RunningTask {
    signal: ShutdownSignal,
    handle: JoinHandle<()>,
}

/// リスナー実装が所有する共通の状態
pub struct ListenerCore {
    platform: Platform,
    bus: EventBus,
    status: Arc<RwLock<ListenerState>>,
    running: Mutex<Option<RunningTask>>,
}

impl ListenerCore {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            bus: EventBus::new(),
            status: Arc::new(RwLock::new(ListenerState::Idle)),
            running: Mutex::new(None),
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> ListenerState {
        self.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// バックグラウンドタスクを起動。既に動作中なら何もしない
    pub fn spawn<F, Fut>(&self, run: F) -> QuestResult<()>
    where
        F: FnOnce(ListenerContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| QuestError::Runtime(format!("listener requires a tokio runtime: {e}")))?;

        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
        {
            tracing::warn!(platform = %self.platform, "Listener is already running");
            return Ok(());
        }

        let signal = ShutdownSignal::new();
        let context = ListenerContext {
            platform: self.platform.clone(),
            bus: self.bus.clone(),
            signal: signal.clone(),
            status: Arc::clone(&self.status),
        };
        context.set_state(ListenerState::Connecting { attempt: 0 });

        let handle = runtime.spawn(run(context));
        *running = Some(RunningTask { signal, handle });
        Ok(())
    }

    /// 停止を要求。一度も接続していなくても安全に呼べる
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let task = self.running.lock().take();
        match task {
            Some(task) => {
                task.signal.trigger();
                tracing::info!(platform = %self.platform, "🛑 Listener stop requested");
                Some(task.handle)
            }
            None => {
                *self.status.write() = ListenerState::Stopped;
                None
            }
        }
    }
}

/// 固定バックオフの無限再接続ループ
///
/// `session`は1回の接続の寿命を表す。正常終了・エラーのどちらでも
/// 停止されていなければ`delay`待ってから再接続する。停止フラグは
/// 各反復の境界で確認され、実行中の`session`も停止要求で破棄される。
pub async fn run_reconnect_loop<F, Fut>(context: ListenerContext, delay: Duration, mut session: F)
where
    F: FnMut(ListenerContext, u32) -> Fut,
    Fut: Future<Output = QuestResult<()>>,
{
    let mut attempt: u32 = 0;

    while !context.is_stopped() {
        attempt = attempt.saturating_add(1);
        context.set_state(ListenerState::Connecting { attempt });

        // 接続やハンドシェイクが応答しなくても停止要求で打ち切る
        let outcome = tokio::select! {
            biased;
            result = session(context.clone(), attempt) => Some(result),
            _ = context.signal.wait() => None,
        };

        match outcome {
            None => {
                tracing::info!(platform = %context.platform, attempt, "🛑 Session cancelled by stop request");
                break;
            }
            Some(Ok(())) => {
                tracing::info!(platform = %context.platform, attempt, "🔌 Connection closed");
            }
            Some(Err(e)) => {
                tracing::warn!(platform = %context.platform, attempt, error = %e, "⚠️ Connection failed");
            }
        }

        if context.is_stopped() {
            break;
        }

        context.set_state(ListenerState::Reconnecting { attempt });
        tracing::info!(
            platform = %context.platform,
            "🔄 Reconnecting in {:?} (attempt #{})",
            delay,
            attempt + 1
        );
        if context.signal.sleep_or_stopped(delay).await {
            break;
        }
    }

    context.set_state(ListenerState::Stopped);
    tracing::info!(platform = %context.platform, "🛑 Listener loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_event_bus_fans_out_to_every_handler() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            bus.add_chat_handler(Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.emit_chat(&ChatEvent::new(Platform::Mock, "u1", "Alice", "1"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.add_gift_handler(Arc::new(|_event| panic!("boom")));
        {
            let counter = Arc::clone(&counter);
            bus.add_gift_handler(Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        bus.emit_gift(&GiftEvent::new(Platform::Mock, "u1", "Alice", "x", 1, 1.0));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_before_start_is_safe() {
        let core = ListenerCore::new(Platform::Mock);
        assert!(core.stop().is_none());
        assert_eq!(core.state(), ListenerState::Stopped);
    }

    #[test]
    fn test_spawn_without_runtime_is_rejected() {
        let core = ListenerCore::new(Platform::Mock);
        let result = core.spawn(|_ctx| async {});
        assert!(matches!(result, Err(QuestError::Runtime(_))));
    }

    fn test_context() -> ListenerContext {
        ListenerContext {
            platform: Platform::Mock,
            bus: EventBus::new(),
            signal: ShutdownSignal::new(),
            status: Arc::new(RwLock::new(ListenerState::Idle)),
        }
    }

    #[tokio::test]
    async fn test_reconnect_loop_waits_backoff_between_attempts() {
        let context = test_context();
        let delay = Duration::from_millis(40);
        let calls = Arc::new(Mutex::new(Vec::<std::time::Instant>::new()));

        let task = {
            let calls = Arc::clone(&calls);
            tokio::spawn(run_reconnect_loop(
                context.clone(),
                delay,
                move |_ctx, _attempt| {
                    calls.lock().push(std::time::Instant::now());
                    async { Err(QuestError::Runtime("connection refused".into())) }
                },
            ))
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while calls.lock().len() < 4 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        context.signal.trigger();
        tokio::time::timeout(delay * 5, task)
            .await
            .expect("loop should stop within one backoff")
            .unwrap();

        let seen = calls.lock().clone();
        assert!(seen.len() >= 4);
        for pair in seen.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= delay);
        }
        assert_eq!(*context.status.read(), ListenerState::Stopped);

        tokio::time::sleep(delay * 3).await;
        assert_eq!(calls.lock().len(), seen.len());
    }

    #[tokio::test]
    async fn test_reconnect_loop_abandons_stalled_session() {
        let context = test_context();
        let task = tokio::spawn(run_reconnect_loop(
            context.clone(),
            Duration::from_millis(20),
            |_ctx, _attempt| std::future::pending::<QuestResult<()>>(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *context.status.read(),
            ListenerState::Connecting { attempt: 1 }
        );

        context.signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("stalled session should be dropped on stop")
            .unwrap();
        assert_eq!(*context.status.read(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_sleep_or_stopped_wakes_early() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let started = std::time::Instant::now();
        let stopped = signal.sleep_or_stopped(Duration::from_secs(10)).await;
        assert!(stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
