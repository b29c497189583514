//! 投票セッション管理
//!
//! `Idle → Open → Closed → Idle` の状態遷移を持つ時間制限付き投票。
//! 締め切りはタイマー・明示的なクローズのどちらからでも起こり得るが、
//! セッションごとのアトミックフラグで勝者通知が必ず1回になるようにしている。
//! 通知コールバックはロックを解放してから呼び出すため、
//! コールバック内から再度マネージャーを操作してもデッドロックしない。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::{ChatEvent, GlobalIdentity};

/// 標準の投票マーカー。`{n}`が選択肢番号に置き換わる
pub const DEFAULT_MARKERS: &[&str] = &["{n}", "选{n}", "选择{n}", "{n}号"];

/// 締め切り時に呼ばれるコールバック
pub type ResolveHandler = Box<dyn FnOnce(&VoteOutcome) + Send + 'static>;

/// 選択肢ごとの集計
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTally {
    /// 選択肢キー（1始まりの番号）
    pub key: String,
    pub text: String,
    pub votes: usize,
}

/// 1票分の記録
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub identity: GlobalIdentity,
    pub display_name: String,
    /// 0始まりの選択肢インデックス
    pub option_index: usize,
}

/// 投票結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub session_id: Uuid,
    pub winner_index: usize,
    pub winner_key: String,
    pub winner_text: String,
    pub tally: Vec<OptionTally>,
    pub ballots: Vec<Ballot>,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl VoteOutcome {
    pub fn total_votes(&self) -> usize {
        self.ballots.len()
    }

    /// 指定の投票者が勝者に投票していたか
    pub fn voted_for_winner(&self, identity: &GlobalIdentity) -> bool {
        self.ballots
            .iter()
            .any(|b| &b.identity == identity && b.option_index == self.winner_index)
    }
}

struct BallotEntry {
    display_name: String,
    option_index: usize,
    cast_order: u64,
}

struct OpenSession {
    id: Uuid,
    options: Vec<String>,
    patterns: Vec<Vec<String>>,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    duration: Duration,
    ballots: HashMap<GlobalIdentity, BallotEntry>,
    next_order: u64,
    closed: Arc<AtomicBool>,
    on_resolved: Option<ResolveHandler>,
    timer: Option<JoinHandle<()>>,
}

impl OpenSession {
    fn match_option(&self, text: &str) -> Option<usize> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return None;
        }
        self.patterns.iter().position(|patterns| {
            patterns
                .iter()
                .any(|p| normalized == *p || normalized.starts_with(p.as_str()))
        })
    }

    fn tally(&self) -> Vec<OptionTally> {
        let mut counts = vec![0usize; self.options.len()];
        for entry in self.ballots.values() {
            counts[entry.option_index] += 1;
        }
        self.options
            .iter()
            .zip(counts)
            .enumerate()
            .map(|(i, (text, votes))| OptionTally {
                key: (i + 1).to_string(),
                text: text.clone(),
                votes,
            })
            .collect()
    }

    fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.started_at.elapsed())
    }
}

/// 最多得票の選択肢。同数なら番号の小さい方、票がなければ先頭
pub fn select_winner(tally: &[OptionTally]) -> usize {
    let mut winner = 0;
    let mut best = 0;
    for (i, option) in tally.iter().enumerate() {
        if option.votes > best {
            best = option.votes;
            winner = i;
        }
    }
    winner
}

/// 選択肢番号ごとのマッチパターンを構築
fn build_patterns(option_count: usize, extra_markers: &[String]) -> Vec<Vec<String>> {
    (1..=option_count)
        .map(|n| {
            let n = n.to_string();
            DEFAULT_MARKERS
                .iter()
                .map(|m| m.to_string())
                .chain(extra_markers.iter().cloned())
                .map(|marker| {
                    if marker.contains("{n}") {
                        marker.replace("{n}", &n)
                    } else {
                        format!("{marker}{n}")
                    }
                })
                .map(|p| p.to_lowercase())
                .collect()
        })
        .collect()
}

type SharedSession = Arc<Mutex<Option<OpenSession>>>;

/// セッションを閉じて結果を確定する。
/// `expected`を指定した場合、そのIDのセッションのみ閉じる（タイマー用）
fn close_session(slot: &SharedSession, expected: Option<Uuid>) -> Option<VoteOutcome> {
    let (session, tally) = {
        let mut guard = slot.lock();
        let current = guard.as_ref()?;
        if expected.is_some_and(|id| id != current.id) {
            return None;
        }
        if current
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let session = guard.take()?;
        let tally = session.tally();
        (session, tally)
    };

    let winner_index = select_winner(&tally);
    let mut ballots: Vec<(u64, Ballot)> = session
        .ballots
        .into_iter()
        .map(|(identity, entry)| {
            (
                entry.cast_order,
                Ballot {
                    identity,
                    display_name: entry.display_name,
                    option_index: entry.option_index,
                },
            )
        })
        .collect();
    ballots.sort_by_key(|(order, _)| *order);

    let outcome = VoteOutcome {
        session_id: session.id,
        winner_index,
        winner_key: (winner_index + 1).to_string(),
        winner_text: session.options[winner_index].clone(),
        tally,
        ballots: ballots.into_iter().map(|(_, b)| b).collect(),
        started_at: session.started_at_utc,
        closed_at: Utc::now(),
    };

    tracing::info!(
        session_id = %outcome.session_id,
        winner = %outcome.winner_key,
        total_votes = outcome.total_votes(),
        "🗳️ 投票结束，选项{}【{}】胜出",
        outcome.winner_key,
        outcome.winner_text
    );

    // 明示的なクローズではタイマーを止める
    if expected.is_none() {
        if let Some(timer) = session.timer {
            timer.abort();
        }
    }

    if let Some(handler) = session.on_resolved {
        handler(&outcome);
    }

    Some(outcome)
}

/// 投票マネージャー
#[derive(Clone)]
pub struct VoteManager {
    duration: Duration,
    extra_markers: Vec<String>,
    session: SharedSession,
}

impl VoteManager {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            extra_markers: Vec::new(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// 追加の投票マーカー（`{n}`を含まない場合は前置詞として扱う）
    pub fn with_extra_markers(mut self, markers: Vec<String>) -> Self {
        self.extra_markers = markers;
        self
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// 投票を開始する。
    ///
    /// 既に投票中、または選択肢が空の場合は`None`を返し何もしない。
    /// tokioランタイム上ではタイマーを仕込み、期限到来で自動的に締め切る。
    /// ランタイム外では[`VoteManager::check_deadline`]で協調的に締め切る。
    pub fn start_vote<F>(&self, options: Vec<String>, on_resolved: F) -> Option<Uuid>
    where
        F: FnOnce(&VoteOutcome) + Send + 'static,
    {
        if options.is_empty() {
            tracing::warn!("⚠️ Vote rejected: no options");
            return None;
        }

        let mut guard = self.session.lock();
        if guard.is_some() {
            tracing::warn!("⚠️ Vote rejected: a session is already open");
            return None;
        }

        let id = Uuid::new_v4();
        let timer = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let slot = Arc::clone(&self.session);
                let duration = self.duration;
                Some(handle.spawn(async move {
                    tokio::time::sleep(duration).await;
                    close_session(&slot, Some(id));
                }))
            }
            Err(_) => {
                tracing::debug!("No tokio runtime, vote deadline is checked cooperatively");
                None
            }
        };

        *guard = Some(OpenSession {
            id,
            patterns: build_patterns(options.len(), &self.extra_markers),
            options,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            duration: self.duration,
            ballots: HashMap::new(),
            next_order: 0,
            closed: Arc::new(AtomicBool::new(false)),
            on_resolved: Some(Box::new(on_resolved)),
            timer,
        });

        tracing::info!(
            session_id = %id,
            duration_secs = self.duration.as_secs_f64(),
            "🗳️ 投票开始"
        );
        Some(id)
    }

    /// 弾幕を票として記録する。マッチした選択肢のインデックスを返す
    pub fn record_vote(&self, event: &ChatEvent) -> Option<usize> {
        let mut guard = self.session.lock();
        let session = guard.as_mut()?;
        if session.closed.load(Ordering::Acquire) {
            return None;
        }

        let option_index = session.match_option(&event.text)?;
        let identity = event.identity();

        if let Some(existing) = session.ballots.get_mut(&identity) {
            if existing.option_index != option_index {
                tracing::debug!(
                    voter = %identity,
                    from = existing.option_index + 1,
                    to = option_index + 1,
                    "🔁 Ballot moved"
                );
                existing.option_index = option_index;
                existing.display_name = event.display_name.clone();
            }
            return Some(option_index);
        }

        let cast_order = session.next_order;
        session.next_order += 1;
        session.ballots.insert(
            identity,
            BallotEntry {
                display_name: event.display_name.clone(),
                option_index,
                cast_order,
            },
        );
        tracing::debug!(voter = %event.display_name, option = option_index + 1, "🗳️ Vote recorded");
        Some(option_index)
    }

    /// 投票を締め切る。最初の呼び出しのみ結果を返す
    pub fn end_vote(&self) -> Option<VoteOutcome> {
        close_session(&self.session, None)
    }

    /// 期限切れのセッションを締め切る
    pub fn check_deadline(&self) -> Option<VoteOutcome> {
        let (expired, id) = {
            let guard = self.session.lock();
            match guard.as_ref() {
                Some(session) => (session.remaining().is_zero(), session.id),
                None => return None,
            }
        };
        if expired {
            close_session(&self.session, Some(id))
        } else {
            None
        }
    }

    /// 現在の集計。投票中でなければ空
    pub fn get_tally(&self) -> Vec<OptionTally> {
        self.session
            .lock()
            .as_ref()
            .map(OpenSession::tally)
            .unwrap_or_default()
    }

    /// 残り時間。投票中でなければゼロ
    pub fn get_remaining_time(&self) -> Duration {
        self.session
            .lock()
            .as_ref()
            .map(OpenSession::remaining)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_voting(&self) -> bool {
        self.session.lock().is_some()
    }

    /// 投票中の選択肢
    pub fn options(&self) -> Vec<String> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.options.clone())
            .unwrap_or_default()
    }
}
