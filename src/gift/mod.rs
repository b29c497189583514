//! ギフト効果プロセッサー
//!
//! ギフトの合計価値から発動ティアを決定し、記録・保留キューへの追加・
//! 効果コールバックの呼び出しを行う。送り主ごとの累計統計と順位もここで管理する。
//!
//! 赐名権ティアが発動すると、その送り主に1回分の改名権を付与する。
//! 改名権は同じ送り主からの改名コマンド弾幕で消費される。

pub mod apply;
pub mod tiers;

pub use self::apply::{apply_pending_effects, apply_pending_effects_with_rng};
pub use self::tiers::{default_tiers, EffectPayload, EffectTier, TierId, TierTable};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::config::GiftConfig;
use crate::events::{ChatEvent, GiftEvent, GlobalIdentity, Platform};
use crate::storage::JsonStore;

/// 永続化ファイル名
pub const GIFT_RECORDS_FILE: &str = "gift_records.json";

/// 改名コマンドの接頭辞
const RENAME_PREFIXES: &[&str] = &["改名", "赐名", "rename"];

/// 効果コールバック（発動ティア, 元のギフト）
pub type EffectCallback = Arc<dyn Fn(&EffectTier, &GiftEvent) + Send + Sync>;

/// 効果が発動したギフトの記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftRecord {
    pub platform: Platform,
    pub user_id: String,
    pub username: String,
    pub gift_name: String,
    pub gift_count: u32,
    /// 合計価値（元）
    pub gift_value: f64,
    pub tier_id: TierId,
    pub effect_applied: String,
    pub timestamp: DateTime<Utc>,
}

/// 送り主の累計統計
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorStats {
    pub identity: GlobalIdentity,
    pub display_name: String,
    pub cumulative_value: f64,
    pub cumulative_gift_count: u64,
    pub last_seen_at: DateTime<Utc>,
    /// 1始まりの順位
    pub rank: usize,
}

/// 適用待ちの効果
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEffect {
    pub tier: EffectTier,
    /// 送り主の表示名
    pub donor: String,
    pub donor_identity: GlobalIdentity,
    pub value: f64,
}

/// 未消費の改名権
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameGrant {
    pub identity: GlobalIdentity,
    pub donor: String,
    pub granted_at: DateTime<Utc>,
}

/// 改名コマンドによる改名要求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRequest {
    pub identity: GlobalIdentity,
    pub donor: String,
    pub new_name: String,
}

/// 改名コマンドを解析。新しい名前が空なら`None`
pub fn parse_rename_command(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();

    RENAME_PREFIXES.iter().find_map(|prefix| {
        if !lower.starts_with(prefix) {
            return None;
        }
        // 接頭辞はASCIIか漢字のみなので小文字化でバイト長は変わらない
        let rest = trimmed.get(prefix.len()..)?;
        let name = rest
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '：' | ','))
            .trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GiftSnapshot {
    #[serde(default)]
    records: Vec<GiftRecord>,
    #[serde(default)]
    donor_stats: BTreeMap<String, DonorStats>,
    #[serde(default)]
    pending_rename: Option<RenameGrant>,
}

#[derive(Default)]
struct GiftState {
    records: VecDeque<GiftRecord>,
    donors: HashMap<String, DonorStats>,
    pending: Vec<PendingEffect>,
    rename: Option<RenameGrant>,
}

impl GiftState {
    fn from_snapshot(snapshot: GiftSnapshot, record_limit: usize) -> Self {
        let skip = snapshot.records.len().saturating_sub(record_limit);
        let mut state = Self {
            records: snapshot.records.into_iter().skip(skip).collect(),
            donors: snapshot.donor_stats.into_iter().collect(),
            pending: Vec::new(),
            rename: snapshot.pending_rename,
        };
        state.rerank();
        state
    }

    fn to_snapshot(&self) -> GiftSnapshot {
        GiftSnapshot {
            records: self.records.iter().cloned().collect(),
            donor_stats: self
                .donors
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            pending_rename: self.rename.clone(),
        }
    }

    fn sorted_donors(&self) -> Vec<&DonorStats> {
        let mut donors: Vec<&DonorStats> = self.donors.values().collect();
        donors.sort_by(|a, b| {
            b.cumulative_value
                .total_cmp(&a.cumulative_value)
                .then(a.last_seen_at.cmp(&b.last_seen_at))
                .then_with(|| a.identity.key().cmp(&b.identity.key()))
        });
        donors
    }

    fn rerank(&mut self) {
        let order: Vec<String> = self
            .sorted_donors()
            .into_iter()
            .map(|d| d.identity.key())
            .collect();
        for (i, key) in order.iter().enumerate() {
            if let Some(donor) = self.donors.get_mut(key) {
                donor.rank = i + 1;
            }
        }
    }
}

/// ギフトプロセッサー
pub struct GiftProcessor {
    tiers: TierTable,
    record_limit: usize,
    state: Mutex<GiftState>,
    callbacks: RwLock<Vec<EffectCallback>>,
    store: Option<JsonStore>,
}

impl GiftProcessor {
    /// 永続化なしで作成
    pub fn new(tiers: TierTable, record_limit: usize) -> Self {
        Self {
            tiers,
            record_limit: record_limit.max(1),
            state: Mutex::new(GiftState::default()),
            callbacks: RwLock::new(Vec::new()),
            store: None,
        }
    }

    /// 設定から作成し、既存の記録があれば読み込む
    pub fn from_config(config: &GiftConfig, store: Option<JsonStore>) -> Self {
        let mut processor = Self::new(TierTable::new(config.tiers.clone()), config.record_limit);
        if let Some(store) = store {
            let snapshot: GiftSnapshot = store.load_or_default();
            *processor.state.get_mut() = GiftState::from_snapshot(snapshot, processor.record_limit);
            processor.store = Some(store);
        }
        processor
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    /// 効果コールバックを登録
    pub fn on_effect(&self, callback: EffectCallback) {
        self.callbacks.write().push(callback);
    }

    fn persist(&self, state: &GiftState) {
        if let Some(store) = &self.store {
            store.save_or_log(&state.to_snapshot());
        }
    }

    /// ギフトを処理し、発動したティアを返す
    pub fn process_gift(&self, event: &GiftEvent) -> Option<EffectTier> {
        let total_value = event.total_value();
        let identity = event.identity();
        let tier = self.tiers.resolve(total_value).cloned();

        {
            let mut state = self.state.lock();
            let key = identity.key();
            let donor = state.donors.entry(key).or_insert_with(|| DonorStats {
                identity: identity.clone(),
                display_name: event.display_name.clone(),
                cumulative_value: 0.0,
                cumulative_gift_count: 0,
                last_seen_at: event.received_at,
                rank: 0,
            });
            donor.cumulative_value += total_value;
            donor.cumulative_gift_count += u64::from(event.unit_count);
            donor.last_seen_at = event.received_at;
            donor.display_name = event.display_name.clone();
            state.rerank();

            if let Some(tier) = &tier {
                state.records.push_back(GiftRecord {
                    platform: event.platform.clone(),
                    user_id: event.donor_id.clone(),
                    username: event.display_name.clone(),
                    gift_name: event.gift_name.clone(),
                    gift_count: event.unit_count,
                    gift_value: total_value,
                    tier_id: tier.tier_id.clone(),
                    effect_applied: tier.name.clone(),
                    timestamp: event.received_at,
                });
                while state.records.len() > self.record_limit {
                    state.records.pop_front();
                }

                state.pending.push(PendingEffect {
                    tier: tier.clone(),
                    donor: event.display_name.clone(),
                    donor_identity: identity.clone(),
                    value: total_value,
                });

                if tier.grants_rename() {
                    state.rename = Some(RenameGrant {
                        identity: identity.clone(),
                        donor: event.display_name.clone(),
                        granted_at: Utc::now(),
                    });
                    tracing::info!(donor = %event.display_name, "✏️ 赐名权已授予");
                }
            }

            self.persist(&state);
        }

        match &tier {
            Some(tier) => {
                tracing::info!(
                    donor = %event.display_name,
                    value = total_value,
                    tier = %tier.tier_id,
                    "🎁 {} 触发【{}】",
                    event,
                    tier.name
                );
                let callbacks: Vec<EffectCallback> = self.callbacks.read().clone();
                for callback in callbacks {
                    if catch_unwind(AssertUnwindSafe(|| callback(tier, event))).is_err() {
                        tracing::error!(tier = %tier.tier_id, "❌ 効果コールバックでパニックが発生しました");
                    }
                }
            }
            None => {
                tracing::debug!(donor = %event.display_name, value = total_value, "🎁 Gift below every tier");
            }
        }

        tier
    }

    /// 保留中の効果を取り出してキューを空にする
    pub fn take_pending_effects(&self) -> Vec<PendingEffect> {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub fn pending_effect_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_pending_rename(&self) -> bool {
        self.state.lock().rename.is_some()
    }

    pub fn pending_rename(&self) -> Option<RenameGrant> {
        self.state.lock().rename.clone()
    }

    /// 改名権の持ち主からの改名コマンドなら改名権を消費して要求を返す
    pub fn check_rename(&self, event: &ChatEvent) -> Option<RenameRequest> {
        let mut state = self.state.lock();
        let grant = state.rename.as_ref()?;
        if grant.identity != event.identity() {
            return None;
        }
        let new_name = parse_rename_command(&event.text)?;
        let grant = state.rename.take()?;
        self.persist(&state);

        tracing::info!(donor = %grant.donor, new_name = %new_name, "✏️ 赐名权已使用");
        Some(RenameRequest {
            identity: grant.identity,
            donor: grant.donor,
            new_name,
        })
    }

    /// 累計価値の上位`limit`人
    pub fn get_top_donors(&self, limit: usize) -> Vec<DonorStats> {
        self.state
            .lock()
            .sorted_donors()
            .into_iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// 最近の発動記録（新しい順）
    pub fn get_recent_gifts(&self, limit: usize) -> Vec<GiftRecord> {
        self.state
            .lock()
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn donor_stats(&self, identity: &GlobalIdentity) -> Option<DonorStats> {
        self.state.lock().donors.get(&identity.key()).cloned()
    }

    pub fn donor_count(&self) -> usize {
        self.state.lock().donors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn three_tiers() -> TierTable {
        TierTable::new(vec![
            EffectTier::new("T1", "一", 1.0, json!({"cultivation": 1}), ""),
            EffectTier::new("T2", "二", 5.0, json!({"can_rename": true}), ""),
            EffectTier::new("T3", "三", 10.0, json!({"cultivation": 10}), ""),
        ])
    }

    fn gift(user: &str, value: f64) -> GiftEvent {
        GiftEvent::new(Platform::Mock, user, user, "仙女棒", 1, value)
    }

    #[test]
    fn test_parse_rename_command() {
        assert_eq!(parse_rename_command("改名 叶凡"), Some("叶凡".into()));
        assert_eq!(parse_rename_command("赐名：石昊"), Some("石昊".into()));
        assert_eq!(parse_rename_command("Rename Neo"), Some("Neo".into()));
        assert_eq!(parse_rename_command("改名   "), None);
        assert_eq!(parse_rename_command("我要改名"), None);
    }

    #[test]
    fn test_below_threshold_still_counts_for_donor() {
        let processor = GiftProcessor::new(three_tiers(), 10);
        assert!(processor.process_gift(&gift("a", 0.5)).is_none());

        let stats = processor
            .donor_stats(&GlobalIdentity::new(Platform::Mock, "a"))
            .unwrap();
        assert_eq!(stats.cumulative_value, 0.5);
        assert_eq!(stats.rank, 1);
        assert!(processor.take_pending_effects().is_empty());
        assert!(processor.get_recent_gifts(10).is_empty());
    }

    #[test]
    fn test_callbacks_see_tier_before_queue_is_consumed() {
        let processor = GiftProcessor::new(three_tiers(), 10);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        processor.on_effect(Arc::new(move |tier, _gift| {
            assert_eq!(tier.tier_id.0, "T3");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        processor.process_gift(&gift("a", 12.0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(processor.pending_effect_count(), 1);
        assert_eq!(processor.take_pending_effects().len(), 1);
        assert_eq!(processor.pending_effect_count(), 0);
    }

    #[test]
    fn test_record_limit() {
        let processor = GiftProcessor::new(three_tiers(), 3);
        for i in 0..5 {
            processor.process_gift(&gift(&format!("u{i}"), 1.0));
        }
        let recent = processor.get_recent_gifts(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_id, "u4");
    }

    #[test]
    fn test_rename_grant_is_scoped_to_donor() {
        let processor = GiftProcessor::new(three_tiers(), 10);
        processor.process_gift(&gift("patron", 6.0));
        assert!(processor.has_pending_rename());

        let stranger = ChatEvent::new(Platform::Mock, "other", "other", "改名 路人");
        assert!(processor.check_rename(&stranger).is_none());

        let empty = ChatEvent::new(Platform::Mock, "patron", "patron", "改名");
        assert!(processor.check_rename(&empty).is_none());
        assert!(processor.has_pending_rename());

        let command = ChatEvent::new(Platform::Mock, "patron", "patron", "改名 萧炎");
        let request = processor.check_rename(&command).unwrap();
        assert_eq!(request.new_name, "萧炎");
        assert!(!processor.has_pending_rename());
        assert!(processor.check_rename(&command).is_none());
    }

    #[test]
    fn test_rank_ties_prefer_earliest_donor() {
        let processor = GiftProcessor::new(three_tiers(), 10);
        let mut first = gift("early", 3.0);
        let mut second = gift("late", 3.0);
        second.received_at = first.received_at + chrono::Duration::seconds(5);
        first.received_at -= chrono::Duration::seconds(5);

        processor.process_gift(&second);
        processor.process_gift(&first);

        let top = processor.get_top_donors(2);
        assert_eq!(top[0].identity.user_id, "early");
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[1].rank, 2);
    }
}
