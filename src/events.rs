//! プラットフォーム非依存の弾幕・ギフトイベント
//!
//! 各リスナーはプラットフォーム固有のペイロードをここで定義する
//! 2種類のイベントに正規化してから購読者へ配信する。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 配信プラットフォーム
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Bilibili,
    Douyin,
    Mock,
    Other(String),
}

impl Platform {
    /// 永続化キー等で使う識別子
    pub fn as_str(&self) -> &str {
        match self {
            Platform::Bilibili => "bilibili",
            Platform::Douyin => "douyin",
            Platform::Mock => "mock",
            Platform::Other(name) => name.as_str(),
        }
    }

    /// ランキング表示用アイコン
    pub fn icon(&self) -> &'static str {
        match self {
            Platform::Bilibili => "📺",
            Platform::Douyin => "🎵",
            Platform::Mock => "🎮",
            Platform::Other(_) => "👤",
        }
    }

    /// 識別子文字列からプラットフォームを復元
    pub fn from_key(key: &str) -> Self {
        match key {
            "bilibili" => Platform::Bilibili,
            "douyin" => Platform::Douyin,
            "mock" => Platform::Mock,
            other => Platform::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (プラットフォーム, ユーザーID) の組。システム全体で視聴者を一意に識別する
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalIdentity {
    pub platform: Platform,
    pub user_id: String,
}

impl GlobalIdentity {
    pub fn new(platform: Platform, user_id: impl Into<String>) -> Self {
        Self {
            platform,
            user_id: user_id.into(),
        }
    }

    /// 永続化レコードのキー（`{platform}_{user_id}`）
    ///
    /// 最初の`_`が区切りになるよう、プラットフォーム名中の`%`と`_`はエスケープする。
    pub fn key(&self) -> String {
        let platform = self.platform.as_str().replace('%', "%25").replace('_', "%5F");
        format!("{}_{}", platform, self.user_id)
    }
}

impl fmt::Display for GlobalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.user_id)
    }
}

/// 弾幕（チャット）イベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub platform: Platform,
    pub voter_id: String,
    pub display_name: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl ChatEvent {
    pub fn new(
        platform: Platform,
        voter_id: impl Into<String>,
        display_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            voter_id: voter_id.into(),
            display_name: display_name.into(),
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> GlobalIdentity {
        GlobalIdentity::new(self.platform.clone(), self.voter_id.clone())
    }
}

impl fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.platform, self.display_name, self.text)
    }
}

/// ギフトイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GiftEvent {
    pub platform: Platform,
    pub donor_id: String,
    pub display_name: String,
    pub gift_name: String,
    pub unit_count: u32,
    /// 1個あたりの価値（元）
    pub unit_value: f64,
    pub received_at: DateTime<Utc>,
}

impl GiftEvent {
    pub fn new(
        platform: Platform,
        donor_id: impl Into<String>,
        display_name: impl Into<String>,
        gift_name: impl Into<String>,
        unit_count: u32,
        unit_value: f64,
    ) -> Self {
        Self {
            platform,
            donor_id: donor_id.into(),
            display_name: display_name.into(),
            gift_name: gift_name.into(),
            unit_count,
            unit_value,
            received_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> GlobalIdentity {
        GlobalIdentity::new(self.platform.clone(), self.donor_id.clone())
    }

    /// 合計価値 = 個数 × 単価
    pub fn total_value(&self) -> f64 {
        f64::from(self.unit_count) * self.unit_value
    }
}

impl fmt::Display for GiftEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} 赠送 {} x{}",
            self.platform, self.display_name, self.gift_name, self.unit_count
        )
    }
}
