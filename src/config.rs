//! アプリケーション設定管理
//!
//! XDGディレクトリ上の`config.toml`を読み書きする。
//! ファイルが無い場合はデフォルト設定で起動する。

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::{QuestError, QuestResult};
use crate::gift::{default_tiers, EffectTier};
use crate::listener::{BilibiliConfig, DouyinConfig, MockConfig};

/// XDGディレクトリ
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "danmaku-quest", "danmaku-quest")
}

/// 投票設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VoteConfig {
    /// 投票時間（秒）
    pub duration_secs: u64,
    /// 追加の投票マーカー（例: `"vote"`、`"第{n}个"`）
    pub extra_markers: Vec<String>,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            duration_secs: 15,
            extra_markers: Vec::new(),
        }
    }
}

impl VoteConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// ギフト設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GiftConfig {
    /// 保持する発動記録の上限
    pub record_limit: usize,
    /// 効果ティア表
    pub tiers: Vec<EffectTier>,
}

impl Default for GiftConfig {
    fn default() -> Self {
        Self {
            record_limit: 1000,
            tiers: default_tiers(),
        }
    }
}

/// ランキング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaderboardConfig {
    /// メモリ上に保持する履歴の上限
    pub history_limit: usize,
}

impl Default for LeaderboardConfig {
    fn default() -> Self {
        Self { history_limit: 500 }
    }
}

/// 永続化設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// データディレクトリ（Noneの場合はXDGデフォルト使用）
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// 実際に使用するデータディレクトリ
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from("data"))
        })
    }
}

/// プラットフォーム接続設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PlatformsConfig {
    pub bilibili: Option<BilibiliConfig>,
    pub douyin: Option<DouyinConfig>,
    pub mock: MockConfig,
}

/// リスナー共通設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// 再接続までの待機時間（ミリ秒）
    pub reconnect_delay_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5000,
        }
    }
}

impl ListenerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// ゲーム設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GameConfig {
    /// 主人公の初期名
    pub player_name: String,
    /// 1回の配信で進めるターン数
    pub turns: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            player_name: "无名修士".to_string(),
            turns: 10,
        }
    }
}

/// ログ設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// カスタムログディレクトリ（Noneの場合はXDGデフォルト使用）
    pub log_dir: Option<PathBuf>,
    /// ログレベル (trace/debug/info/warn/error)
    pub log_level: String,
    /// ファイル出力有効化
    pub enable_file_logging: bool,
    /// JSON形式で出力
    pub json_format: bool,
    /// 保存するログファイル数上限
    pub max_log_files: u32,
    /// 古いログファイル自動削除
    pub auto_cleanup_enabled: bool,
    /// ログファイル名の接頭辞
    pub log_file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            log_level: "info".to_string(),
            enable_file_logging: true,
            json_format: false,
            max_log_files: 30,
            auto_cleanup_enabled: true,
            log_file_prefix: "danmaku-quest".to_string(),
        }
    }
}

impl LogConfig {
    /// 実際に使用するログディレクトリ
    pub fn resolved_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs"))
        })
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub game: GameConfig,
    pub vote: VoteConfig,
    pub gift: GiftConfig,
    pub leaderboard: LeaderboardConfig,
    pub storage: StorageConfig,
    pub listener: ListenerConfig,
    pub platforms: PlatformsConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// 起動前の整合性チェック
    pub fn validate(&self) -> QuestResult<()> {
        if self.vote.duration_secs == 0 {
            return Err(QuestError::config("vote.duration_secs must be positive"));
        }
        if self.game.turns == 0 {
            return Err(QuestError::config("game.turns must be positive"));
        }
        if !(0.0..=1.0).contains(&self.platforms.mock.chat_ratio) {
            return Err(QuestError::config(format!(
                "platforms.mock.chat_ratio must be within 0..=1 (got {})",
                self.platforms.mock.chat_ratio
            )));
        }
        if let Some(tier) = self
            .gift
            .tiers
            .iter()
            .find(|tier| tier.minimum_value.is_nan() || tier.minimum_value < 0.0)
        {
            return Err(QuestError::config(format!(
                "gift tier '{}' has an invalid minimum_value",
                tier.tier_id
            )));
        }
        Ok(())
    }
}

/// 設定管理マネージャー
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// XDG設定ディレクトリを使う設定マネージャーを作成
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        Ok(Self { config_path })
    }

    /// 任意のパスを使う設定マネージャーを作成
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    fn get_config_path() -> Result<PathBuf> {
        let dirs = project_dirs().context("Failed to get project directories")?;
        let config_file = dirs.config_dir().join("config.toml");
        debug!("Config file path: {}", config_file.display());
        Ok(config_file)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// 設定を読み込み
    pub fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!(
                "Config file not found, using default settings: {}",
                self.config_path.display()
            );
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_path).with_context(|| {
            format!("Failed to read config file: {}", self.config_path.display())
        })?;

        let config: AppConfig = toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse config file: {}",
                self.config_path.display()
            )
        })?;

        info!(
            "✅ Configuration loaded from: {}",
            self.config_path.display()
        );
        Ok(config)
    }

    /// 設定を保存
    pub fn save_config(&self, config: &AppConfig) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.config_path, content).with_context(|| {
            format!(
                "Failed to write config file: {}",
                self.config_path.display()
            )
        })?;

        info!("💾 Configuration saved to: {}", self.config_path.display());
        Ok(())
    }
}
