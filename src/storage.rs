//! JSONスナップショットの永続化
//!
//! ランキングやギフト統計は変更のたびに全体を書き出す。
//! 書き込みは一時ファイル経由のリネームで行い、中断時にも既存ファイルを壊さない。
//! 読み込みに失敗した場合はデフォルト値で起動を続ける。

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{QuestError, QuestResult};

/// 1ファイル = 1スナップショットのストア
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// データディレクトリ配下のファイルを指すストア
    pub fn in_dir(dir: &Path, file_name: &str) -> Self {
        Self::new(dir.join(file_name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// スナップショットを書き出す
    pub fn save<T: Serialize>(&self, value: &T) -> QuestResult<()> {
        let json = serde_json::to_string_pretty(value)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| QuestError::Persistence {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|source| QuestError::Persistence {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &self.path).map_err(|source| QuestError::Persistence {
            path: self.path.clone(),
            source,
        })?;

        tracing::trace!(path = %self.path.display(), "💾 Snapshot saved");
        Ok(())
    }

    /// 書き出しを試み、失敗はログに残すだけにする
    pub fn save_or_log<T: Serialize>(&self, value: &T) -> bool {
        match self.save(value) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "❌ Failed to persist snapshot, keeping in-memory state"
                );
                false
            }
        }
    }

    /// スナップショットを読み込む。ファイルが無ければ`Ok(None)`
    pub fn load<T: DeserializeOwned>(&self) -> QuestResult<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// 読み込みを試み、失敗時はデフォルト値を返す
    pub fn load_or_default<T: DeserializeOwned + Default>(&self) -> T {
        match self.load() {
            Ok(Some(value)) => {
                tracing::info!(path = %self.path.display(), "📂 Snapshot loaded");
                value
            }
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "⚠️ Failed to load snapshot, starting fresh"
                );
                T::default()
            }
        }
    }
}
