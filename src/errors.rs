//! クレート共通のエラー型
//!
//! リスナーや永続化の失敗はここで型付けされるが、
//! 実際にプロセス外へ伝播するのは設定読み込みと起動処理のみ。

use std::path::PathBuf;
use thiserror::Error;

/// danmaku-quest全体のエラー型
#[derive(Error, Debug)]
pub enum QuestError {
    /// I/Oエラー
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSONのシリアライズ/デシリアライズエラー
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTPリクエストエラー
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocketエラー
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// プラットフォーム固有のプロトコル違反
    #[error("Protocol error on {platform}: {reason}")]
    Protocol { platform: String, reason: String },

    /// 設定値が不正
    #[error("Configuration error: {0}")]
    Config(String),

    /// 状態ファイルの書き込み失敗
    #[error("Persistence error at {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 実行環境（tokioランタイム等）の問題
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// その他
    #[error(transparent)]
    General(#[from] anyhow::Error),
}

impl QuestError {
    /// プロトコルエラーを作成
    pub fn protocol(platform: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            platform: platform.into(),
            reason: reason.into(),
        }
    }

    /// 設定エラーを作成
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// 共通Result型
pub type QuestResult<T> = Result<T, QuestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = QuestError::protocol("bilibili", "short header");
        assert_eq!(err.to_string(), "Protocol error on bilibili: short header");
    }

    #[test]
    fn test_persistence_error_mentions_path() {
        let err = QuestError::Persistence {
            path: PathBuf::from("/tmp/leaderboard.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/tmp/leaderboard.json"));
    }

    #[test]
    fn test_config_error_display() {
        let err = QuestError::config("vote.duration_secs must be positive");
        assert_eq!(
            err.to_string(),
            "Configuration error: vote.duration_secs must be positive"
        );
    }
}
