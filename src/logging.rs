//! ログ初期化
//!
//! コンソール出力に加え、設定に応じて日次ローテーションのファイル出力を行う。
//! 古いログファイルは`max_log_files`を超えた分を起動時に削除する。

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;

/// ロギングを初期化する（tokio-console使用時）
#[cfg(feature = "debug-tokio")]
pub fn init_logging(_config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    console_subscriber::init();
    Ok(None)
}

/// ロギングを初期化する。返されたガードはプロセス終了まで保持すること
#[cfg(not(feature = "debug-tokio"))]
pub fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let console = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    if config.json_format {
        layers.push(console.json().boxed());
    } else {
        layers.push(console.compact().boxed());
    }

    let mut guard = None;
    if config.enable_file_logging {
        let dir = config.resolved_log_dir();
        std::fs::create_dir_all(&dir)?;

        if config.auto_cleanup_enabled {
            match cleanup_old_logs(&dir, &config.log_file_prefix, config.max_log_files as usize) {
                Ok(0) => {}
                Ok(removed) => eprintln!("🧹 Removed {} old log file(s)", removed),
                Err(e) => eprintln!("⚠️ Log cleanup failed: {}", e),
            }
        }

        let appender = tracing_appender::rolling::daily(&dir, &config.log_file_prefix);
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .boxed(),
        );
        guard = Some(worker_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    tracing::debug!(level = %config.log_level, file_logging = config.enable_file_logging, "📝 Logging initialized");
    Ok(guard)
}

/// `prefix`で始まるログファイルのうち、新しい`keep`件を残して削除する
pub fn cleanup_old_logs(dir: &Path, prefix: &str, keep: usize) -> anyhow::Result<usize> {
    let pattern = dir.join(format!("{}*", glob::Pattern::escape(prefix)));
    let pattern = pattern.to_string_lossy();

    let mut files: Vec<(SystemTime, PathBuf)> = glob::glob(&pattern)?
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .map(|path| {
            let modified = path
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, path)
        })
        .collect();

    if files.len() <= keep {
        return Ok(0);
    }

    // 新しい順
    files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    let mut removed = 0;
    for (_, path) in files.into_iter().skip(keep) {
        if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
