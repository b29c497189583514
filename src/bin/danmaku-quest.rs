use clap::Parser;
use danmaku_quest::{
    build_listeners,
    collaborators::{NullIllustrator, ScriptedStoryteller},
    config::{AppConfig, ConfigManager},
    listener::{BilibiliConfig, DouyinConfig},
    logging, LeaderboardKind, LiveGame,
};
use std::path::PathBuf;
use std::sync::Arc;

/// 弾幕投票で進む修仙アドベンチャー
#[derive(Parser, Debug)]
#[command(name = "danmaku-quest")]
#[command(about = "Live-stream danmaku voting adventure", long_about = None)]
#[command(version)]
struct Cli {
    /// 設定ファイルのパス（省略時はXDG設定ディレクトリ）
    #[arg(short, long, env = "DANMAKU_QUEST_CONFIG")]
    config: Option<PathBuf>,

    /// テスト用の模擬弾幕を有効化
    #[arg(long)]
    mock: bool,

    /// B站の房间号
    #[arg(long)]
    bilibili_room: Option<u64>,

    /// 抖音の房间号
    #[arg(long)]
    douyin_room: Option<String>,

    /// 抖音中継WebSocketのURL
    #[arg(long, requires = "douyin_room")]
    douyin_endpoint: Option<String>,

    /// 投票時間（秒）
    #[arg(long)]
    vote_duration: Option<u64>,

    /// 進めるターン数
    #[arg(long)]
    turns: Option<u32>,

    /// データディレクトリ
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// ログレベル
    #[arg(long, env = "DANMAKU_QUEST_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// コマンドライン引数で設定を上書き
    fn apply(&self, config: &mut AppConfig) {
        if self.mock {
            config.platforms.mock.enabled = true;
        }
        if let Some(room_id) = self.bilibili_room {
            let bilibili = config
                .platforms
                .bilibili
                .get_or_insert_with(BilibiliConfig::default);
            bilibili.room_id = room_id;
        }
        if let Some(room_id) = &self.douyin_room {
            let douyin = config
                .platforms
                .douyin
                .get_or_insert_with(DouyinConfig::default);
            douyin.room_id = room_id.clone();
            if let Some(endpoint) = &self.douyin_endpoint {
                douyin.endpoint = Some(endpoint.clone());
            }
        }
        if let Some(secs) = self.vote_duration {
            config.vote.duration_secs = secs;
        }
        if let Some(turns) = self.turns {
            config.game.turns = turns;
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.log.log_level = level.clone();
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let mut config = manager.load_config().unwrap_or_else(|e| {
        eprintln!("⚠️ 設定読み込みエラー、デフォルト設定を使用: {:#}", e);
        AppConfig::default()
    });
    cli.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // ガードはプロセス終了まで保持
    let _log_guard = logging::init_logging(&config.log)?;

    tracing::info!("🎬 Starting danmaku-quest");

    let listeners = build_listeners(&config);
    if listeners.is_empty() {
        tracing::warn!("⚠️ No platform configured, votes will only close on timeout");
    }

    let game = Arc::new(
        LiveGame::from_config(&config, listeners, Arc::new(ScriptedStoryteller::default()))
            .with_illustrator(Arc::new(NullIllustrator)),
    );
    game.start_listeners();

    {
        let game = Arc::clone(&game);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("🛑 Ctrl+C received, shutting down...");
                game.stop();
            }
        });
    }

    let result = game.run_session(config.game.turns).await;
    game.stop();

    println!("{}", game.player_status());
    for kind in LeaderboardKind::ALL {
        println!("{}", game.leaderboard().format_board(kind, 10));
    }
    println!("{}", game.leaderboard().stats_summary());

    let turns = result?;
    tracing::info!(turns, "👋 danmaku-quest finished");
    Ok(())
}
