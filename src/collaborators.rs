//! 外部協力サービスの境界
//!
//! 物語生成と挿絵生成はこのクレートの外で行われる。
//! ここではその境界となるトレイトと、オフライン動作用の代替実装を提供する。

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::errors::QuestResult;
use crate::player::PlayerSnapshot;

/// 挿絵プロンプトの最大文字数
pub const MAX_PROMPT_CHARS: usize = 500;

/// 物語生成サービス
///
/// 戻り値は選択肢タグ・効果タグを含む自由文。解析は[`crate::narrative`]が行う。
#[async_trait]
pub trait Storyteller: Send + Sync {
    /// 冒頭の物語
    async fn opening(&self, player: &PlayerSnapshot) -> QuestResult<String>;

    /// 選ばれた選択肢に続く物語
    async fn continue_story(
        &self,
        player: &PlayerSnapshot,
        choice: &str,
        history: &[String],
    ) -> QuestResult<String>;
}

/// 挿絵生成サービス。失敗や未対応は`Ok(None)`でもよい
#[async_trait]
pub trait Illustrator: Send + Sync {
    async fn illustrate(&self, prompt: &str) -> QuestResult<Option<Vec<u8>>>;
}

/// プロンプトを上限文字数で切り詰める
pub fn bounded_prompt(text: &str) -> String {
    text.chars().take(MAX_PROMPT_CHARS).collect()
}

/// 挿絵生成をバックグラウンドで開始する。呼び出し側は待たない
pub fn spawn_illustration(
    illustrator: Arc<dyn Illustrator>,
    story: &str,
) -> Option<JoinHandle<Option<Vec<u8>>>> {
    let prompt = bounded_prompt(story);
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        match illustrator.illustrate(&prompt).await {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("⚠️ Illustration failed: {}", e);
                None
            }
        }
    }))
}

/// 台本どおりに物語を返す代替実装
pub struct ScriptedStoryteller {
    opening: String,
    scenes: Vec<String>,
    cursor: AtomicUsize,
}

impl ScriptedStoryteller {
    pub fn new(opening: impl Into<String>, scenes: Vec<String>) -> Self {
        Self {
            opening: opening.into(),
            scenes,
            cursor: AtomicUsize::new(0),
        }
    }

    /// これまでに返した続きの数
    pub fn turns_served(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedStoryteller {
    fn default() -> Self {
        Self::new(
            "青云山脉绵延万里，灵气充沛。一位云游老道留下《太虚心法》与一句话：\
             「三年后，青云山顶见。」如今三年已过，你踏上了前往青云山的道路。\n\
             刚出村口，便遇到一个分岔路口，林中隐约传来打斗声……\n\
             [选项1] 循着打斗声查看情况\n[选项2] 走左边的山间小道\n[选项3] 走右边安全的官道",
            vec![
                "你救下一位受伤的青云门外门弟子林风。林风告诉你，青云山深处出现了一处上古遗迹。[修为+5]\n\
                 [选项1] 与林风结伴同行\n[选项2] 独自前往遗迹\n[选项3] 先护送林风回青云门"
                    .to_string(),
                "遗迹入口处灵气翻涌，一头守护妖兽拦住了去路，激战之后你略受轻伤。[生命-15][修为+10][物品:妖兽内丹]\n\
                 [选项1] 深入遗迹\n[选项2] 原地调息\n[选项3] 炼化妖兽内丹"
                    .to_string(),
                "遗迹深处，一座古老的石碑上刻满了玄奥的符文。你静心参悟，体内真元如潮水般翻涌。[修为+30][灵力+20]\n\
                 [选项1] 继续参悟石碑\n[选项2] 搜寻遗迹宝藏\n[选项3] 离开遗迹"
                    .to_string(),
            ],
        )
    }
}

#[async_trait]
impl Storyteller for ScriptedStoryteller {
    async fn opening(&self, _player: &PlayerSnapshot) -> QuestResult<String> {
        Ok(self.opening.clone())
    }

    async fn continue_story(
        &self,
        player: &PlayerSnapshot,
        choice: &str,
        _history: &[String],
    ) -> QuestResult<String> {
        let turn = self.cursor.fetch_add(1, Ordering::SeqCst);
        let scene = if self.scenes.is_empty() {
            String::new()
        } else {
            self.scenes[turn % self.scenes.len()].clone()
        };
        Ok(format!("{}决定{}。\n\n{}", player.name, choice, scene))
    }
}

/// 何も描かない挿絵サービス
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIllustrator;

#[async_trait]
impl Illustrator for NullIllustrator {
    async fn illustrate(&self, _prompt: &str) -> QuestResult<Option<Vec<u8>>> {
        Ok(None)
    }
}
