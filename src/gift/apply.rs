//! 保留中のギフト効果をプレイヤーへ適用する

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

use super::tiers::{is_truthy, keys};
use super::PendingEffect;
use crate::player::PlayerState;

/// 上限値の変更を回復より先に適用する
fn application_order(key: &str) -> u8 {
    match key {
        keys::MAX_HP | keys::MAX_MP => 0,
        _ => 1,
    }
}

fn as_amount(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|v| v.round() as i64))
}

/// 効果を適用し、変化の説明文を返す。未知のキーは無視する
pub fn apply_pending_effects<P>(player: &mut P, effects: &[PendingEffect]) -> Vec<String>
where
    P: PlayerState + ?Sized,
{
    apply_pending_effects_with_rng(player, effects, &mut rand::thread_rng())
}

/// 乱数源を指定して効果を適用
pub fn apply_pending_effects_with_rng<P, R>(
    player: &mut P,
    effects: &[PendingEffect],
    rng: &mut R,
) -> Vec<String>
where
    P: PlayerState + ?Sized,
    R: Rng + ?Sized,
{
    let mut messages = Vec::new();

    for pending in effects {
        let tier = &pending.tier;
        let donor = &pending.donor;

        let mut entries: Vec<(&String, &Value)> = tier.payload.iter().collect();
        entries.sort_by_key(|(key, _)| application_order(key));

        for (key, value) in entries {
            match key.as_str() {
                keys::CULTIVATION => {
                    let Some(amount) = as_amount(value) else { continue };
                    let result = player.add_cultivation(amount);
                    let mut msg = format!("【{}】的{}：修为+{}", donor, tier.name, amount);
                    if let Some(realm) = result.new_realm {
                        msg.push_str(&format!("，突破至【{}】！", realm));
                    }
                    messages.push(msg);
                }
                keys::MAX_HP => {
                    let Some(amount) = as_amount(value) else { continue };
                    player.raise_max_hp(amount);
                    messages.push(format!("【{}】的{}：最大生命+{}", donor, tier.name, amount));
                }
                keys::HP => {
                    let Some(amount) = as_amount(value) else { continue };
                    let healed = player.heal(amount);
                    if healed > 0 {
                        messages.push(format!("恢复生命值 {}", healed));
                    }
                }
                keys::MAX_MP => {
                    let Some(amount) = as_amount(value) else { continue };
                    player.raise_max_mp(amount);
                    messages.push(format!("【{}】的{}：最大灵力+{}", donor, tier.name, amount));
                }
                keys::MP => {
                    let Some(amount) = as_amount(value) else { continue };
                    let restored = player.restore_mp(amount);
                    if restored > 0 {
                        messages.push(format!("恢复灵力 {}", restored));
                    }
                }
                keys::RANDOM_ATTRIBUTE => {
                    let Some(amount) = as_amount(value) else { continue };
                    let names = player.attribute_names();
                    if let Some(attr) = names.choose(rng) {
                        player.add_attribute(attr, amount);
                        messages.push(format!("【{}】的{}：{}+{}", donor, tier.name, attr, amount));
                    }
                }
                keys::CAN_RENAME => {
                    if is_truthy(value) {
                        messages.push(format!(
                            "【{}】获得{}！发送「改名 新名字」即可为主角改名",
                            donor, tier.name
                        ));
                    }
                }
                keys::BREAKTHROUGH_BOOST => {
                    let Some(amount) = as_amount(value) else { continue };
                    player.grant_breakthrough_boost(amount);
                    messages.push(format!("【{}】的{}：突破成功率+{}%", donor, tier.name, amount));
                }
                keys::RESURRECTION => {
                    if is_truthy(value) {
                        player.grant_resurrection();
                        messages.push(format!("【{}】的{}：获得一次复活机会", donor, tier.name));
                    }
                }
                other => {
                    tracing::debug!(key = other, tier = %tier.tier_id, "Unknown effect key ignored");
                }
            }
        }
    }

    messages
}
