pub mod collaborators;
pub mod config;
pub mod errors;
pub mod events;
pub mod gift;
pub mod leaderboard;
pub mod listener;
pub mod logging;
pub mod narrative;
pub mod orchestrator;
pub mod player;
pub mod storage;
pub mod vote;

// Re-export the main error types for convenience
pub use errors::{QuestError, QuestResult};

// Re-export the event model
pub use events::{ChatEvent, GiftEvent, GlobalIdentity, Platform};

// Re-export listener entry points
pub use listener::{build_listeners, DanmakuListener, DanmakuListenerExt, ListenerState};

// Re-export game components
pub use gift::{EffectTier, GiftProcessor, TierTable};
pub use leaderboard::{Leaderboard, LeaderboardKind};
pub use orchestrator::{LiveGame, TurnReport};
pub use vote::{VoteManager, VoteOutcome};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports_drive_a_gift() {
        let tiers = TierTable::new(vec![EffectTier::new(
            "spark",
            "火花",
            1.0,
            serde_json::json!({"cultivation": 5}),
            "",
        )]);
        let gifts = GiftProcessor::new(tiers, 10);
        let board = Leaderboard::new(10);

        let event = GiftEvent::new(Platform::Mock, "u1", "道友", "灵石", 2, 1.0);
        assert!(gifts.process_gift(&event).is_some());
        board.update_contribution(&event.identity(), &event.display_name, event.total_value(), &event.gift_name);

        let identity = GlobalIdentity::new(Platform::Mock, "u1");
        assert_eq!(board.get_rank(LeaderboardKind::Contribution, &identity), Some(1));
        assert_eq!(ChatEvent::new(Platform::Mock, "u1", "道友", "1").identity(), identity);
    }

    #[test]
    fn test_error_alias() {
        let result: QuestResult<()> = Err(QuestError::config("bad"));
        assert!(matches!(result, Err(QuestError::Config(_))));
    }
}
