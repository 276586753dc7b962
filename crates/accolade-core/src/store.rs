// Achievement store port - the external system of record
//
// Every call is atomic from the coordinator's perspective and is a
// suspension point. The coordination layer synthesizes multi-call
// transaction semantics on top; this trait promises nothing beyond
// per-call atomicity.

use crate::error::StoreError;
use crate::model::{
    Achievement, AchievementCategory, AchievementId, CategoryId, GlobalAchievementStats,
    UserAchievement, UserId, UserProgress,
};
use async_trait::async_trait;

#[async_trait]
pub trait AchievementStore: Send + Sync {
    /// All achievements granted to a user.
    async fn get_user_achievements(&self, user: UserId)
        -> Result<Vec<UserAchievement>, StoreError>;

    /// Achievement definition, or None if the id is unknown.
    async fn get_achievement(&self, id: AchievementId) -> Result<Option<Achievement>, StoreError>;

    /// Category definition, or None if the id is unknown.
    async fn get_category(&self, id: CategoryId)
        -> Result<Option<AchievementCategory>, StoreError>;

    /// Grant an achievement. Commits immediately; the caller is responsible
    /// for duplicate checks and compensation.
    async fn grant_user_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
        notify: bool,
    ) -> Result<UserAchievement, StoreError>;

    /// Revoke an achievement. Returns whether a grant row was removed.
    async fn revoke_user_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
    ) -> Result<bool, StoreError>;

    /// All progress rows for a user.
    async fn get_user_progress(&self, user: UserId) -> Result<Vec<UserProgress>, StoreError>;

    /// Progress toward one achievement, or None if no row exists yet.
    async fn get_user_progress_for_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
    ) -> Result<Option<UserProgress>, StoreError>;

    /// Set the progress value for (user, achievement), creating the row if
    /// needed. Returns the updated row.
    async fn update_user_progress(
        &self,
        user: UserId,
        achievement: AchievementId,
        new_value: i64,
    ) -> Result<UserProgress, StoreError>;

    /// Remove every grant and progress row for a user.
    async fn reset_user_data(&self, user: UserId) -> Result<(), StoreError>;

    /// Cached global counters maintained by the store.
    async fn get_global_achievement_stats(&self) -> Result<GlobalAchievementStats, StoreError>;

    /// Every achievement definition (validator support).
    async fn list_achievements(&self) -> Result<Vec<Achievement>, StoreError>;

    /// Every (user, achievement) grant row (validator support).
    async fn list_user_achievements(&self) -> Result<Vec<UserAchievement>, StoreError>;
}
