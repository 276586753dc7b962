// In-memory reference implementation of both ports
//
// Used by the test suites of both crates and by embedders that want a
// self-contained store. Failure injection knobs simulate transport faults
// on specific users/keys so rollback and partial-failure paths can be
// exercised deterministically.

use crate::cache::{CacheHealth, CacheService};
use crate::error::{CacheError, StoreError};
use crate::model::{
    Achievement, AchievementCategory, AchievementId, CategoryId, GlobalAchievementStats,
    UserAchievement, UserId, UserProgress,
};
use crate::store::AchievementStore;
use crate::unix_now;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct StoreInner {
    categories: BTreeMap<CategoryId, AchievementCategory>,
    achievements: BTreeMap<AchievementId, Achievement>,
    user_achievements: BTreeMap<(UserId, AchievementId), UserAchievement>,
    progress: BTreeMap<(UserId, AchievementId), UserProgress>,

    /// When set, returned from get_global_achievement_stats instead of the
    /// freshly computed counters (lets tests skew the cached stats).
    stats_override: Option<GlobalAchievementStats>,

    fail_grants_for: HashSet<UserId>,
    fail_revokes_for: HashSet<UserId>,
    fail_reads_for: HashSet<UserId>,
    fail_achievement_lookups: bool,
}

/// In-memory achievement store. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryAchievementStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryAchievementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_category(&self, category: AchievementCategory) {
        self.inner.lock().categories.insert(category.id, category);
    }

    pub fn insert_achievement(&self, achievement: Achievement) {
        self.inner
            .lock()
            .achievements
            .insert(achievement.id, achievement);
    }

    /// Seed a raw grant row, bypassing the existence checks `grant` makes.
    /// Intended for tests that need referentially broken data.
    pub fn seed_user_achievement(&self, row: UserAchievement) {
        self.inner
            .lock()
            .user_achievements
            .insert((row.user, row.achievement), row);
    }

    /// Seed a raw progress row (see `seed_user_achievement`).
    pub fn seed_progress(&self, row: UserProgress) {
        self.inner
            .lock()
            .progress
            .insert((row.user, row.achievement), row);
    }

    /// Make future grant calls for this user fail with a transport error.
    pub fn fail_grants_for(&self, user: UserId) {
        self.inner.lock().fail_grants_for.insert(user);
    }

    /// Make future revoke calls for this user fail with a transport error.
    pub fn fail_revokes_for(&self, user: UserId) {
        self.inner.lock().fail_revokes_for.insert(user);
    }

    /// Make future achievement/progress reads for this user fail.
    pub fn fail_reads_for(&self, user: UserId) {
        self.inner.lock().fail_reads_for.insert(user);
    }

    /// Make future achievement definition lookups fail with a transport
    /// error.
    pub fn fail_achievement_lookups(&self) {
        self.inner.lock().fail_achievement_lookups = true;
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.fail_grants_for.clear();
        inner.fail_revokes_for.clear();
        inner.fail_reads_for.clear();
        inner.fail_achievement_lookups = false;
    }

    /// Skew the cached global counters (aggregate-consistency rule tests).
    pub fn override_stats(&self, stats: GlobalAchievementStats) {
        self.inner.lock().stats_override = Some(stats);
    }

    pub fn achievement_count_for(&self, user: UserId) -> usize {
        let inner = self.inner.lock();
        inner
            .user_achievements
            .keys()
            .filter(|(u, _)| *u == user)
            .count()
    }

    pub fn progress_count_for(&self, user: UserId) -> usize {
        let inner = self.inner.lock();
        inner.progress.keys().filter(|(u, _)| *u == user).count()
    }

    fn compute_stats(inner: &StoreInner) -> GlobalAchievementStats {
        let mut grants_by_category: BTreeMap<CategoryId, u64> = BTreeMap::new();
        for (_, achievement) in &inner.user_achievements {
            if let Some(def) = inner.achievements.get(&achievement.achievement) {
                *grants_by_category.entry(def.category).or_insert(0) += 1;
            }
        }

        let users: HashSet<UserId> = inner.user_achievements.keys().map(|(u, _)| *u).collect();

        GlobalAchievementStats {
            total_achievements: inner.achievements.len() as u64,
            total_grants: inner.user_achievements.len() as u64,
            users_with_achievements: users.len() as u64,
            grants_by_category,
        }
    }
}

#[async_trait]
impl AchievementStore for InMemoryAchievementStore {
    async fn get_user_achievements(
        &self,
        user: UserId,
    ) -> Result<Vec<UserAchievement>, StoreError> {
        let inner = self.inner.lock();
        if inner.fail_reads_for.contains(&user) {
            return Err(StoreError::Transport(format!(
                "injected read failure for user {user}"
            )));
        }
        Ok(inner
            .user_achievements
            .range((user, AchievementId(0))..=(user, AchievementId(u64::MAX)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn get_achievement(&self, id: AchievementId) -> Result<Option<Achievement>, StoreError> {
        let inner = self.inner.lock();
        if inner.fail_achievement_lookups {
            return Err(StoreError::Transport(
                "injected definition lookup failure".to_string(),
            ));
        }
        Ok(inner.achievements.get(&id).cloned())
    }

    async fn get_category(
        &self,
        id: CategoryId,
    ) -> Result<Option<AchievementCategory>, StoreError> {
        Ok(self.inner.lock().categories.get(&id).cloned())
    }

    async fn grant_user_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
        notify: bool,
    ) -> Result<UserAchievement, StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_grants_for.contains(&user) {
            return Err(StoreError::Transport(format!(
                "injected grant failure for user {user}"
            )));
        }
        if !inner.achievements.contains_key(&achievement) {
            return Err(StoreError::UnknownAchievement(achievement));
        }

        let row = UserAchievement {
            user,
            achievement,
            earned_at: unix_now(),
            notified: notify,
        };
        inner.user_achievements.insert((user, achievement), row.clone());

        // Keep the progress row's earned flag in line with the grant.
        if let Some(progress) = inner.progress.get_mut(&(user, achievement)) {
            progress.earned = true;
        }

        Ok(row)
    }

    async fn revoke_user_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.fail_revokes_for.contains(&user) {
            return Err(StoreError::Transport(format!(
                "injected revoke failure for user {user}"
            )));
        }
        Ok(inner.user_achievements.remove(&(user, achievement)).is_some())
    }

    async fn get_user_progress(&self, user: UserId) -> Result<Vec<UserProgress>, StoreError> {
        let inner = self.inner.lock();
        if inner.fail_reads_for.contains(&user) {
            return Err(StoreError::Transport(format!(
                "injected read failure for user {user}"
            )));
        }
        Ok(inner
            .progress
            .range((user, AchievementId(0))..=(user, AchievementId(u64::MAX)))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn get_user_progress_for_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
    ) -> Result<Option<UserProgress>, StoreError> {
        Ok(self.inner.lock().progress.get(&(user, achievement)).cloned())
    }

    async fn update_user_progress(
        &self,
        user: UserId,
        achievement: AchievementId,
        new_value: i64,
    ) -> Result<UserProgress, StoreError> {
        let mut inner = self.inner.lock();
        let target = inner
            .achievements
            .get(&achievement)
            .ok_or(StoreError::UnknownAchievement(achievement))?
            .criteria
            .target;

        let row = UserProgress {
            user,
            achievement,
            current: new_value,
            target,
            earned: new_value >= target,
            updated_at: unix_now(),
        };
        inner.progress.insert((user, achievement), row.clone());
        Ok(row)
    }

    async fn reset_user_data(&self, user: UserId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.user_achievements.retain(|(u, _), _| *u != user);
        inner.progress.retain(|(u, _), _| *u != user);
        Ok(())
    }

    async fn get_global_achievement_stats(&self) -> Result<GlobalAchievementStats, StoreError> {
        let inner = self.inner.lock();
        if let Some(stats) = &inner.stats_override {
            return Ok(stats.clone());
        }
        Ok(Self::compute_stats(&inner))
    }

    async fn list_achievements(&self) -> Result<Vec<Achievement>, StoreError> {
        Ok(self.inner.lock().achievements.values().cloned().collect())
    }

    async fn list_user_achievements(&self) -> Result<Vec<UserAchievement>, StoreError> {
        Ok(self
            .inner
            .lock()
            .user_achievements
            .values()
            .cloned()
            .collect())
    }
}

/// One recorded invalidation call (single-key calls record one-element key
/// lists).
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationCall {
    pub cache_type: String,
    pub keys: Vec<String>,
}

#[derive(Default)]
struct CacheInner {
    calls: Vec<InvalidationCall>,
    fail_keys: HashSet<String>,
    fail_all: bool,
    available: bool,
}

/// In-memory cache service that records every invalidation call. Clones
/// share state.
#[derive(Clone)]
pub struct InMemoryCacheService {
    inner: Arc<Mutex<CacheInner>>,
}

impl Default for InMemoryCacheService {
    fn default() -> Self {
        InMemoryCacheService {
            inner: Arc::new(Mutex::new(CacheInner {
                calls: Vec::new(),
                fail_keys: HashSet::new(),
                fail_all: false,
                available: true,
            })),
        }
    }
}

impl InMemoryCacheService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make any call touching this exact key fail with a transport error.
    pub fn fail_on_key(&self, key: impl Into<String>) {
        self.inner.lock().fail_keys.insert(key.into());
    }

    /// Make every invalidation call fail.
    pub fn fail_all(&self) {
        self.inner.lock().fail_all = true;
    }

    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.fail_keys.clear();
        inner.fail_all = false;
    }

    pub fn calls(&self) -> Vec<InvalidationCall> {
        self.inner.lock().calls.clone()
    }

    /// Every key invalidated so far, with its domain prefix intact.
    pub fn invalidated_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .flat_map(|call| call.keys.iter().cloned())
            .collect()
    }

    fn check_failure(inner: &CacheInner, keys: &[String]) -> Result<(), CacheError> {
        if inner.fail_all {
            return Err(CacheError::Transport("injected cache failure".to_string()));
        }
        for key in keys {
            if inner.fail_keys.contains(key) {
                return Err(CacheError::Transport(format!(
                    "injected cache failure for key {key}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheService for InMemoryCacheService {
    async fn invalidate(&self, cache_type: &str, key: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let keys = vec![key.to_string()];
        Self::check_failure(&inner, &keys)?;
        inner.calls.push(InvalidationCall {
            cache_type: cache_type.to_string(),
            keys,
        });
        Ok(())
    }

    async fn invalidate_batch(&self, cache_type: &str, keys: &[String]) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, keys)?;
        inner.calls.push(InvalidationCall {
            cache_type: cache_type.to_string(),
            keys: keys.to_vec(),
        });
        Ok(())
    }

    async fn get_health(&self) -> Result<CacheHealth, CacheError> {
        let inner = self.inner.lock();
        Ok(CacheHealth {
            available: inner.available,
            detail: if inner.available {
                None
            } else {
                Some("marked unavailable".to_string())
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AchievementCriteria;

    fn seeded_store() -> InMemoryAchievementStore {
        let store = InMemoryAchievementStore::new();
        store.insert_category(AchievementCategory {
            id: CategoryId(1),
            name: "Social".to_string(),
            description: "Community participation".to_string(),
        });
        store.insert_achievement(Achievement {
            id: AchievementId(1),
            category: CategoryId(1),
            name: "First Post".to_string(),
            description: "Send your first message".to_string(),
            criteria: AchievementCriteria::new("messages_sent", 1),
            hidden: false,
            points: 10,
        });
        store.insert_achievement(Achievement {
            id: AchievementId(2),
            category: CategoryId(1),
            name: "Chatterbox".to_string(),
            description: "Send 100 messages".to_string(),
            criteria: AchievementCriteria::new("messages_sent", 100),
            hidden: false,
            points: 50,
        });
        store
    }

    #[tokio::test]
    async fn test_grant_and_revoke_roundtrip() {
        let store = seeded_store();
        let user = UserId(1);

        store
            .grant_user_achievement(user, AchievementId(1), true)
            .await
            .unwrap();
        assert_eq!(store.achievement_count_for(user), 1);

        let removed = store
            .revoke_user_achievement(user, AchievementId(1))
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(store.achievement_count_for(user), 0);

        let removed_again = store
            .revoke_user_achievement(user, AchievementId(1))
            .await
            .unwrap();
        assert!(!removed_again);
    }

    #[tokio::test]
    async fn test_grant_unknown_achievement_is_rejected() {
        let store = seeded_store();
        let result = store
            .grant_user_achievement(UserId(1), AchievementId(999), false)
            .await;
        assert!(matches!(result, Err(StoreError::UnknownAchievement(_))));
    }

    #[tokio::test]
    async fn test_progress_update_tracks_earned_flag() {
        let store = seeded_store();
        let user = UserId(1);

        let row = store
            .update_user_progress(user, AchievementId(2), 50)
            .await
            .unwrap();
        assert!(!row.earned);
        assert_eq!(row.target, 100);

        let row = store
            .update_user_progress(user, AchievementId(2), 100)
            .await
            .unwrap();
        assert!(row.earned);
    }

    #[tokio::test]
    async fn test_reset_clears_only_that_user() {
        let store = seeded_store();
        store
            .grant_user_achievement(UserId(1), AchievementId(1), false)
            .await
            .unwrap();
        store
            .grant_user_achievement(UserId(2), AchievementId(1), false)
            .await
            .unwrap();
        store
            .update_user_progress(UserId(1), AchievementId(2), 10)
            .await
            .unwrap();

        store.reset_user_data(UserId(1)).await.unwrap();

        assert_eq!(store.achievement_count_for(UserId(1)), 0);
        assert_eq!(store.progress_count_for(UserId(1)), 0);
        assert_eq!(store.achievement_count_for(UserId(2)), 1);
    }

    #[tokio::test]
    async fn test_global_stats_computed_and_overridable() {
        let store = seeded_store();
        store
            .grant_user_achievement(UserId(1), AchievementId(1), false)
            .await
            .unwrap();
        store
            .grant_user_achievement(UserId(2), AchievementId(1), false)
            .await
            .unwrap();

        let stats = store.get_global_achievement_stats().await.unwrap();
        assert_eq!(stats.total_achievements, 2);
        assert_eq!(stats.total_grants, 2);
        assert_eq!(stats.users_with_achievements, 2);
        assert_eq!(stats.grants_by_category[&CategoryId(1)], 2);

        let skewed = GlobalAchievementStats {
            total_grants: 99,
            ..stats.clone()
        };
        store.override_stats(skewed.clone());
        let cached = store.get_global_achievement_stats().await.unwrap();
        assert_eq!(cached, skewed);
    }

    #[tokio::test]
    async fn test_injected_grant_failure() {
        let store = seeded_store();
        store.fail_grants_for(UserId(2));

        assert!(store
            .grant_user_achievement(UserId(1), AchievementId(1), false)
            .await
            .is_ok());
        assert!(matches!(
            store
                .grant_user_achievement(UserId(2), AchievementId(1), false)
                .await,
            Err(StoreError::Transport(_))
        ));

        store.clear_failures();
        assert!(store
            .grant_user_achievement(UserId(2), AchievementId(1), false)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cache_records_calls_and_injects_failures() {
        let cache = InMemoryCacheService::new();
        cache.invalidate("user_achievements", "user_achievements:1").await.unwrap();
        cache
            .invalidate_batch(
                "global_stats",
                &["global_stats:*".to_string()],
            )
            .await
            .unwrap();

        let calls = cache.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cache_type, "user_achievements");

        cache.fail_on_key("global_stats:*");
        assert!(cache
            .invalidate("global_stats", "global_stats:*")
            .await
            .is_err());
        // A failed call records nothing.
        assert_eq!(cache.calls().len(), 2);
    }
}
