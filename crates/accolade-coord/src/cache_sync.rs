// Cache Sync Manager - event-driven invalidation planning and execution
//
// SAFETY INVARIANTS:
// 1. The impact table is the single source of key footprints; every key an
//    event produces comes from expanding a table template
// 2. Key lists are sorted and deduplicated per domain before execution
// 3. A failing chunk is logged and counted, never fatal, and does not stop
//    later chunks (post-commit refresh is advisory)
// 4. Batch size never exceeds the configured ceiling and collapses to 1 for
//    single-user events

use accolade_core::cache::{CacheDomain, CacheService};
use accolade_core::model::{AchievementId, CategoryId, OperationMetadata, UserId};
use accolade_core::unix_now;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Domain events that dirty derived caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheEventType {
    AchievementGranted,
    AchievementRevoked,
    ProgressUpdated,
    UserDataReset,
    BulkOperation,
    AchievementUpdated,
    CategoryUpdated,
}

impl CacheEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheEventType::AchievementGranted => "achievement_granted",
            CacheEventType::AchievementRevoked => "achievement_revoked",
            CacheEventType::ProgressUpdated => "progress_updated",
            CacheEventType::UserDataReset => "user_data_reset",
            CacheEventType::BulkOperation => "bulk_operation",
            CacheEventType::AchievementUpdated => "achievement_updated",
            CacheEventType::CategoryUpdated => "category_updated",
        }
    }
}

/// One cache-dirtying occurrence, carrying every axis the templates can
/// expand over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEvent {
    pub id: u64,
    pub event_type: CacheEventType,
    pub users: Vec<UserId>,
    pub achievements: Vec<AchievementId>,
    pub categories: Vec<CategoryId>,
    pub meta: OperationMetadata,
    pub occurred_at: u64,
}

impl CacheEvent {
    pub fn new(event_type: CacheEventType) -> Self {
        CacheEvent {
            id: 0,
            event_type,
            users: Vec::new(),
            achievements: Vec::new(),
            categories: Vec::new(),
            meta: OperationMetadata::default(),
            occurred_at: unix_now(),
        }
    }

    pub fn with_users(mut self, users: Vec<UserId>) -> Self {
        self.users = users;
        self
    }

    pub fn with_achievements(mut self, achievements: Vec<AchievementId>) -> Self {
        self.achievements = achievements;
        self
    }

    pub fn with_categories(mut self, categories: Vec<CategoryId>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_meta(mut self, meta: OperationMetadata) -> Self {
        self.meta = meta;
        self
    }
}

/// Static mapping from an event type to one domain's key templates.
///
/// Placeholders: `{user_id}`, `{achievement_id}`, `{category_id}`. A
/// template expands over the cross product of the axes it names; an event
/// with an empty required axis contributes no keys for that template.
struct ImpactRule {
    event_type: CacheEventType,
    domain: CacheDomain,
    templates: &'static [&'static str],
    priority: u8,
    batch_friendly: bool,
}

const IMPACT_TABLE: &[ImpactRule] = &[
    ImpactRule {
        event_type: CacheEventType::AchievementGranted,
        domain: CacheDomain::UserAchievements,
        templates: &["user_achievements:{user_id}"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::AchievementGranted,
        domain: CacheDomain::GlobalStats,
        templates: &["global_stats:*"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::AchievementRevoked,
        domain: CacheDomain::UserAchievements,
        templates: &["user_achievements:{user_id}"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::AchievementRevoked,
        domain: CacheDomain::GlobalStats,
        templates: &["global_stats:*"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::ProgressUpdated,
        domain: CacheDomain::UserProgress,
        templates: &["user_progress:{user_id}:{achievement_id}"],
        priority: 2,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::UserDataReset,
        domain: CacheDomain::UserAchievements,
        templates: &["user_achievements:{user_id}"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::UserDataReset,
        domain: CacheDomain::UserProgress,
        templates: &["user_progress:{user_id}:*"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::UserDataReset,
        domain: CacheDomain::GlobalStats,
        templates: &["global_stats:*"],
        priority: 1,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::BulkOperation,
        domain: CacheDomain::UserAchievements,
        templates: &["user_achievements:{user_id}"],
        priority: 1,
        batch_friendly: true,
    },
    ImpactRule {
        event_type: CacheEventType::BulkOperation,
        domain: CacheDomain::GlobalStats,
        templates: &["global_stats:*"],
        priority: 1,
        batch_friendly: true,
    },
    ImpactRule {
        event_type: CacheEventType::AchievementUpdated,
        domain: CacheDomain::AchievementList,
        templates: &["achievement_list:*"],
        priority: 3,
        batch_friendly: false,
    },
    ImpactRule {
        event_type: CacheEventType::CategoryUpdated,
        domain: CacheDomain::AchievementList,
        templates: &["achievement_list:*"],
        priority: 3,
        batch_friendly: false,
    },
];

/// Expand one template over the event's axes. Axes the template does not
/// name iterate exactly once.
fn expand_template(template: &str, event: &CacheEvent) -> Vec<String> {
    let needs_user = template.contains("{user_id}");
    let needs_achievement = template.contains("{achievement_id}");
    let needs_category = template.contains("{category_id}");

    let users: Vec<Option<UserId>> = if needs_user {
        event.users.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };
    let achievements: Vec<Option<AchievementId>> = if needs_achievement {
        event.achievements.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };
    let categories: Vec<Option<CategoryId>> = if needs_category {
        event.categories.iter().copied().map(Some).collect()
    } else {
        vec![None]
    };

    let mut keys = Vec::new();
    for user in &users {
        for achievement in &achievements {
            for category in &categories {
                let mut key = template.to_string();
                if let Some(user) = user {
                    key = key.replace("{user_id}", &user.as_u64().to_string());
                }
                if let Some(achievement) = achievement {
                    key = key.replace("{achievement_id}", &achievement.as_u64().to_string());
                }
                if let Some(category) = category {
                    key = key.replace("{category_id}", &category.as_u64().to_string());
                }
                keys.push(key);
            }
        }
    }
    keys
}

/// What an event will invalidate, before anything touches the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidationPlan {
    pub event_id: u64,
    pub event_type: CacheEventType,
    pub keys_by_domain: BTreeMap<CacheDomain, Vec<String>>,
    pub estimated_keys: usize,
    /// Lowest (most urgent) priority among the matched rules.
    pub priority: u8,
    pub batch_size: usize,
}

/// Execution summary for one plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSyncOutcome {
    pub event_id: u64,
    pub keys_invalidated: usize,
    pub failed_chunks: usize,
}

/// Counter snapshot for stats reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSyncStats {
    pub events_processed: u64,
    pub keys_invalidated: u64,
    pub failed_chunks: u64,
}

/// Translates domain events into cache key footprints and executes them in
/// bounded batches.
pub struct CacheSyncManager {
    cache: Arc<dyn CacheService>,
    default_batch: usize,
    next_event_id: AtomicU64,

    events_processed: AtomicU64,
    keys_invalidated: AtomicU64,
    failed_chunks: AtomicU64,
}

impl CacheSyncManager {
    pub fn new(cache: Arc<dyn CacheService>, default_batch: usize) -> Self {
        CacheSyncManager {
            cache,
            default_batch: default_batch.max(1),
            next_event_id: AtomicU64::new(1),
            events_processed: AtomicU64::new(0),
            keys_invalidated: AtomicU64::new(0),
            failed_chunks: AtomicU64::new(0),
        }
    }

    /// Build the footprint for an event from the impact table. Pure; no
    /// cache traffic.
    pub fn plan(&self, event: &CacheEvent) -> CacheInvalidationPlan {
        let mut keys_by_domain: BTreeMap<CacheDomain, Vec<String>> = BTreeMap::new();
        let mut priority = u8::MAX;
        let mut batch_friendly = false;

        for rule in IMPACT_TABLE {
            if rule.event_type != event.event_type {
                continue;
            }
            priority = priority.min(rule.priority);
            batch_friendly |= rule.batch_friendly;
            let bucket = keys_by_domain.entry(rule.domain).or_default();
            for template in rule.templates {
                bucket.extend(expand_template(template, event));
            }
        }

        keys_by_domain.retain(|_, keys| {
            keys.sort();
            keys.dedup();
            !keys.is_empty()
        });

        let estimated_keys = keys_by_domain.values().map(Vec::len).sum();
        let batch_size = if batch_friendly && event.users.len() > 1 {
            self.default_batch.min(event.users.len())
        } else {
            1
        };

        CacheInvalidationPlan {
            event_id: event.id,
            event_type: event.event_type,
            keys_by_domain,
            estimated_keys,
            priority: if priority == u8::MAX { 0 } else { priority },
            batch_size,
        }
    }

    /// Run a plan: per domain, invalidate keys in `batch_size` chunks. A
    /// failing chunk is warned and counted; remaining chunks still run.
    pub async fn execute(&self, plan: &CacheInvalidationPlan) -> CacheSyncOutcome {
        let mut outcome = CacheSyncOutcome {
            event_id: plan.event_id,
            ..CacheSyncOutcome::default()
        };

        for (domain, keys) in &plan.keys_by_domain {
            for chunk in keys.chunks(plan.batch_size.max(1)) {
                match self.cache.invalidate_batch(domain.as_str(), chunk).await {
                    Ok(()) => outcome.keys_invalidated += chunk.len(),
                    Err(cache_err) => {
                        outcome.failed_chunks += 1;
                        warn!(
                            "cache sync event {} failed a {}-key chunk on {domain}: {cache_err}",
                            plan.event_id,
                            chunk.len()
                        );
                    }
                }
            }
        }

        self.keys_invalidated
            .fetch_add(outcome.keys_invalidated as u64, Ordering::Relaxed);
        self.failed_chunks
            .fetch_add(outcome.failed_chunks as u64, Ordering::Relaxed);
        outcome
    }

    /// Plan and execute in one step. Returns the plan alongside the
    /// execution summary.
    pub async fn process_event(
        &self,
        mut event: CacheEvent,
    ) -> (CacheInvalidationPlan, CacheSyncOutcome) {
        event.id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let plan = self.plan(&event);
        debug!(
            "cache sync event {} ({}) plans {} key(s) across {} domain(s)",
            event.id,
            event.event_type.as_str(),
            plan.estimated_keys,
            plan.keys_by_domain.len()
        );
        let outcome = self.execute(&plan).await;
        self.events_processed.fetch_add(1, Ordering::Relaxed);
        (plan, outcome)
    }

    /// Flush everything derived from one user's data.
    pub async fn invalidate_user_cache(&self, user: UserId) -> CacheSyncOutcome {
        let event = CacheEvent::new(CacheEventType::UserDataReset).with_users(vec![user]);
        self.process_event(event).await.1
    }

    /// Flush listing caches after an achievement definition change.
    pub async fn invalidate_achievement_cache(
        &self,
        achievement: AchievementId,
    ) -> CacheSyncOutcome {
        let event = CacheEvent::new(CacheEventType::AchievementUpdated)
            .with_achievements(vec![achievement]);
        self.process_event(event).await.1
    }

    /// Flush per-user caches for a batch of users in one event.
    pub async fn invalidate_bulk_user_cache(&self, users: Vec<UserId>) -> CacheSyncOutcome {
        let event = CacheEvent::new(CacheEventType::BulkOperation).with_users(users);
        self.process_event(event).await.1
    }

    /// The underlying cache port (health probes).
    pub fn cache(&self) -> &Arc<dyn CacheService> {
        &self.cache
    }

    pub fn stats(&self) -> CacheSyncStats {
        CacheSyncStats {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            keys_invalidated: self.keys_invalidated.load(Ordering::Relaxed),
            failed_chunks: self.failed_chunks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accolade_core::memory::InMemoryCacheService;
    use proptest::prelude::*;

    fn manager(cache: &InMemoryCacheService) -> CacheSyncManager {
        CacheSyncManager::new(Arc::new(cache.clone()), 50)
    }

    #[tokio::test]
    async fn test_grant_event_footprint_is_exact() {
        let cache = InMemoryCacheService::new();
        let mgr = manager(&cache);

        let event = CacheEvent::new(CacheEventType::AchievementGranted)
            .with_users(vec![UserId(42)])
            .with_achievements(vec![AchievementId(7)]);
        let (plan, outcome) = mgr.process_event(event).await;

        assert_eq!(plan.estimated_keys, 2);
        assert_eq!(
            plan.keys_by_domain.get(&CacheDomain::UserAchievements),
            Some(&vec!["user_achievements:42".to_string()])
        );
        assert_eq!(
            plan.keys_by_domain.get(&CacheDomain::GlobalStats),
            Some(&vec!["global_stats:*".to_string()])
        );
        assert_eq!(outcome.keys_invalidated, 2);
        assert_eq!(outcome.failed_chunks, 0);

        let mut keys = cache.invalidated_keys();
        keys.sort();
        assert_eq!(keys, vec!["global_stats:*", "user_achievements:42"]);
    }

    #[tokio::test]
    async fn test_reset_event_covers_three_domains() {
        let cache = InMemoryCacheService::new();
        let mgr = manager(&cache);

        let outcome = mgr.invalidate_user_cache(UserId(5)).await;
        assert_eq!(outcome.keys_invalidated, 3);

        let mut keys = cache.invalidated_keys();
        keys.sort();
        assert_eq!(
            keys,
            vec!["global_stats:*", "user_achievements:5", "user_progress:5:*"]
        );
    }

    #[tokio::test]
    async fn test_progress_event_expands_user_achievement_pairs() {
        let cache = InMemoryCacheService::new();
        let mgr = manager(&cache);

        let event = CacheEvent::new(CacheEventType::ProgressUpdated)
            .with_users(vec![UserId(1)])
            .with_achievements(vec![AchievementId(10), AchievementId(11)]);
        let (plan, _) = mgr.process_event(event).await;

        assert_eq!(
            plan.keys_by_domain.get(&CacheDomain::UserProgress),
            Some(&vec![
                "user_progress:1:10".to_string(),
                "user_progress:1:11".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_bulk_event_batches_and_single_user_does_not() {
        let cache = InMemoryCacheService::new();
        let mgr = CacheSyncManager::new(Arc::new(cache.clone()), 2);

        let bulk = CacheEvent::new(CacheEventType::BulkOperation)
            .with_users(vec![UserId(1), UserId(2), UserId(3)]);
        let plan = mgr.plan(&bulk);
        assert_eq!(plan.batch_size, 2);

        let single = CacheEvent::new(CacheEventType::BulkOperation).with_users(vec![UserId(1)]);
        assert_eq!(mgr.plan(&single).batch_size, 1);

        let outcome = mgr.execute(&plan).await;
        assert_eq!(outcome.keys_invalidated, 4);
        // user_achievements chunked [1,2] + [3], global_stats one chunk.
        assert_eq!(cache.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_counted_not_fatal() {
        let cache = InMemoryCacheService::new();
        cache.fail_on_key("user_achievements:2");
        let mgr = manager(&cache);

        let outcome = mgr
            .invalidate_bulk_user_cache(vec![UserId(1), UserId(2), UserId(3)])
            .await;
        // batch_size = min(50, 3) = 3, so the whole user_achievements chunk
        // fails while global_stats still flushes.
        assert_eq!(outcome.failed_chunks, 1);
        assert_eq!(outcome.keys_invalidated, 1);
        assert_eq!(mgr.stats().failed_chunks, 1);
    }

    #[tokio::test]
    async fn test_event_with_no_users_produces_no_user_keys() {
        let cache = InMemoryCacheService::new();
        let mgr = manager(&cache);

        let event = CacheEvent::new(CacheEventType::AchievementGranted);
        let plan = mgr.plan(&event);
        assert!(!plan.keys_by_domain.contains_key(&CacheDomain::UserAchievements));
        assert_eq!(
            plan.keys_by_domain.get(&CacheDomain::GlobalStats),
            Some(&vec!["global_stats:*".to_string()])
        );
    }

    proptest! {
        #[test]
        fn prop_expansion_covers_every_user_exactly_once(
            mut ids in proptest::collection::vec(0u64..10_000, 1..40)
        ) {
            ids.sort();
            ids.dedup();
            let users: Vec<UserId> = ids.iter().copied().map(UserId).collect();
            let event = CacheEvent::new(CacheEventType::BulkOperation)
                .with_users(users.clone());

            let keys = expand_template("user_achievements:{user_id}", &event);
            prop_assert_eq!(keys.len(), users.len());
            for (key, user) in keys.iter().zip(&users) {
                let expected = format!("user_achievements:{}", user.as_u64());
                prop_assert_eq!(key.as_str(), expected.as_str());
            }
        }

        #[test]
        fn prop_plan_keys_carry_domain_prefix(
            ids in proptest::collection::vec(0u64..1_000, 0..20)
        ) {
            let users: Vec<UserId> = ids.iter().copied().map(UserId).collect();
            let cache = InMemoryCacheService::new();
            let mgr = CacheSyncManager::new(Arc::new(cache), 50);
            let event = CacheEvent::new(CacheEventType::UserDataReset).with_users(users);
            let plan = mgr.plan(&event);
            for (domain, keys) in &plan.keys_by_domain {
                for key in keys {
                    prop_assert!(key.starts_with(domain.as_str()));
                }
            }
        }
    }
}
