// Cache service port and the closed set of cache domains

use crate::error::CacheError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The derived caches this system invalidates. Closed set; key strings are
/// always prefixed with the domain name.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CacheDomain {
    /// Per-user granted-achievement lists.
    UserAchievements,

    /// Per-(user, achievement) progress entries.
    UserProgress,

    /// The rendered achievement/category listing.
    AchievementList,

    /// Global counters (leaderboard headers, totals).
    GlobalStats,
}

impl CacheDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheDomain::UserAchievements => "user_achievements",
            CacheDomain::UserProgress => "user_progress",
            CacheDomain::AchievementList => "achievement_list",
            CacheDomain::GlobalStats => "global_stats",
        }
    }
}

impl fmt::Display for CacheDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot reported by the cache backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHealth {
    pub available: bool,
    pub detail: Option<String>,
}

#[async_trait]
pub trait CacheService: Send + Sync {
    /// Evict one key from one cache domain.
    async fn invalidate(&self, cache_type: &str, key: &str) -> Result<(), CacheError>;

    /// Evict a batch of keys. Backends without native batching inherit the
    /// per-key fallback; the coordinator always calls this entry point.
    async fn invalidate_batch(&self, cache_type: &str, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.invalidate(cache_type, key).await?;
        }
        Ok(())
    }

    async fn get_health(&self) -> Result<CacheHealth, CacheError>;
}
