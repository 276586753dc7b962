// Accolade core - achievement domain model and external ports
//
// The coordination layer (accolade-coord) builds on these types. Nothing in
// this crate performs multi-step mutations; it defines WHAT the system of
// record and the cache layer look like, plus an in-memory reference
// implementation of both ports for tests and self-contained embedders.

pub mod cache;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use cache::{CacheDomain, CacheHealth, CacheService};
pub use error::{CacheError, CoordinationError, StoreError};
pub use memory::{InMemoryAchievementStore, InMemoryCacheService};
pub use model::{
    Achievement, AchievementCategory, AchievementCriteria, AchievementId, CategoryId,
    GlobalAchievementStats, OperationMetadata, UserAchievement, UserDataBackup, UserId,
    UserProgress,
};
pub use store::AchievementStore;

/// Seconds since the Unix epoch; clamps to zero if the clock is before it.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
