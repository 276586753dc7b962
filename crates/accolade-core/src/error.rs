// Error taxonomy - closed tagged unions per concern
//
// Call sites match exhaustively; there is no runtime-type classification.
// Business-rule violations, transport failures, and integrity failures are
// distinct variants so callers can tell "nothing happened" apart from
// "something happened and was compensated".

use crate::model::{AchievementId, CategoryId, UserId};
use thiserror::Error;

/// Failures surfaced by the achievement store port.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("unknown achievement {0}")]
    UnknownAchievement(AchievementId),

    #[error("unknown category {0}")]
    UnknownCategory(CategoryId),

    #[error("store transport failure: {0}")]
    Transport(String),
}

/// Failures surfaced by the cache service port.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache transport failure: {0}")]
    Transport(String),

    #[error("cache backend unavailable")]
    Unavailable,
}

/// Public error type of the transaction coordinator.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Grant requested for an achievement the user already holds.
    /// No mutation occurred; the transaction rolled back without
    /// compensation.
    #[error("user {user} already holds achievement {achievement}")]
    DuplicateGrant {
        user: UserId,
        achievement: AchievementId,
    },

    /// Revoke requested for an achievement the user does not hold.
    #[error("user {user} does not hold achievement {achievement}")]
    AchievementNotHeld {
        user: UserId,
        achievement: AchievementId,
    },

    /// Operation referenced an achievement that does not exist.
    #[error("unknown achievement {0}")]
    UnknownAchievement(AchievementId),

    /// A commit-time integrity check did not pass; the store mutations were
    /// compensated.
    #[error("integrity check '{check}' failed: {detail}")]
    IntegrityFailure { check: String, detail: String },

    /// Basic pre-validation found failing issues; the transaction never
    /// opened.
    #[error("pre-validation failed for user {user}: {failing} failing issue(s)")]
    PreValidationFailed { user: UserId, failing: usize },

    /// Store transport failure. Already-applied operations were compensated.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Cache transport failure during commit (fatal under the default
    /// policy; see CoordinatorConfig).
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The transaction ended FAILED: a compensating action itself errored,
    /// or the handle was used after being consumed. State may be
    /// inconsistent and needs operator attention.
    #[error("transaction {id} aborted: {reason}")]
    TransactionAborted { id: u64, reason: String },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoordinationError {
    /// True for business-rule violations where no store mutation happened.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            CoordinationError::DuplicateGrant { .. }
                | CoordinationError::AchievementNotHeld { .. }
                | CoordinationError::UnknownAchievement(_)
        )
    }
}
