// Achievement Domain Model - identifiers and records shared by every component
//
// INVARIANTS:
// 1. Ids are plain numeric newtypes; ordering on UserId is the lock-ordering
//    basis for deadlock avoidance in the coordination layer
// 2. Records are passive data - all mutation goes through the store port
// 3. Metadata is a fixed struct plus one explicit extension map, never a
//    free-form bag

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Uniquely identifies a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct UserId(pub u64);

impl UserId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniquely identifies an achievement definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct AchievementId(pub u64);

impl AchievementId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AchievementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uniquely identifies an achievement category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct CategoryId(pub u64);

impl CategoryId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Achievement category definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementCategory {
    pub id: CategoryId,
    pub name: String,
    pub description: String,
}

/// Completion criteria for an achievement.
///
/// A criteria is well-formed when `target` is a positive number; the
/// integrity validator flags anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AchievementCriteria {
    /// What is being counted (e.g. "messages_sent", "reactions_received").
    pub kind: String,

    /// Progress value at which the achievement is earned.
    pub target: i64,
}

impl AchievementCriteria {
    pub fn new(kind: impl Into<String>, target: i64) -> Self {
        AchievementCriteria {
            kind: kind.into(),
            target,
        }
    }

    /// Positive numeric target present.
    pub fn is_well_formed(&self) -> bool {
        self.target > 0
    }
}

/// Achievement definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Achievement {
    pub id: AchievementId,

    /// Category this achievement belongs to.
    pub category: CategoryId,

    pub name: String,
    pub description: String,

    /// Completion criteria.
    pub criteria: AchievementCriteria,

    /// Hidden achievements are not listed until earned.
    pub hidden: bool,

    /// Score awarded on grant.
    pub points: i64,
}

/// A granted achievement - one row per (user, achievement) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAchievement {
    pub user: UserId,
    pub achievement: AchievementId,

    /// Unix seconds at grant time.
    pub earned_at: u64,

    /// Whether the user was notified of the grant.
    pub notified: bool,
}

/// Progress toward one achievement for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProgress {
    pub user: UserId,
    pub achievement: AchievementId,

    /// Current progress value.
    pub current: i64,

    /// Target copied from the achievement criteria at write time.
    pub target: i64,

    /// True once `current` has reached `target`.
    pub earned: bool,

    /// Unix seconds of the last update.
    pub updated_at: u64,
}

/// Cached global counters maintained by the store.
///
/// The integrity validator cross-checks these against freshly computed
/// totals (5% tolerance by default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalAchievementStats {
    pub total_achievements: u64,
    pub total_grants: u64,
    pub users_with_achievements: u64,
    pub grants_by_category: BTreeMap<CategoryId, u64>,
}

/// Full snapshot of one user's achievement data.
///
/// Captured before a reset so the reset can be compensated (and optionally
/// returned to the caller as a backup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDataBackup {
    pub user: UserId,
    pub achievements: Vec<UserAchievement>,
    pub progress: Vec<UserProgress>,

    /// Unix seconds the snapshot was taken.
    pub taken_at: u64,
}

impl UserDataBackup {
    pub fn is_empty(&self) -> bool {
        self.achievements.is_empty() && self.progress.is_empty()
    }
}

/// Fixed operation metadata plus one explicit extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Who asked for the operation (display name or principal id).
    pub actor: Option<String>,

    /// Human-readable reason (revocations, resets).
    pub reason: Option<String>,

    /// Originating surface ("command", "automation", "import", ...).
    pub source: Option<String>,

    /// Anything that does not fit the fixed fields.
    pub ext: BTreeMap<String, serde_json::Value>,
}

impl OperationMetadata {
    pub fn with_actor(actor: impl Into<String>) -> Self {
        OperationMetadata {
            actor: Some(actor.into()),
            ..Default::default()
        }
    }

    pub fn with_reason(reason: impl Into<String>) -> Self {
        OperationMetadata {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_ordering_matches_numeric_order() {
        let mut ids = vec![UserId(3), UserId(1), UserId(2)];
        ids.sort();
        assert_eq!(ids, vec![UserId(1), UserId(2), UserId(3)]);
    }

    #[test]
    fn test_criteria_well_formedness() {
        assert!(AchievementCriteria::new("messages_sent", 10).is_well_formed());
        assert!(!AchievementCriteria::new("messages_sent", 0).is_well_formed());
        assert!(!AchievementCriteria::new("messages_sent", -5).is_well_formed());
    }

    #[test]
    fn test_backup_roundtrips_through_json() {
        let backup = UserDataBackup {
            user: UserId(7),
            achievements: vec![UserAchievement {
                user: UserId(7),
                achievement: AchievementId(1),
                earned_at: 1700000000,
                notified: true,
            }],
            progress: vec![UserProgress {
                user: UserId(7),
                achievement: AchievementId(2),
                current: 3,
                target: 10,
                earned: false,
                updated_at: 1700000001,
            }],
            taken_at: 1700000002,
        };

        let json = serde_json::to_value(&backup).unwrap();
        let restored: UserDataBackup = serde_json::from_value(json).unwrap();
        assert_eq!(restored, backup);
        assert!(!restored.is_empty());
    }

    #[test]
    fn test_metadata_extension_map() {
        let mut meta = OperationMetadata::with_actor("admin");
        meta.ext
            .insert("ticket".to_string(), serde_json::json!("OPS-1432"));

        assert_eq!(meta.actor.as_deref(), Some("admin"));
        assert_eq!(meta.ext["ticket"], serde_json::json!("OPS-1432"));
    }
}
