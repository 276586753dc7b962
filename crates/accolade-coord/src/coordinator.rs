// Transaction Coordinator - the public entry points for coordinated
// achievement operations
//
// SAFETY INVARIANTS:
// 1. Every coordinated operation runs inside exactly one transaction; the
//    handle is consumed by exactly one commit or rollback on every path
// 2. A failed commit always rolls back before the error reaches the caller
// 3. Business-rule rejections (duplicate grant, not held, unknown
//    achievement) happen before any store mutation
// 4. Bulk item failures are isolated: other items in the batch proceed, and
//    a failed item contributes no operations to compensate
// 5. Post-commit cache sync and post-validation are advisory; they log and
//    count but never fail an already-committed operation

use crate::cache_sync::{
    CacheEvent, CacheEventType, CacheSyncManager, CacheSyncOutcome, CacheSyncStats,
};
use crate::integrity::{
    DataIntegrityValidator, ValidationLevel, ValidationReport, ValidationTarget, ValidatorConfig,
    ValidatorStats,
};
use crate::transaction::{
    Expectation, IntegrityCheckKind, OperationKind, Transaction, TransactionHandle,
    TransactionKind, TransactionManager, TransactionManagerStats,
};
use accolade_core::cache::{CacheDomain, CacheHealth, CacheService};
use accolade_core::error::CoordinationError;
use accolade_core::model::{
    Achievement, AchievementId, OperationMetadata, UserAchievement, UserDataBackup, UserId,
    UserProgress,
};
use accolade_core::store::AchievementStore;
use accolade_core::unix_now;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coordinator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Run a Basic validation of each affected user before opening the
    /// transaction.
    pub pre_validate: bool,

    /// Run a Standard validation after commit (advisory; failures are
    /// logged, the operation still succeeds).
    pub post_validate: bool,

    /// Ceiling on cache invalidation batch size for bulk events.
    pub default_batch: usize,

    /// When true (default), a cache invalidation failure during commit
    /// fails the commit and the store mutations are compensated. When
    /// false the failure is logged and the commit proceeds.
    pub cache_failure_is_fatal: bool,

    /// Tuning for the coordinator-owned validator (stats tolerance,
    /// overshoot factor).
    pub validator: ValidatorConfig,
}

impl CoordinatorConfig {
    pub fn new(
        pre_validate: bool,
        post_validate: bool,
        default_batch: usize,
        cache_failure_is_fatal: bool,
    ) -> Result<Self, CoordinationError> {
        if default_batch == 0 {
            return Err(CoordinationError::InvalidConfig(
                "default_batch must be at least 1".to_string(),
            ));
        }
        Ok(CoordinatorConfig {
            pre_validate,
            post_validate,
            default_batch,
            cache_failure_is_fatal,
            validator: ValidatorConfig::default(),
        })
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            pre_validate: true,
            post_validate: false,
            default_batch: 50,
            cache_failure_is_fatal: true,
            validator: ValidatorConfig::default(),
        }
    }
}

/// Record of one coordinated operation, returned inside every outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatedOperation {
    /// Short content-derived hex id, stable for log correlation.
    pub id: String,

    pub kind: TransactionKind,
    pub users: Vec<UserId>,
    pub achievements: Vec<AchievementId>,
    pub meta: OperationMetadata,

    /// The committed transaction record.
    pub transaction: Transaction,

    /// Post-commit cache sync summary.
    pub cache_sync: Option<CacheSyncOutcome>,

    /// Pre/post validation reports, in execution order.
    pub validation_reports: Vec<ValidationReport>,

    pub started_at: u64,
    pub finished_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrantOutcome {
    pub operation: CoordinatedOperation,
    pub user_achievement: UserAchievement,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub operation: CoordinatedOperation,
    /// The removed grant row.
    pub revoked: UserAchievement,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdjustProgressOutcome {
    pub operation: CoordinatedOperation,
    pub progress: UserProgress,
    pub old_value: i64,
    pub new_value: i64,
    /// True when reaching the target granted the achievement in the same
    /// transaction.
    pub auto_granted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub operation: CoordinatedOperation,
    /// Present when the caller asked to keep the snapshot.
    pub backup: Option<UserDataBackup>,
    pub cleared_achievements: usize,
    pub cleared_progress: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkKind {
    Grant,
    Revoke,
    Reset,
}

impl BulkKind {
    fn transaction_kind(&self) -> TransactionKind {
        match self {
            BulkKind::Grant => TransactionKind::BulkGrant,
            BulkKind::Revoke => TransactionKind::BulkRevoke,
            BulkKind::Reset => TransactionKind::BulkReset,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemResult {
    pub user: UserId,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub operation: CoordinatedOperation,
    pub results: Vec<BulkItemResult>,
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

/// Counter snapshot aggregating all four components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub operations_coordinated: u64,
    pub operations_successful: u64,
    pub operations_failed: u64,
    pub cache_events: u64,
    pub transactions: TransactionManagerStats,
    pub cache_sync: CacheSyncStats,
    pub validator: ValidatorStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub active_transactions: u64,
    pub cache: Option<CacheHealth>,
}

/// Orchestrates the transaction manager, cache sync manager, and integrity
/// validator behind one operation-per-method surface.
pub struct TransactionCoordinator {
    store: Arc<dyn AchievementStore>,
    manager: TransactionManager,
    cache_sync: CacheSyncManager,
    validator: DataIntegrityValidator,
    config: CoordinatorConfig,

    op_seq: AtomicU64,
    coordinated: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cache_events: AtomicU64,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn AchievementStore>, cache: Arc<dyn CacheService>) -> Self {
        Self::with_config(store, cache, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn AchievementStore>,
        cache: Arc<dyn CacheService>,
        config: CoordinatorConfig,
    ) -> Self {
        TransactionCoordinator {
            manager: TransactionManager::with_cache_policy(
                store.clone(),
                cache.clone(),
                config.cache_failure_is_fatal,
            ),
            cache_sync: CacheSyncManager::new(cache, config.default_batch),
            validator: DataIntegrityValidator::with_config(
                store.clone(),
                config.validator.clone(),
            ),
            store,
            config,
            op_seq: AtomicU64::new(1),
            coordinated: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache_events: AtomicU64::new(0),
        }
    }

    fn operation_id(&self, kind: TransactionKind, users: &[UserId]) -> String {
        let seq = self.op_seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        for user in users {
            hasher.update(user.as_u64().to_be_bytes());
        }
        hasher.update(seq.to_be_bytes());
        hasher.update(unix_now().to_be_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Basic pre-validation gate. Business data problems block the
    /// operation before any lock or mutation.
    async fn pre_validate(
        &self,
        user: UserId,
        reports: &mut Vec<ValidationReport>,
    ) -> Result<(), CoordinationError> {
        if !self.config.pre_validate {
            return Ok(());
        }
        let report = self
            .validator
            .validate(ValidationTarget::User(user), ValidationLevel::Basic)
            .await;
        let passed = report.passed();
        let failing = report.failed_count + report.error_count;
        reports.push(report);
        if passed {
            Ok(())
        } else {
            Err(CoordinationError::PreValidationFailed { user, failing })
        }
    }

    /// Advisory post-commit validation. Never fails the operation.
    async fn post_validate(&self, user: UserId, reports: &mut Vec<ValidationReport>) {
        if !self.config.post_validate {
            return;
        }
        let report = self
            .validator
            .validate(ValidationTarget::User(user), ValidationLevel::Standard)
            .await;
        if !report.passed() {
            warn!(
                "post-commit validation of user {user} found {} failure(s)",
                report.failed_count
            );
        }
        reports.push(report);
    }

    /// Resolve an achievement definition before opening a transaction. Both
    /// an unknown id and a transport failure count as a failed operation.
    async fn require_achievement(
        &self,
        achievement: AchievementId,
    ) -> Result<Achievement, CoordinationError> {
        match self.store.get_achievement(achievement).await {
            Ok(Some(definition)) => Ok(definition),
            Ok(None) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(CoordinationError::UnknownAchievement(achievement))
            }
            Err(store_err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(store_err.into())
            }
        }
    }

    /// Roll back and surface the original error, unless the rollback itself
    /// fails, in which case the rollback error takes precedence.
    async fn abort(
        &self,
        handle: TransactionHandle,
        reason: &str,
        error: CoordinationError,
    ) -> CoordinationError {
        self.failed.fetch_add(1, Ordering::Relaxed);
        match self.manager.rollback(handle, reason).await {
            Ok(_) => error,
            Err(rollback_err) => rollback_err,
        }
    }

    async fn sync_after_commit(&self, event: CacheEvent) -> CacheSyncOutcome {
        self.cache_events.fetch_add(1, Ordering::Relaxed);
        self.cache_sync.process_event(event).await.1
    }

    fn finish(
        &self,
        id: String,
        kind: TransactionKind,
        users: Vec<UserId>,
        achievements: Vec<AchievementId>,
        meta: OperationMetadata,
        transaction: Transaction,
        cache_sync: Option<CacheSyncOutcome>,
        validation_reports: Vec<ValidationReport>,
        started_at: u64,
    ) -> CoordinatedOperation {
        self.successful.fetch_add(1, Ordering::Relaxed);
        CoordinatedOperation {
            id,
            kind,
            users,
            achievements,
            meta,
            transaction,
            cache_sync,
            validation_reports,
            started_at,
            finished_at: unix_now(),
        }
    }

    /// Grant an achievement to a user, with duplicate protection, cache
    /// invalidation, and a commit-time count check.
    pub async fn grant_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
        meta: OperationMetadata,
    ) -> Result<GrantOutcome, CoordinationError> {
        self.coordinated.fetch_add(1, Ordering::Relaxed);
        let started_at = unix_now();
        let op_id = self.operation_id(TransactionKind::Grant, &[user]);
        info!("[{op_id}] grant achievement {achievement} to user {user}");

        let mut reports = Vec::new();
        self.pre_validate(user, &mut reports).await.map_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        self.require_achievement(achievement).await?;

        let mut handle = self
            .manager
            .begin(TransactionKind::Grant, &[user], meta.clone())
            .await;

        let prev = match self.store.get_user_achievements(user).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.abort(handle, "pre-grant read failed", e.into()).await),
        };
        if prev.iter().any(|row| row.achievement == achievement) {
            let err = CoordinationError::DuplicateGrant { user, achievement };
            return Err(self.abort(handle, "duplicate grant", err).await);
        }

        let row = match self.store.grant_user_achievement(user, achievement, true).await {
            Ok(row) => row,
            Err(e) => return Err(self.abort(handle, "grant failed", e.into()).await),
        };
        if let Err(e) = self.record_grant(&mut handle, &row, &meta) {
            return Err(self.abort(handle, "bookkeeping failed", e).await);
        }

        let mut expected = BTreeMap::new();
        expected.insert(
            "user_achievement_count".to_string(),
            Expectation::AtLeast(prev.len() as i64 + 1),
        );
        if let Err(e) = self
            .manager
            .record_integrity_check(
                &mut handle,
                IntegrityCheckKind::UserAchievementCount,
                user,
                None,
                expected,
            )
            .await
        {
            return Err(self.abort(handle, "integrity read failed", e).await);
        }

        let transaction = match self.manager.commit(handle).await {
            Ok(tx) => tx,
            Err(failure) => {
                return Err(self.abort(failure.handle, "commit failed", failure.error).await)
            }
        };

        let event = CacheEvent::new(CacheEventType::AchievementGranted)
            .with_users(vec![user])
            .with_achievements(vec![achievement])
            .with_meta(meta.clone());
        let sync = self.sync_after_commit(event).await;
        self.post_validate(user, &mut reports).await;

        Ok(GrantOutcome {
            operation: self.finish(
                op_id,
                TransactionKind::Grant,
                vec![user],
                vec![achievement],
                meta,
                transaction,
                Some(sync),
                reports,
                started_at,
            ),
            user_achievement: row,
        })
    }

    fn record_grant(
        &self,
        handle: &mut TransactionHandle,
        row: &UserAchievement,
        meta: &OperationMetadata,
    ) -> Result<(), CoordinationError> {
        self.manager.record_operation(
            handle,
            OperationKind::Grant,
            row.user,
            Some(row.achievement),
            None,
            Some(serde_json::to_value(row).map_err(bookkeeping_error)?),
            meta.clone(),
        )?;
        self.manager.record_cache_invalidation(
            handle,
            CacheDomain::UserAchievements,
            vec![format!("user_achievements:{}", row.user)],
        )?;
        self.manager.record_cache_invalidation(
            handle,
            CacheDomain::GlobalStats,
            vec!["global_stats:*".to_string()],
        )?;
        Ok(())
    }

    /// Revoke a granted achievement. Rejects revocation of an achievement
    /// the user does not hold.
    pub async fn revoke_achievement(
        &self,
        user: UserId,
        achievement: AchievementId,
        meta: OperationMetadata,
    ) -> Result<RevokeOutcome, CoordinationError> {
        self.coordinated.fetch_add(1, Ordering::Relaxed);
        let started_at = unix_now();
        let op_id = self.operation_id(TransactionKind::Revoke, &[user]);
        info!("[{op_id}] revoke achievement {achievement} from user {user}");

        let mut reports = Vec::new();
        self.pre_validate(user, &mut reports).await.map_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        let mut handle = self
            .manager
            .begin(TransactionKind::Revoke, &[user], meta.clone())
            .await;

        let prev = match self.store.get_user_achievements(user).await {
            Ok(rows) => rows,
            Err(e) => return Err(self.abort(handle, "pre-revoke read failed", e.into()).await),
        };
        let existing = match prev.iter().find(|row| row.achievement == achievement) {
            Some(row) => row.clone(),
            None => {
                let err = CoordinationError::AchievementNotHeld { user, achievement };
                return Err(self.abort(handle, "achievement not held", err).await);
            }
        };

        if let Err(e) = self.store.revoke_user_achievement(user, achievement).await {
            return Err(self.abort(handle, "revoke failed", e.into()).await);
        }
        let recorded = self
            .manager
            .record_operation(
                &mut handle,
                OperationKind::Revoke,
                user,
                Some(achievement),
                serde_json::to_value(&existing).ok(),
                None,
                meta.clone(),
            )
            .and_then(|_| {
                self.manager.record_cache_invalidation(
                    &mut handle,
                    CacheDomain::UserAchievements,
                    vec![format!("user_achievements:{user}")],
                )
            })
            .and_then(|_| {
                self.manager.record_cache_invalidation(
                    &mut handle,
                    CacheDomain::GlobalStats,
                    vec!["global_stats:*".to_string()],
                )
            });
        if let Err(e) = recorded {
            return Err(self.abort(handle, "bookkeeping failed", e).await);
        }

        let mut expected = BTreeMap::new();
        expected.insert(
            "user_achievement_count".to_string(),
            Expectation::AtMost(prev.len() as i64 - 1),
        );
        if let Err(e) = self
            .manager
            .record_integrity_check(
                &mut handle,
                IntegrityCheckKind::UserAchievementCount,
                user,
                None,
                expected,
            )
            .await
        {
            return Err(self.abort(handle, "integrity read failed", e).await);
        }

        let transaction = match self.manager.commit(handle).await {
            Ok(tx) => tx,
            Err(failure) => {
                return Err(self.abort(failure.handle, "commit failed", failure.error).await)
            }
        };

        let event = CacheEvent::new(CacheEventType::AchievementRevoked)
            .with_users(vec![user])
            .with_achievements(vec![achievement])
            .with_meta(meta.clone());
        let sync = self.sync_after_commit(event).await;
        self.post_validate(user, &mut reports).await;

        Ok(RevokeOutcome {
            operation: self.finish(
                op_id,
                TransactionKind::Revoke,
                vec![user],
                vec![achievement],
                meta,
                transaction,
                Some(sync),
                reports,
                started_at,
            ),
            revoked: existing,
        })
    }

    /// Set a user's progress toward an achievement. Negative values clamp
    /// to zero. Reaching the target grants the achievement in the same
    /// transaction when the user does not already hold it.
    pub async fn adjust_progress(
        &self,
        user: UserId,
        achievement: AchievementId,
        new_value: i64,
        meta: OperationMetadata,
    ) -> Result<AdjustProgressOutcome, CoordinationError> {
        self.coordinated.fetch_add(1, Ordering::Relaxed);
        let started_at = unix_now();
        let new_value = new_value.max(0);
        let op_id = self.operation_id(TransactionKind::AdjustProgress, &[user]);
        info!("[{op_id}] set progress {new_value} for user {user} on achievement {achievement}");

        let mut reports = Vec::new();
        self.pre_validate(user, &mut reports).await.map_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        let definition = self.require_achievement(achievement).await?;

        let mut handle = self
            .manager
            .begin(TransactionKind::AdjustProgress, &[user], meta.clone())
            .await;

        let old_value = match self
            .store
            .get_user_progress_for_achievement(user, achievement)
            .await
        {
            Ok(row) => row.map(|r| r.current).unwrap_or(0),
            Err(e) => return Err(self.abort(handle, "pre-adjust read failed", e.into()).await),
        };

        let progress = match self.store.update_user_progress(user, achievement, new_value).await {
            Ok(row) => row,
            Err(e) => return Err(self.abort(handle, "progress update failed", e.into()).await),
        };
        let recorded = self
            .manager
            .record_operation(
                &mut handle,
                OperationKind::AdjustProgress,
                user,
                Some(achievement),
                Some(serde_json::json!(old_value)),
                Some(serde_json::json!(new_value)),
                meta.clone(),
            )
            .and_then(|_| {
                self.manager.record_cache_invalidation(
                    &mut handle,
                    CacheDomain::UserProgress,
                    vec![format!("user_progress:{user}:{achievement}")],
                )
            });
        if let Err(e) = recorded {
            return Err(self.abort(handle, "bookkeeping failed", e).await);
        }

        // Auto-grant when the target is reached and the user does not
        // already hold the achievement.
        let mut auto_granted = false;
        if new_value >= definition.criteria.target {
            let held = match self.store.get_user_achievements(user).await {
                Ok(rows) => rows.iter().any(|row| row.achievement == achievement),
                Err(e) => return Err(self.abort(handle, "held check failed", e.into()).await),
            };
            if !held {
                let row = match self.store.grant_user_achievement(user, achievement, true).await {
                    Ok(row) => row,
                    Err(e) => return Err(self.abort(handle, "auto-grant failed", e.into()).await),
                };
                if let Err(e) = self.record_grant(&mut handle, &row, &meta) {
                    return Err(self.abort(handle, "bookkeeping failed", e).await);
                }
                auto_granted = true;
            }
        }

        let mut expected = BTreeMap::new();
        expected.insert(
            "progress_current".to_string(),
            Expectation::Exact(serde_json::json!(new_value)),
        );
        if let Err(e) = self
            .manager
            .record_integrity_check(
                &mut handle,
                IntegrityCheckKind::UserProgressValue,
                user,
                Some(achievement),
                expected,
            )
            .await
        {
            return Err(self.abort(handle, "integrity read failed", e).await);
        }

        let transaction = match self.manager.commit(handle).await {
            Ok(tx) => tx,
            Err(failure) => {
                return Err(self.abort(failure.handle, "commit failed", failure.error).await)
            }
        };

        let event = CacheEvent::new(CacheEventType::ProgressUpdated)
            .with_users(vec![user])
            .with_achievements(vec![achievement])
            .with_meta(meta.clone());
        let sync = self.sync_after_commit(event).await;
        self.post_validate(user, &mut reports).await;

        Ok(AdjustProgressOutcome {
            operation: self.finish(
                op_id,
                TransactionKind::AdjustProgress,
                vec![user],
                vec![achievement],
                meta,
                transaction,
                Some(sync),
                reports,
                started_at,
            ),
            progress,
            old_value,
            new_value,
            auto_granted,
        })
    }

    /// Clear all of a user's achievement data. The pre-reset snapshot is
    /// always captured for compensation and is returned when
    /// `return_backup` is set.
    pub async fn reset_user_data(
        &self,
        user: UserId,
        return_backup: bool,
        meta: OperationMetadata,
    ) -> Result<ResetOutcome, CoordinationError> {
        self.coordinated.fetch_add(1, Ordering::Relaxed);
        let started_at = unix_now();
        let op_id = self.operation_id(TransactionKind::ResetUserData, &[user]);
        info!("[{op_id}] reset user {user} (return_backup={return_backup})");

        let mut reports = Vec::new();
        self.pre_validate(user, &mut reports).await.map_err(|e| {
            self.failed.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        let mut handle = self
            .manager
            .begin(TransactionKind::ResetUserData, &[user], meta.clone())
            .await;

        let backup = match self.snapshot_user(user).await {
            Ok(backup) => backup,
            Err(e) => return Err(self.abort(handle, "snapshot failed", e).await),
        };
        let cleared_achievements = backup.achievements.len();
        let cleared_progress = backup.progress.len();

        if let Err(e) = self.store.reset_user_data(user).await {
            return Err(self.abort(handle, "reset failed", e.into()).await);
        }
        if let Err(e) = self.record_reset(&mut handle, &backup, &meta) {
            return Err(self.abort(handle, "bookkeeping failed", e).await);
        }

        let mut expected = BTreeMap::new();
        expected.insert(
            "user_achievement_count".to_string(),
            Expectation::Exact(serde_json::json!(0)),
        );
        expected.insert(
            "progress_rows".to_string(),
            Expectation::Exact(serde_json::json!(0)),
        );
        if let Err(e) = self
            .manager
            .record_integrity_check(
                &mut handle,
                IntegrityCheckKind::UserDataCounts,
                user,
                None,
                expected,
            )
            .await
        {
            return Err(self.abort(handle, "integrity read failed", e).await);
        }

        let transaction = match self.manager.commit(handle).await {
            Ok(tx) => tx,
            Err(failure) => {
                return Err(self.abort(failure.handle, "commit failed", failure.error).await)
            }
        };

        let event = CacheEvent::new(CacheEventType::UserDataReset)
            .with_users(vec![user])
            .with_meta(meta.clone());
        let sync = self.sync_after_commit(event).await;
        self.post_validate(user, &mut reports).await;

        Ok(ResetOutcome {
            operation: self.finish(
                op_id,
                TransactionKind::ResetUserData,
                vec![user],
                Vec::new(),
                meta,
                transaction,
                Some(sync),
                reports,
                started_at,
            ),
            backup: return_backup.then_some(backup),
            cleared_achievements,
            cleared_progress,
        })
    }

    async fn snapshot_user(&self, user: UserId) -> Result<UserDataBackup, CoordinationError> {
        Ok(UserDataBackup {
            user,
            achievements: self.store.get_user_achievements(user).await?,
            progress: self.store.get_user_progress(user).await?,
            taken_at: unix_now(),
        })
    }

    fn record_reset(
        &self,
        handle: &mut TransactionHandle,
        backup: &UserDataBackup,
        meta: &OperationMetadata,
    ) -> Result<(), CoordinationError> {
        let user = backup.user;
        self.manager.record_operation(
            handle,
            OperationKind::ResetUserData,
            user,
            None,
            Some(serde_json::to_value(backup).map_err(bookkeeping_error)?),
            None,
            meta.clone(),
        )?;
        self.manager.record_cache_invalidation(
            handle,
            CacheDomain::UserAchievements,
            vec![format!("user_achievements:{user}")],
        )?;
        self.manager.record_cache_invalidation(
            handle,
            CacheDomain::UserProgress,
            vec![format!("user_progress:{user}:*")],
        )?;
        self.manager.record_cache_invalidation(
            handle,
            CacheDomain::GlobalStats,
            vec!["global_stats:*".to_string()],
        )?;
        Ok(())
    }

    /// Run one kind of operation across many users in a single transaction.
    ///
    /// Item failures are isolated: a failing user contributes no operations
    /// and the rest of the batch proceeds. The transaction commits as long
    /// as commit-time invalidation succeeds for the users that did mutate.
    pub async fn bulk_operation(
        &self,
        kind: BulkKind,
        users: &[UserId],
        achievement: Option<AchievementId>,
        meta: OperationMetadata,
    ) -> Result<BulkOutcome, CoordinationError> {
        self.coordinated.fetch_add(1, Ordering::Relaxed);
        let started_at = unix_now();
        let tx_kind = kind.transaction_kind();
        let op_id = self.operation_id(tx_kind, users);
        info!("[{op_id}] bulk {} over {} user(s)", tx_kind.as_str(), users.len());

        if matches!(kind, BulkKind::Grant | BulkKind::Revoke) {
            let achievement =
                achievement.ok_or_else(|| {
                    CoordinationError::InvalidConfig(
                        "bulk grant/revoke requires an achievement id".to_string(),
                    )
                })?;
            self.require_achievement(achievement).await?;
        }

        let mut handle = self.manager.begin(tx_kind, users, meta.clone()).await;

        let mut results = Vec::with_capacity(users.len());
        let mut mutated_users = Vec::new();
        for &user in users {
            let item = self
                .bulk_item(&mut handle, kind, user, achievement, &meta)
                .await;
            match item {
                Ok(()) => {
                    mutated_users.push(user);
                    results.push(BulkItemResult {
                        user,
                        success: true,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("[{op_id}] bulk item for user {user} failed: {e}");
                    results.push(BulkItemResult {
                        user,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if !mutated_users.is_empty() {
            let keys: Vec<String> = mutated_users
                .iter()
                .map(|user| format!("user_achievements:{user}"))
                .collect();
            let recorded = self
                .manager
                .record_cache_invalidation(&mut handle, CacheDomain::UserAchievements, keys)
                .and_then(|_| {
                    if matches!(kind, BulkKind::Reset) {
                        let keys = mutated_users
                            .iter()
                            .map(|user| format!("user_progress:{user}:*"))
                            .collect();
                        self.manager.record_cache_invalidation(
                            &mut handle,
                            CacheDomain::UserProgress,
                            keys,
                        )
                    } else {
                        Ok(())
                    }
                })
                .and_then(|_| {
                    self.manager.record_cache_invalidation(
                        &mut handle,
                        CacheDomain::GlobalStats,
                        vec!["global_stats:*".to_string()],
                    )
                });
            if let Err(e) = recorded {
                return Err(self.abort(handle, "bookkeeping failed", e).await);
            }
        }

        let transaction = match self.manager.commit(handle).await {
            Ok(tx) => tx,
            Err(failure) => {
                return Err(self.abort(failure.handle, "commit failed", failure.error).await)
            }
        };

        let sync = if mutated_users.is_empty() {
            None
        } else {
            let event = CacheEvent::new(CacheEventType::BulkOperation)
                .with_users(mutated_users)
                .with_achievements(achievement.into_iter().collect())
                .with_meta(meta.clone());
            Some(self.sync_after_commit(event).await)
        };

        let successful = results.iter().filter(|item| item.success).count();
        let failed = results.len() - successful;
        Ok(BulkOutcome {
            operation: self.finish(
                op_id,
                tx_kind,
                users.to_vec(),
                achievement.into_iter().collect(),
                meta,
                transaction,
                sync,
                Vec::new(),
                started_at,
            ),
            successful,
            failed,
            total: results.len(),
            results,
        })
    }

    /// One user's slice of a bulk operation. An error here is the item's
    /// failure, never the batch's.
    async fn bulk_item(
        &self,
        handle: &mut TransactionHandle,
        kind: BulkKind,
        user: UserId,
        achievement: Option<AchievementId>,
        meta: &OperationMetadata,
    ) -> Result<(), CoordinationError> {
        match kind {
            BulkKind::Grant => {
                let achievement = achievement.ok_or_else(|| {
                    CoordinationError::InvalidConfig("missing achievement id".to_string())
                })?;
                let prev = self.store.get_user_achievements(user).await?;
                if prev.iter().any(|row| row.achievement == achievement) {
                    return Err(CoordinationError::DuplicateGrant { user, achievement });
                }
                let row = self
                    .store
                    .grant_user_achievement(user, achievement, true)
                    .await?;
                self.manager.record_operation(
                    handle,
                    OperationKind::Grant,
                    user,
                    Some(achievement),
                    None,
                    serde_json::to_value(&row).ok(),
                    meta.clone(),
                )?;
            }
            BulkKind::Revoke => {
                let achievement = achievement.ok_or_else(|| {
                    CoordinationError::InvalidConfig("missing achievement id".to_string())
                })?;
                let prev = self.store.get_user_achievements(user).await?;
                let existing = prev
                    .iter()
                    .find(|row| row.achievement == achievement)
                    .cloned()
                    .ok_or(CoordinationError::AchievementNotHeld { user, achievement })?;
                self.store.revoke_user_achievement(user, achievement).await?;
                self.manager.record_operation(
                    handle,
                    OperationKind::Revoke,
                    user,
                    Some(achievement),
                    serde_json::to_value(&existing).ok(),
                    None,
                    meta.clone(),
                )?;
            }
            BulkKind::Reset => {
                let backup = self.snapshot_user(user).await?;
                self.store.reset_user_data(user).await?;
                self.manager.record_operation(
                    handle,
                    OperationKind::ResetUserData,
                    user,
                    None,
                    Some(serde_json::to_value(&backup).map_err(bookkeeping_error)?),
                    None,
                    meta.clone(),
                )?;
            }
        }
        Ok(())
    }

    /// Run the integrity validator on demand.
    pub async fn validate(
        &self,
        target: ValidationTarget,
        level: ValidationLevel,
    ) -> ValidationReport {
        self.validator.validate(target, level).await
    }

    pub fn validator(&self) -> &DataIntegrityValidator {
        &self.validator
    }

    pub fn cache_sync(&self) -> &CacheSyncManager {
        &self.cache_sync
    }

    pub fn get_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            operations_coordinated: self.coordinated.load(Ordering::Relaxed),
            operations_successful: self.successful.load(Ordering::Relaxed),
            operations_failed: self.failed.load(Ordering::Relaxed),
            cache_events: self.cache_events.load(Ordering::Relaxed),
            transactions: self.manager.stats(),
            cache_sync: self.cache_sync.stats(),
            validator: self.validator.stats(),
        }
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let cache = self.cache_sync_health().await;
        let healthy = cache.as_ref().map(|h| h.available).unwrap_or(false);
        HealthStatus {
            healthy,
            active_transactions: self.manager.active_count() as u64,
            cache,
        }
    }

    async fn cache_sync_health(&self) -> Option<CacheHealth> {
        match self.cache_sync.cache().get_health().await {
            Ok(health) => Some(health),
            Err(cache_err) => {
                warn!("cache health probe failed: {cache_err}");
                None
            }
        }
    }

    /// Drop idle per-user lock slots.
    pub fn prune_idle_locks(&self) -> usize {
        self.manager.prune_idle_locks()
    }
}

fn bookkeeping_error(e: serde_json::Error) -> CoordinationError {
    CoordinationError::TransactionAborted {
        id: 0,
        reason: format!("operation snapshot unserializable: {e}"),
    }
}
