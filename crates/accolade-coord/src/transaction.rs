// Transaction Manager - synthesized transaction semantics over ports that
// commit immediately
//
// SAFETY INVARIANTS:
// 1. A transaction is an append-only log: operations, cache invalidations,
//    and integrity checks are never reordered or coalesced
// 2. Operations commit in insertion order and roll back in exact reverse
//    order
// 3. An operation's rollback_executed flips at most once
// 4. A cache invalidation executes at most once, at commit
// 5. Commit completes only if every attached integrity check passed
// 6. At most one active transaction per user id (per-user mutexes held for
//    the transaction's lifetime)
// 7. A failing compensation does not stop attempts on earlier operations,
//    but the rollback reports FAILED and propagates the error - nothing is
//    silently swallowed

use crate::user_locks::UserLockArena;
use accolade_core::cache::{CacheDomain, CacheService};
use accolade_core::error::{CoordinationError, StoreError};
use accolade_core::model::{
    AchievementId, OperationMetadata, UserDataBackup, UserId,
};
use accolade_core::store::AchievementStore;
use accolade_core::unix_now;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Uniquely identifies a transaction within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Allocated, user locks not yet held.
    Pending,

    /// Locks held, mutations being recorded.
    Active,

    /// Commit in progress (integrity gate, cache drain).
    Committing,

    /// Successfully committed.
    Committed,

    /// Compensation in progress.
    RollingBack,

    /// All recorded operations compensated.
    RolledBack,

    /// Integrity gate rejected the commit, or a compensation errored.
    Failed,
}

/// Business kind of a whole transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Grant,
    Revoke,
    AdjustProgress,
    ResetUserData,
    BulkGrant,
    BulkRevoke,
    BulkReset,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Grant => "grant",
            TransactionKind::Revoke => "revoke",
            TransactionKind::AdjustProgress => "adjust_progress",
            TransactionKind::ResetUserData => "reset_user_data",
            TransactionKind::BulkGrant => "bulk_grant",
            TransactionKind::BulkRevoke => "bulk_revoke",
            TransactionKind::BulkReset => "bulk_reset",
        }
    }
}

/// Kind of a single recorded store mutation. Compensation dispatch matches
/// on this exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Grant,
    Revoke,
    AdjustProgress,
    ResetUserData,
}

/// One store mutation, with the snapshots compensation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOperation {
    /// Sequence number within the transaction (1-based).
    pub id: u64,

    pub kind: OperationKind,
    pub user: UserId,
    pub achievement: Option<AchievementId>,

    /// State before the mutation (None when nothing existed).
    pub old_value: Option<serde_json::Value>,

    /// State after the mutation.
    pub new_value: Option<serde_json::Value>,

    pub meta: OperationMetadata,

    /// Unix seconds the mutation executed.
    pub executed_at: u64,

    /// Flips at most once, when the compensating action succeeds.
    pub rollback_executed: bool,
}

/// A cache footprint entry, executed exactly once at commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidation {
    pub domain: CacheDomain,
    pub keys: Vec<String>,
    pub invalidated: bool,
}

/// Expected-state comparison: exact match or numeric bound/range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expectation {
    Exact(serde_json::Value),
    AtLeast(i64),
    AtMost(i64),
    Range { min: i64, max: i64 },
}

impl Expectation {
    pub fn matches(&self, actual: Option<&serde_json::Value>) -> bool {
        match self {
            Expectation::Exact(expected) => actual == Some(expected),
            Expectation::AtLeast(min) => actual.and_then(|v| v.as_i64()).is_some_and(|n| n >= *min),
            Expectation::AtMost(max) => actual.and_then(|v| v.as_i64()).is_some_and(|n| n <= *max),
            Expectation::Range { min, max } => actual
                .and_then(|v| v.as_i64())
                .is_some_and(|n| n >= *min && n <= *max),
        }
    }
}

/// What state an integrity check reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrityCheckKind {
    /// Number of achievements the target user holds.
    UserAchievementCount,

    /// Current progress value for (user, achievement).
    UserProgressValue,

    /// Grant and progress row counts for the target user (reset checks).
    UserDataCounts,
}

impl IntegrityCheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityCheckKind::UserAchievementCount => "user_achievement_count",
            IntegrityCheckKind::UserProgressValue => "user_progress_value",
            IntegrityCheckKind::UserDataCounts => "user_data_counts",
        }
    }
}

/// Point-in-time expected-vs-actual comparison, captured after the mutation
/// and gating the commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub id: u64,
    pub kind: IntegrityCheckKind,
    pub target: UserId,
    pub achievement: Option<AchievementId>,
    pub expected: BTreeMap<String, Expectation>,
    pub actual: BTreeMap<String, serde_json::Value>,
    pub passed: bool,
    pub error: Option<String>,
}

/// In-memory transaction record. Lives only in process memory; durability
/// of the log itself is a non-goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub users: Vec<UserId>,
    pub meta: OperationMetadata,
    pub operations: Vec<TransactionOperation>,
    pub invalidations: Vec<CacheInvalidation>,
    pub checks: Vec<IntegrityCheck>,
    pub opened_at: u64,
    pub finished_at: Option<u64>,
    pub failure: Option<String>,
    pub rollback_reason: Option<String>,
}

impl Transaction {
    fn failed_check(&self) -> Option<&IntegrityCheck> {
        self.checks.iter().find(|check| !check.passed)
    }
}

/// Registry entry for an in-flight transaction.
#[derive(Debug, Clone)]
pub struct ActiveTransaction {
    pub kind: TransactionKind,
    pub users: Vec<UserId>,
    pub opened_at: u64,
}

/// Must-consume transaction scope. Exactly one of
/// `TransactionManager::commit` / `TransactionManager::rollback` consumes
/// it; dropping it without either logs an error and releases the locks.
pub struct TransactionHandle {
    tx: Option<Transaction>,
    guards: Vec<OwnedMutexGuard<()>>,
    registry: Arc<DashMap<TransactionId, ActiveTransaction>>,
}

impl TransactionHandle {
    pub fn id(&self) -> Option<TransactionId> {
        self.tx.as_ref().map(|tx| tx.id)
    }

    /// Read access to the transaction record while the scope is open.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.tx.as_ref()
    }

    fn tx_mut(&mut self) -> Result<&mut Transaction, CoordinationError> {
        self.tx.as_mut().ok_or(CoordinationError::TransactionAborted {
            id: 0,
            reason: "transaction handle already consumed".to_string(),
        })
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            error!(
                "transaction {} ({}) dropped without commit or rollback; releasing {} user lock(s)",
                tx.id,
                tx.kind.as_str(),
                self.guards.len()
            );
            self.registry.remove(&tx.id);
        }
    }
}

/// Commit rejection. Carries the handle back so the caller can run the
/// rollback the failed commit now requires.
pub struct CommitFailure {
    pub handle: TransactionHandle,
    pub error: CoordinationError,
}

/// Counter snapshot for stats reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionManagerStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub active: u64,
}

/// Owns the transaction log format, the active-transaction registry, the
/// per-user lock arena, and the commit/rollback machinery.
pub struct TransactionManager {
    store: Arc<dyn AchievementStore>,
    cache: Arc<dyn CacheService>,
    locks: UserLockArena,
    registry: Arc<DashMap<TransactionId, ActiveTransaction>>,
    next_id: AtomicU64,

    /// When false, a cache failure during the commit drain is logged and the
    /// commit proceeds (warn-and-commit policy).
    cache_failure_fatal: bool,

    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
}

impl TransactionManager {
    pub fn new(store: Arc<dyn AchievementStore>, cache: Arc<dyn CacheService>) -> Self {
        Self::with_cache_policy(store, cache, true)
    }

    pub fn with_cache_policy(
        store: Arc<dyn AchievementStore>,
        cache: Arc<dyn CacheService>,
        cache_failure_fatal: bool,
    ) -> Self {
        TransactionManager {
            store,
            cache,
            locks: UserLockArena::new(),
            registry: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            cache_failure_fatal,
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Open a transaction: allocate the record, acquire one mutex per
    /// distinct user in sorted order, register it as active.
    pub async fn begin(
        &self,
        kind: TransactionKind,
        users: &[UserId],
        meta: OperationMetadata,
    ) -> TransactionHandle {
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut sorted_users: Vec<UserId> = users.to_vec();
        sorted_users.sort();
        sorted_users.dedup();

        let opened_at = unix_now();
        let mut tx = Transaction {
            id,
            kind,
            status: TransactionStatus::Pending,
            users: sorted_users.clone(),
            meta,
            operations: Vec::new(),
            invalidations: Vec::new(),
            checks: Vec::new(),
            opened_at,
            finished_at: None,
            failure: None,
            rollback_reason: None,
        };
        debug!("transaction {id} ({}) pending lock acquisition", kind.as_str());

        let guards = self.locks.acquire_sorted(users).await;
        tx.status = TransactionStatus::Active;

        self.registry.insert(
            id,
            ActiveTransaction {
                kind,
                users: sorted_users,
                opened_at,
            },
        );
        self.begun.fetch_add(1, Ordering::Relaxed);
        info!("transaction {id} ({}) active, {} lock(s) held", kind.as_str(), guards.len());

        TransactionHandle {
            tx: Some(tx),
            guards,
            registry: self.registry.clone(),
        }
    }

    /// Append one executed store mutation. Returns its sequence number.
    pub fn record_operation(
        &self,
        handle: &mut TransactionHandle,
        kind: OperationKind,
        user: UserId,
        achievement: Option<AchievementId>,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        meta: OperationMetadata,
    ) -> Result<u64, CoordinationError> {
        let tx = handle.tx_mut()?;
        let id = tx.operations.len() as u64 + 1;
        tx.operations.push(TransactionOperation {
            id,
            kind,
            user,
            achievement,
            old_value,
            new_value,
            meta,
            executed_at: unix_now(),
            rollback_executed: false,
        });
        Ok(id)
    }

    /// Append a cache footprint entry (executed at commit).
    pub fn record_cache_invalidation(
        &self,
        handle: &mut TransactionHandle,
        domain: CacheDomain,
        keys: Vec<String>,
    ) -> Result<(), CoordinationError> {
        let tx = handle.tx_mut()?;
        tx.invalidations.push(CacheInvalidation {
            domain,
            keys,
            invalidated: false,
        });
        Ok(())
    }

    /// Read current state through the default reader for `kind`, compare
    /// against `expected`, append the check. Returns whether it passed.
    pub async fn record_integrity_check(
        &self,
        handle: &mut TransactionHandle,
        kind: IntegrityCheckKind,
        target: UserId,
        achievement: Option<AchievementId>,
        expected: BTreeMap<String, Expectation>,
    ) -> Result<bool, CoordinationError> {
        let actual = self.read_check_state(kind, target, achievement).await?;
        self.record_integrity_check_with(handle, kind, target, achievement, expected, actual)
    }

    /// As `record_integrity_check`, but with caller-supplied actual state.
    pub fn record_integrity_check_with(
        &self,
        handle: &mut TransactionHandle,
        kind: IntegrityCheckKind,
        target: UserId,
        achievement: Option<AchievementId>,
        expected: BTreeMap<String, Expectation>,
        actual: BTreeMap<String, serde_json::Value>,
    ) -> Result<bool, CoordinationError> {
        let mut mismatches = Vec::new();
        for (field, expectation) in &expected {
            if !expectation.matches(actual.get(field)) {
                mismatches.push(format!(
                    "{field}: expected {expectation:?}, actual {:?}",
                    actual.get(field)
                ));
            }
        }
        let passed = mismatches.is_empty();

        let tx = handle.tx_mut()?;
        let id = tx.checks.len() as u64 + 1;
        if !passed {
            warn!(
                "transaction {} integrity check {} ({}) failed: {}",
                tx.id,
                id,
                kind.as_str(),
                mismatches.join("; ")
            );
        }
        tx.checks.push(IntegrityCheck {
            id,
            kind,
            target,
            achievement,
            expected,
            actual,
            passed,
            error: if passed {
                None
            } else {
                Some(mismatches.join("; "))
            },
        });
        Ok(passed)
    }

    async fn read_check_state(
        &self,
        kind: IntegrityCheckKind,
        target: UserId,
        achievement: Option<AchievementId>,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let mut actual = BTreeMap::new();
        match kind {
            IntegrityCheckKind::UserAchievementCount => {
                let count = self.store.get_user_achievements(target).await?.len();
                actual.insert(
                    "user_achievement_count".to_string(),
                    serde_json::json!(count as i64),
                );
            }
            IntegrityCheckKind::UserProgressValue => {
                let achievement = achievement.ok_or_else(|| {
                    StoreError::Transport(
                        "progress check requires an achievement id".to_string(),
                    )
                })?;
                let current = self
                    .store
                    .get_user_progress_for_achievement(target, achievement)
                    .await?
                    .map(|row| row.current)
                    .unwrap_or(0);
                actual.insert("progress_current".to_string(), serde_json::json!(current));
            }
            IntegrityCheckKind::UserDataCounts => {
                let grants = self.store.get_user_achievements(target).await?.len();
                let progress = self.store.get_user_progress(target).await?.len();
                actual.insert(
                    "user_achievement_count".to_string(),
                    serde_json::json!(grants as i64),
                );
                actual.insert("progress_rows".to_string(), serde_json::json!(progress as i64));
            }
        }
        Ok(actual)
    }

    /// Commit: assert every integrity check passed, then drain the recorded
    /// cache invalidations in order (one batched call each).
    ///
    /// On rejection the handle comes back inside `CommitFailure` - the
    /// caller must run `rollback` to compensate the already-applied store
    /// mutations.
    pub async fn commit(&self, mut handle: TransactionHandle) -> Result<Transaction, CommitFailure> {
        let mut tx = match handle.tx.take() {
            Some(tx) => tx,
            None => {
                return Err(CommitFailure {
                    error: CoordinationError::TransactionAborted {
                        id: 0,
                        reason: "commit on consumed handle".to_string(),
                    },
                    handle,
                })
            }
        };
        tx.status = TransactionStatus::Committing;

        if let Some(check) = tx.failed_check() {
            let error = CoordinationError::IntegrityFailure {
                check: check.kind.as_str().to_string(),
                detail: check
                    .error
                    .clone()
                    .unwrap_or_else(|| "expected/actual mismatch".to_string()),
            };
            warn!("transaction {} commit blocked by integrity check", tx.id);
            handle.tx = Some(tx);
            return Err(CommitFailure { handle, error });
        }

        for index in 0..tx.invalidations.len() {
            let (domain, keys) = {
                let inv = &tx.invalidations[index];
                (inv.domain, inv.keys.clone())
            };
            match self.cache.invalidate_batch(domain.as_str(), &keys).await {
                Ok(()) => tx.invalidations[index].invalidated = true,
                Err(cache_err) if self.cache_failure_fatal => {
                    warn!(
                        "transaction {} cache invalidation failed on {}: {cache_err}",
                        tx.id, domain
                    );
                    handle.tx = Some(tx);
                    return Err(CommitFailure {
                        handle,
                        error: cache_err.into(),
                    });
                }
                Err(cache_err) => {
                    // Warn-and-commit policy: the store is the source of
                    // truth, stale cache entries expire or get re-evicted.
                    warn!(
                        "transaction {} cache invalidation failed on {} (non-fatal): {cache_err}",
                        tx.id, domain
                    );
                }
            }
        }

        tx.status = TransactionStatus::Committed;
        tx.finished_at = Some(unix_now());
        self.registry.remove(&tx.id);
        self.committed.fetch_add(1, Ordering::Relaxed);
        info!(
            "transaction {} committed: {} operation(s), {} invalidation(s), {} check(s)",
            tx.id,
            tx.operations.len(),
            tx.invalidations.len(),
            tx.checks.len()
        );
        Ok(tx)
    }

    /// Roll back: walk operations in exact reverse order and run the
    /// kind-specific compensating action for each one not yet rolled back.
    ///
    /// A failing compensation is logged and earlier operations are still
    /// attempted; the transaction then ends FAILED and the first error
    /// propagates.
    pub async fn rollback(
        &self,
        mut handle: TransactionHandle,
        reason: &str,
    ) -> Result<Transaction, CoordinationError> {
        let mut tx = handle
            .tx
            .take()
            .ok_or(CoordinationError::TransactionAborted {
                id: 0,
                reason: "rollback on consumed handle".to_string(),
            })?;
        tx.status = TransactionStatus::RollingBack;
        info!(
            "transaction {} rolling back ({} operation(s)): {reason}",
            tx.id,
            tx.operations.len()
        );

        let mut first_error: Option<StoreError> = None;
        for index in (0..tx.operations.len()).rev() {
            if tx.operations[index].rollback_executed {
                continue;
            }
            let op = tx.operations[index].clone();
            match self.compensate(&op).await {
                Ok(()) => {
                    tx.operations[index].rollback_executed = true;
                    debug!(
                        "transaction {} compensated operation {} ({:?})",
                        tx.id, op.id, op.kind
                    );
                }
                Err(store_err) => {
                    error!(
                        "transaction {} compensation for operation {} ({:?}) failed: {store_err}",
                        tx.id, op.id, op.kind
                    );
                    if first_error.is_none() {
                        first_error = Some(store_err);
                    }
                }
            }
        }

        self.registry.remove(&tx.id);
        tx.finished_at = Some(unix_now());

        if let Some(store_err) = first_error {
            tx.status = TransactionStatus::Failed;
            tx.failure = Some(store_err.to_string());
            self.failed.fetch_add(1, Ordering::Relaxed);
            error!("transaction {} rollback FAILED: {store_err}", tx.id);
            return Err(store_err.into());
        }

        tx.status = TransactionStatus::RolledBack;
        tx.rollback_reason = Some(reason.to_string());
        self.rolled_back.fetch_add(1, Ordering::Relaxed);
        info!("transaction {} rolled back", tx.id);
        Ok(tx)
    }

    /// Kind-exhaustive compensating action dispatch.
    async fn compensate(&self, op: &TransactionOperation) -> Result<(), StoreError> {
        match op.kind {
            OperationKind::Grant => {
                let achievement = op.achievement.ok_or_else(|| {
                    StoreError::Transport("grant operation missing achievement id".to_string())
                })?;
                self.store
                    .revoke_user_achievement(op.user, achievement)
                    .await?;
                Ok(())
            }
            OperationKind::Revoke => {
                let achievement = op.achievement.ok_or_else(|| {
                    StoreError::Transport("revoke operation missing achievement id".to_string())
                })?;
                self.store
                    .grant_user_achievement(op.user, achievement, false)
                    .await?;
                Ok(())
            }
            OperationKind::AdjustProgress => {
                let achievement = op.achievement.ok_or_else(|| {
                    StoreError::Transport("progress operation missing achievement id".to_string())
                })?;
                let old_value = op
                    .old_value
                    .as_ref()
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                self.store
                    .update_user_progress(op.user, achievement, old_value)
                    .await?;
                Ok(())
            }
            OperationKind::ResetUserData => {
                let backup: UserDataBackup = op
                    .old_value
                    .as_ref()
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| {
                        StoreError::Transport(format!("reset snapshot unreadable: {e}"))
                    })?
                    .ok_or_else(|| {
                        StoreError::Transport("reset operation missing snapshot".to_string())
                    })?;

                for row in &backup.achievements {
                    self.store
                        .grant_user_achievement(row.user, row.achievement, false)
                        .await?;
                }
                for row in &backup.progress {
                    self.store
                        .update_user_progress(row.user, row.achievement, row.current)
                        .await?;
                }
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> TransactionManagerStats {
        TransactionManagerStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.registry.len() as u64,
        }
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Drop idle per-user lock slots (see UserLockArena::prune_idle).
    pub fn prune_idle_locks(&self) -> usize {
        self.locks.prune_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accolade_core::memory::{InMemoryAchievementStore, InMemoryCacheService};
    use accolade_core::model::{
        Achievement, AchievementCategory, AchievementCriteria, CategoryId,
    };

    fn seeded_store() -> InMemoryAchievementStore {
        let store = InMemoryAchievementStore::new();
        store.insert_category(AchievementCategory {
            id: CategoryId(1),
            name: "Social".to_string(),
            description: "Community participation".to_string(),
        });
        for (id, target) in [(1u64, 1i64), (2, 100)] {
            store.insert_achievement(Achievement {
                id: AchievementId(id),
                category: CategoryId(1),
                name: format!("achievement-{id}"),
                description: String::new(),
                criteria: AchievementCriteria::new("messages_sent", target),
                hidden: false,
                points: 10,
            });
        }
        store
    }

    fn manager(
        store: &InMemoryAchievementStore,
        cache: &InMemoryCacheService,
    ) -> TransactionManager {
        TransactionManager::new(Arc::new(store.clone()), Arc::new(cache.clone()))
    }

    #[tokio::test]
    async fn test_begin_activates_only_after_locks_acquired() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = Arc::new(manager(&store, &cache));

        let first = mgr
            .begin(TransactionKind::Grant, &[UserId(1)], OperationMetadata::default())
            .await;
        assert_eq!(first.transaction().unwrap().status, TransactionStatus::Active);

        // A second transaction on the same user allocates PENDING and stays
        // there until the lock frees: it is not yet registered as active.
        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            mgr2.begin(TransactionKind::Revoke, &[UserId(1)], OperationMetadata::default())
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(mgr.active_count(), 1);

        mgr.rollback(first, "release").await.unwrap();
        let second = waiter.await.unwrap();
        assert_eq!(second.transaction().unwrap().status, TransactionStatus::Active);
        mgr.rollback(second, "cleanup").await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_drains_invalidations_in_order() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = manager(&store, &cache);

        let mut handle = mgr
            .begin(TransactionKind::Grant, &[UserId(1)], OperationMetadata::default())
            .await;
        mgr.record_cache_invalidation(
            &mut handle,
            CacheDomain::UserAchievements,
            vec!["user_achievements:1".to_string()],
        )
        .unwrap();
        mgr.record_cache_invalidation(
            &mut handle,
            CacheDomain::GlobalStats,
            vec!["global_stats:*".to_string()],
        )
        .unwrap();

        let tx = mgr.commit(handle).await.map_err(|f| f.error).unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert!(tx.invalidations.iter().all(|inv| inv.invalidated));

        let calls = cache.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].cache_type, "user_achievements");
        assert_eq!(calls[1].cache_type, "global_stats");
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_integrity_check_blocks_commit() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = manager(&store, &cache);

        let mut handle = mgr
            .begin(TransactionKind::Grant, &[UserId(1)], OperationMetadata::default())
            .await;

        let mut expected = BTreeMap::new();
        expected.insert(
            "user_achievement_count".to_string(),
            Expectation::AtLeast(5),
        );
        let passed = mgr
            .record_integrity_check(
                &mut handle,
                IntegrityCheckKind::UserAchievementCount,
                UserId(1),
                None,
                expected,
            )
            .await
            .unwrap();
        assert!(!passed);

        let failure = match mgr.commit(handle).await {
            Err(failure) => failure,
            Ok(_) => panic!("commit must be blocked"),
        };
        assert!(matches!(
            failure.error,
            CoordinationError::IntegrityFailure { .. }
        ));
        // No invalidation ran.
        assert!(cache.calls().is_empty());

        // The returned handle still rolls back cleanly.
        let tx = mgr.rollback(failure.handle, "integrity gate").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn test_rollback_compensates_in_reverse_order() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = manager(&store, &cache);
        let user = UserId(1);

        let mut handle = mgr
            .begin(TransactionKind::AdjustProgress, &[user], OperationMetadata::default())
            .await;

        // Mutation 1: progress 0 -> 100.
        store.update_user_progress(user, AchievementId(2), 100).await.unwrap();
        mgr.record_operation(
            &mut handle,
            OperationKind::AdjustProgress,
            user,
            Some(AchievementId(2)),
            Some(serde_json::json!(0)),
            Some(serde_json::json!(100)),
            OperationMetadata::default(),
        )
        .unwrap();

        // Mutation 2: grant.
        store.grant_user_achievement(user, AchievementId(2), false).await.unwrap();
        mgr.record_operation(
            &mut handle,
            OperationKind::Grant,
            user,
            Some(AchievementId(2)),
            None,
            None,
            OperationMetadata::default(),
        )
        .unwrap();

        let tx = mgr.rollback(handle, "forced").await.unwrap();
        assert_eq!(tx.status, TransactionStatus::RolledBack);
        assert!(tx.operations.iter().all(|op| op.rollback_executed));

        assert_eq!(store.achievement_count_for(user), 0);
        let progress = store
            .get_user_progress_for_achievement(user, AchievementId(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.current, 0);
    }

    #[tokio::test]
    async fn test_compensation_failure_still_attempts_earlier_operations() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = manager(&store, &cache);
        let user = UserId(1);

        let mut handle = mgr
            .begin(TransactionKind::BulkGrant, &[user], OperationMetadata::default())
            .await;

        // Earlier operation: progress write (compensable).
        store.update_user_progress(user, AchievementId(2), 42).await.unwrap();
        mgr.record_operation(
            &mut handle,
            OperationKind::AdjustProgress,
            user,
            Some(AchievementId(2)),
            Some(serde_json::json!(7)),
            Some(serde_json::json!(42)),
            OperationMetadata::default(),
        )
        .unwrap();

        // Later operation: grant whose compensating revoke will fail.
        store.grant_user_achievement(user, AchievementId(1), false).await.unwrap();
        mgr.record_operation(
            &mut handle,
            OperationKind::Grant,
            user,
            Some(AchievementId(1)),
            None,
            None,
            OperationMetadata::default(),
        )
        .unwrap();

        store.fail_revokes_for(user);
        let err = mgr.rollback(handle, "forced").await.unwrap_err();
        assert!(matches!(err, CoordinationError::Store(_)));

        // The earlier progress operation was still compensated.
        let progress = store
            .get_user_progress_for_achievement(user, AchievementId(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.current, 7);
        assert_eq!(mgr.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_reset_compensation_restores_snapshot() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = manager(&store, &cache);
        let user = UserId(9);

        store.grant_user_achievement(user, AchievementId(1), false).await.unwrap();
        store.update_user_progress(user, AchievementId(2), 30).await.unwrap();
        let backup = UserDataBackup {
            user,
            achievements: store.get_user_achievements(user).await.unwrap(),
            progress: store.get_user_progress(user).await.unwrap(),
            taken_at: unix_now(),
        };

        let mut handle = mgr
            .begin(TransactionKind::ResetUserData, &[user], OperationMetadata::default())
            .await;
        store.reset_user_data(user).await.unwrap();
        mgr.record_operation(
            &mut handle,
            OperationKind::ResetUserData,
            user,
            None,
            Some(serde_json::to_value(&backup).unwrap()),
            None,
            OperationMetadata::default(),
        )
        .unwrap();

        assert_eq!(store.achievement_count_for(user), 0);
        mgr.rollback(handle, "forced").await.unwrap();

        assert_eq!(store.achievement_count_for(user), 1);
        let progress = store
            .get_user_progress_for_achievement(user, AchievementId(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(progress.current, 30);
    }

    #[tokio::test]
    async fn test_cache_failure_fails_commit_under_default_policy() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        cache.fail_on_key("global_stats:*");
        let mgr = manager(&store, &cache);

        let mut handle = mgr
            .begin(TransactionKind::Grant, &[UserId(1)], OperationMetadata::default())
            .await;
        mgr.record_cache_invalidation(
            &mut handle,
            CacheDomain::GlobalStats,
            vec!["global_stats:*".to_string()],
        )
        .unwrap();

        let failure = match mgr.commit(handle).await {
            Err(failure) => failure,
            Ok(_) => panic!("commit must fail"),
        };
        assert!(matches!(failure.error, CoordinationError::Cache(_)));
        mgr.rollback(failure.handle, "cache drain failed").await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_failure_ignored_under_warn_policy() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        cache.fail_on_key("global_stats:*");
        let mgr = TransactionManager::with_cache_policy(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            false,
        );

        let mut handle = mgr
            .begin(TransactionKind::Grant, &[UserId(1)], OperationMetadata::default())
            .await;
        mgr.record_cache_invalidation(
            &mut handle,
            CacheDomain::GlobalStats,
            vec!["global_stats:*".to_string()],
        )
        .unwrap();

        let tx = mgr.commit(handle).await.map_err(|f| f.error).unwrap();
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert!(!tx.invalidations[0].invalidated);
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_registry_and_locks() {
        let store = seeded_store();
        let cache = InMemoryCacheService::new();
        let mgr = manager(&store, &cache);

        let handle = mgr
            .begin(TransactionKind::Grant, &[UserId(3)], OperationMetadata::default())
            .await;
        assert_eq!(mgr.active_count(), 1);
        drop(handle);
        assert_eq!(mgr.active_count(), 0);

        // The user is lockable again.
        let handle = mgr
            .begin(TransactionKind::Grant, &[UserId(3)], OperationMetadata::default())
            .await;
        mgr.rollback(handle, "cleanup").await.unwrap();
    }

    #[test]
    fn test_expectation_matching() {
        let exact = Expectation::Exact(serde_json::json!(3));
        assert!(exact.matches(Some(&serde_json::json!(3))));
        assert!(!exact.matches(Some(&serde_json::json!(4))));
        assert!(!exact.matches(None));

        let at_least = Expectation::AtLeast(2);
        assert!(at_least.matches(Some(&serde_json::json!(2))));
        assert!(!at_least.matches(Some(&serde_json::json!(1))));

        let range = Expectation::Range { min: 1, max: 5 };
        assert!(range.matches(Some(&serde_json::json!(5))));
        assert!(!range.matches(Some(&serde_json::json!(6))));
        assert!(!range.matches(Some(&serde_json::json!("nan"))));
    }
}
