// Accolade coordination layer
//
// Synthesizes transactional semantics over an achievement store and a
// derived-cache layer that each only promise per-call atomicity. Four
// pieces:
//
//   - TransactionManager: append-only operation log, per-user locking,
//     commit-time integrity gate, reverse-order compensation
//   - CacheSyncManager: event-to-key-footprint planning and batched
//     post-commit invalidation
//   - DataIntegrityValidator: read-only rule engine over the store
//   - TransactionCoordinator: the public operation surface tying the three
//     together
//
// Consistency model: the store is the source of truth; caches follow.
// Under the default policy a commit-time cache invalidation failure fails
// the commit and the store mutations are compensated, so the two never
// diverge silently. Post-commit cache refresh is advisory.

pub mod cache_sync;
pub mod coordinator;
pub mod integrity;
pub mod transaction;
pub mod user_locks;

pub use cache_sync::{
    CacheEvent, CacheEventType, CacheInvalidationPlan, CacheSyncManager, CacheSyncOutcome,
    CacheSyncStats,
};
pub use coordinator::{
    AdjustProgressOutcome, BulkItemResult, BulkKind, BulkOutcome, CoordinatedOperation,
    CoordinatorConfig, CoordinatorStats, GrantOutcome, HealthStatus, ResetOutcome, RevokeOutcome,
    TransactionCoordinator,
};
pub use integrity::{
    DataIntegrityValidator, ValidationIssue, ValidationLevel, ValidationReport, ValidationRule,
    ValidationSeverity, ValidationTarget, ValidatorConfig, ValidatorStats,
};
pub use transaction::{
    CommitFailure, Expectation, IntegrityCheck, IntegrityCheckKind, OperationKind, Transaction,
    TransactionHandle, TransactionId, TransactionKind, TransactionManager,
    TransactionManagerStats, TransactionOperation, TransactionStatus,
};
pub use user_locks::UserLockArena;
