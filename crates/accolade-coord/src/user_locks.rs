// Per-User Lock Arena - mutual exclusion for coordinated operations
//
// SAFETY INVARIANTS:
// 1. Lock acquisition order is sorted by user id (prevents circular deadlock
//    across multi-user operations)
// 2. Guards release on every exit path (owned guards dropped with the
//    transaction handle)
// 3. The arena map itself is guarded; lookup and prune are atomic with
//    respect to each other, so prune never drops a slot a waiter has cloned
// 4. Slots are created lazily and pruned when no outside holder remains
//    (bounded growth in long-lived processes)

use accolade_core::model::UserId;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily-populated registry of per-user async mutexes.
pub struct UserLockArena {
    slots: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl UserLockArena {
    pub fn new() -> Self {
        UserLockArena {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, user: UserId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock();
        slots
            .entry(user)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire one guard per distinct user, in sorted id order.
    ///
    /// Overlapping user sets serialize here; disjoint sets proceed
    /// concurrently. The returned guards keep their slots alive until
    /// dropped.
    pub async fn acquire_sorted(&self, users: &[UserId]) -> Vec<OwnedMutexGuard<()>> {
        let mut distinct: Vec<UserId> = users.to_vec();
        distinct.sort();
        distinct.dedup();

        let mut guards = Vec::with_capacity(distinct.len());
        for user in distinct {
            let slot = self.slot(user);
            guards.push(slot.lock_owned().await);
        }
        guards
    }

    /// Remove slots with no outside holder. Returns how many were removed.
    ///
    /// A slot's Arc count is 1 exactly when nobody holds a clone (guards
    /// hold one via lock_owned); both clone and prune run under the arena
    /// mutex, so the count cannot race upward between check and removal.
    pub fn prune_idle(&self) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        let removed = before - slots.len();
        if removed > 0 {
            debug!("pruned {removed} idle user lock slot(s)");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl Default for UserLockArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_overlapping_sets_serialize() {
        let arena = StdArc::new(UserLockArena::new());
        let guards = arena.acquire_sorted(&[UserId(1), UserId(2)]).await;

        let arena2 = arena.clone();
        let waiter = tokio::spawn(async move {
            let _guards = arena2.acquire_sorted(&[UserId(2)]).await;
        });

        // The waiter cannot finish while user 2's guard is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guards);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once guards drop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_opposite_order_acquisition_does_not_deadlock() {
        let arena = StdArc::new(UserLockArena::new());

        let a = arena.clone();
        let b = arena.clone();
        let t1 = tokio::spawn(async move {
            for _ in 0..50 {
                let _g = a.acquire_sorted(&[UserId(1), UserId(2)]).await;
            }
        });
        let t2 = tokio::spawn(async move {
            for _ in 0..50 {
                // Reversed input order; sorted acquisition makes this safe.
                let _g = b.acquire_sorted(&[UserId(2), UserId(1)]).await;
            }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            t1.await.unwrap();
            t2.await.unwrap();
        })
        .await
        .expect("sorted acquisition must not deadlock");
    }

    #[tokio::test]
    async fn test_duplicate_users_acquire_once() {
        let arena = UserLockArena::new();
        let guards = arena
            .acquire_sorted(&[UserId(5), UserId(5), UserId(5)])
            .await;
        assert_eq!(guards.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_removes_only_idle_slots() {
        let arena = UserLockArena::new();
        let held = arena.acquire_sorted(&[UserId(1)]).await;
        let released = arena.acquire_sorted(&[UserId(2)]).await;
        drop(released);

        assert_eq!(arena.len(), 2);
        let removed = arena.prune_idle();
        assert_eq!(removed, 1);
        assert_eq!(arena.len(), 1);

        drop(held);
        assert_eq!(arena.prune_idle(), 1);
        assert!(arena.is_empty());
    }
}
