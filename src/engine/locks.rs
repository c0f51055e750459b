use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per ride id. Rides never share a lock, so work on
/// different rides proceeds in parallel.
#[derive(Debug, Default)]
pub struct RideLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl RideLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, ride_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            locks.entry(ride_id).or_default().clone()
        };

        lock.lock_owned().await
    }

    /// Drops the entry for a ride nobody holds or waits on. Used once a
    /// ride is terminal.
    pub fn forget(&self, ride_id: Uuid) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(lock) = locks.get(&ride_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&ride_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[tokio::test]
async fn same_ride_is_serialized() {
    use std::time::Duration;

    let locks = Arc::new(RideLocks::new());
    let ride_id = Uuid::new_v4();

    let guard = locks.lock(ride_id).await;

    let waiter = {
        let locks = locks.clone();
        tokio::spawn(async move {
            let _guard = locks.lock(ride_id).await;
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    // another ride is not blocked
    let _other = locks.lock(Uuid::new_v4()).await;

    drop(guard);
    waiter.await.unwrap();
}

#[tokio::test]
async fn forgotten_locks_are_only_dropped_when_idle() {
    let locks = RideLocks::new();
    let ride_id = Uuid::new_v4();

    let guard = locks.lock(ride_id).await;
    locks.forget(ride_id);
    assert_eq!(locks.len(), 1);

    drop(guard);
    locks.forget(ride_id);
    assert_eq!(locks.len(), 0);
}
