use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

/// One async lock per dose id; serializes every read-modify-write of a record.
#[derive(Clone, Default)]
pub(crate) struct DoseLocks {
    inner: Arc<Mutex<LockMap>>,
}

impl DoseLocks {
    pub(crate) async fn acquire(&self, dose_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.map().entry(dose_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drops entries nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.map().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map().len()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_dose_is_serialized() {
        let locks = DoseLocks::default();
        let first = locks.acquire("dose-1").await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = contender.acquire("dose-1").await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let _other = locks.acquire("dose-2").await;
        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = DoseLocks::default();
        let held = locks.acquire("dose-1").await;
        drop(locks.acquire("dose-2").await);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert_eq!(locks.len(), 0);
    }
}
