//! Per-run async locks
//!
//! Launch, cancel and exit handling for one run are serialized through the
//! run's lock; different runs never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type RunGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct RunLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, run_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for the run's lock
    pub async fn acquire(&self, run_id: &str) -> RunGuard {
        self.entry(run_id).lock_owned().await
    }

    /// Take the run's lock only if nobody holds it
    pub fn try_acquire(&self, run_id: &str) -> Option<RunGuard> {
        self.entry(run_id).try_lock_owned().ok()
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
