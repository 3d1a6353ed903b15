//! In-memory exclusive locks with deadline-based auto-expiry.
//!
//! A single reaper task sweeps expired deadlines instead of arming a timer
//! per lock; `acquire` also checks the deadline lazily so expiry does not
//! depend on reaper cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

struct HeldLock {
    holder: String,
    expires_at: Instant,
}

pub struct ProcessLockManager {
    locks: Arc<Mutex<HashMap<String, HeldLock>>>,
    lock_timeout: Duration,
    shutdown_tx: Option<watch::Sender<bool>>,
    reaper_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProcessLockManager {
    pub fn new(lock_timeout: Duration, reaper_interval: Duration) -> Self {
        let locks: Arc<Mutex<HashMap<String, HeldLock>>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reaper_locks = Arc::clone(&locks);
        let handle = tokio::spawn(async move {
            Self::reaper_loop(reaper_locks, reaper_interval, shutdown_rx).await;
        });

        Self {
            locks,
            lock_timeout,
            shutdown_tx: Some(shutdown_tx),
            reaper_handle: Some(handle),
        }
    }

    async fn reaper_loop(
        locks: Arc<Mutex<HashMap<String, HeldLock>>>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let mut map = locks.lock();
                    map.retain(|id, lock| {
                        if lock.expires_at <= now {
                            warn!(lock_id = %id, holder = %lock.holder, "Reaped expired process lock");
                            false
                        } else {
                            true
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Process lock reaper shutdown");
                        break;
                    }
                }
            }
        }
    }

    /// Acquire `id` exclusively. Returns false when the id is already held
    /// and its deadline has not passed; an expired holder is displaced.
    pub fn acquire(&self, id: &str, holder: &str) -> bool {
        self.acquire_for(id, holder, self.lock_timeout)
    }

    pub fn acquire_for(&self, id: &str, holder: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut map = self.locks.lock();
        if let Some(existing) = map.get(id) {
            if existing.expires_at > now {
                debug!(lock_id = %id, holder = %existing.holder, "Process lock denied");
                return false;
            }
            warn!(lock_id = %id, holder = %existing.holder, "Displacing expired process lock");
        }
        map.insert(
            id.to_string(),
            HeldLock {
                holder: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        debug!(lock_id = %id, holder = %holder, "Process lock acquired");
        true
    }

    /// Release `id`. Returns false when the lock was not held (already
    /// released or reaped).
    pub fn release(&self, id: &str) -> bool {
        let removed = self.locks.lock().remove(id).is_some();
        if removed {
            debug!(lock_id = %id, "Process lock released");
        }
        removed
    }

    pub fn is_held(&self, id: &str) -> bool {
        let now = Instant::now();
        self.locks
            .lock()
            .get(id)
            .is_some_and(|l| l.expires_at > now)
    }

    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.locks
            .lock()
            .values()
            .filter(|l| l.expires_at > now)
            .count()
    }
}

impl Drop for ProcessLockManager {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.reaper_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_until_released() {
        let manager = ProcessLockManager::new(Duration::from_secs(60), Duration::from_secs(1));
        assert!(manager.acquire("build", "a"));
        assert!(!manager.acquire("build", "b"));
        assert!(manager.release("build"));
        assert!(manager.acquire("build", "b"));
        assert!(!manager.release("missing"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_becomes_acquirable() {
        let manager =
            ProcessLockManager::new(Duration::from_millis(50), Duration::from_millis(10));
        assert!(manager.acquire("task", "crashed-holder"));
        assert!(!manager.acquire("task", "other"));

        tokio::time::sleep(Duration::from_millis(75)).await;
        assert!(manager.acquire("task", "other"));
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_removes_expired_locks() {
        let manager =
            ProcessLockManager::new(Duration::from_millis(30), Duration::from_millis(10));
        assert!(manager.acquire("a", "h"));
        assert!(manager.acquire("b", "h"));
        assert_eq!(manager.active_count(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.active_count(), 0);
        assert!(!manager.is_held("a"));
    }

    #[tokio::test]
    async fn per_acquire_ttl_overrides_default() {
        let manager = ProcessLockManager::new(Duration::from_secs(60), Duration::from_secs(1));
        assert!(manager.acquire_for("short", "h", Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.acquire("short", "other"));
    }
}
