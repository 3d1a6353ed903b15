//! Read/write lock with per-role FIFO queues and acquisition timeouts.
//!
//! Writers are checked first at every release. In fair mode, a release that
//! cannot grant the oldest writer falls through to queued readers; in unfair
//! mode queued readers are admitted only while no writer is waiting. A
//! direct read acquisition never consults the queues; a direct write
//! acquisition queues behind earlier writers to keep writer FIFO intact.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ExecError;

/// Counters kept per lock, readable at any time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RwLockStats {
    pub reads_granted: u64,
    pub writes_granted: u64,
    pub timeouts: u64,
    pub forced_releases: u64,
    pub avg_wait_ms: f64,
    pub max_concurrent_readers: usize,
}

struct Waiter {
    ticket: u64,
    enqueued_at: Instant,
    // Carries the grant epoch so a guard built from a raced grant can be
    // rolled back against the right generation.
    tx: oneshot::Sender<u64>,
}

#[derive(Default)]
struct RwState {
    epoch: u64,
    readers: usize,
    writer: bool,
    read_queue: VecDeque<Waiter>,
    write_queue: VecDeque<Waiter>,
    next_ticket: u64,
    reads_granted: u64,
    writes_granted: u64,
    timeouts: u64,
    forced_releases: u64,
    total_wait: Duration,
    grants: u64,
    max_concurrent_readers: usize,
}

struct Shared {
    name: String,
    max_readers: usize,
    fair: bool,
    state: Mutex<RwState>,
}

/// A shared read/write lock handle; clones refer to the same lock.
#[derive(Clone)]
pub struct SharedRwLock {
    shared: Arc<Shared>,
}

impl SharedRwLock {
    pub fn new(name: impl Into<String>, max_readers: usize, fair: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max_readers: max_readers.max(1),
                fair,
                state: Mutex::new(RwState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Acquire a read lock, waiting at most `timeout`. Succeeds immediately
    /// when no writer holds the lock and reader capacity remains; otherwise
    /// queues FIFO behind earlier readers.
    pub async fn read(&self, timeout: Duration) -> Result<ReadGuard, ExecError> {
        let (ticket, mut rx) = {
            let mut st = self.shared.state.lock();
            if !st.writer && st.readers < self.shared.max_readers {
                let epoch = st.epoch;
                Self::grant_read_now(&mut st);
                return Ok(ReadGuard {
                    shared: Arc::clone(&self.shared),
                    epoch,
                });
            }
            let (tx, rx) = oneshot::channel();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.read_queue.push_back(Waiter {
                ticket,
                enqueued_at: Instant::now(),
                tx,
            });
            (ticket, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(epoch)) => Ok(ReadGuard {
                shared: Arc::clone(&self.shared),
                epoch,
            }),
            Ok(Err(_)) => Err(self.rejected()),
            Err(_) => Err(self.read_timed_out(ticket, &mut rx, timeout)),
        }
    }

    /// Acquire the write lock, waiting at most `timeout`. Succeeds
    /// immediately only when the lock is fully unlocked.
    pub async fn write(&self, timeout: Duration) -> Result<WriteGuard, ExecError> {
        let (ticket, mut rx) = {
            let mut st = self.shared.state.lock();
            if !st.writer && st.readers == 0 && st.write_queue.is_empty() {
                let epoch = st.epoch;
                st.writer = true;
                st.writes_granted += 1;
                st.grants += 1;
                return Ok(WriteGuard {
                    shared: Arc::clone(&self.shared),
                    epoch,
                });
            }
            let (tx, rx) = oneshot::channel();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.write_queue.push_back(Waiter {
                ticket,
                enqueued_at: Instant::now(),
                tx,
            });
            (ticket, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(epoch)) => Ok(WriteGuard {
                shared: Arc::clone(&self.shared),
                epoch,
            }),
            Ok(Err(_)) => Err(self.rejected()),
            Err(_) => Err(self.write_timed_out(ticket, &mut rx, timeout)),
        }
    }

    /// Emergency escape hatch: reject every waiter and reset to unlocked.
    /// Outstanding guards become inert (their release is a no-op).
    pub fn force_release(&self) {
        let mut st = self.shared.state.lock();
        let waiting = st.read_queue.len() + st.write_queue.len();
        st.epoch += 1;
        st.readers = 0;
        st.writer = false;
        st.read_queue.clear();
        st.write_queue.clear();
        st.forced_releases += 1;
        warn!(
            lock = %self.shared.name,
            rejected_waiters = waiting,
            "Force-released read/write lock"
        );
    }

    pub fn stats(&self) -> RwLockStats {
        let st = self.shared.state.lock();
        let avg_wait_ms = if st.grants == 0 {
            0.0
        } else {
            st.total_wait.as_secs_f64() * 1000.0 / st.grants as f64
        };
        RwLockStats {
            reads_granted: st.reads_granted,
            writes_granted: st.writes_granted,
            timeouts: st.timeouts,
            forced_releases: st.forced_releases,
            avg_wait_ms,
            max_concurrent_readers: st.max_concurrent_readers,
        }
    }

    pub fn current_readers(&self) -> usize {
        self.shared.state.lock().readers
    }

    pub fn writer_held(&self) -> bool {
        self.shared.state.lock().writer
    }

    fn grant_read_now(st: &mut RwState) {
        st.readers += 1;
        st.reads_granted += 1;
        st.grants += 1;
        st.max_concurrent_readers = st.max_concurrent_readers.max(st.readers);
    }

    fn rejected(&self) -> ExecError {
        ExecError::ConcurrencyConflict {
            message: format!("lock {} force-released while waiting", self.shared.name),
        }
    }

    fn read_timed_out(
        &self,
        ticket: u64,
        rx: &mut oneshot::Receiver<u64>,
        timeout: Duration,
    ) -> ExecError {
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.read_queue.iter().position(|w| w.ticket == ticket) {
            st.read_queue.remove(pos);
        } else if let Ok(epoch) = rx.try_recv() {
            // The grant raced the timeout; roll it back.
            if epoch == st.epoch {
                st.readers = st.readers.saturating_sub(1);
                Shared::dispatch(&self.shared, &mut st);
            }
        }
        st.timeouts += 1;
        debug!(lock = %self.shared.name, "Read acquisition timed out");
        ExecError::LockTimeout {
            resource: self.shared.name.clone(),
            waited: timeout,
        }
    }

    fn write_timed_out(
        &self,
        ticket: u64,
        rx: &mut oneshot::Receiver<u64>,
        timeout: Duration,
    ) -> ExecError {
        let mut st = self.shared.state.lock();
        if let Some(pos) = st.write_queue.iter().position(|w| w.ticket == ticket) {
            st.write_queue.remove(pos);
        } else if let Ok(epoch) = rx.try_recv() {
            if epoch == st.epoch {
                st.writer = false;
                Shared::dispatch(&self.shared, &mut st);
            }
        }
        st.timeouts += 1;
        debug!(lock = %self.shared.name, "Write acquisition timed out");
        ExecError::LockTimeout {
            resource: self.shared.name.clone(),
            waited: timeout,
        }
    }
}

impl Shared {
    /// Hand the lock to queued waiters after a release. Writer queue first,
    /// oldest first; reader admission depends on fairness mode.
    fn dispatch(shared: &Arc<Shared>, st: &mut RwState) {
        while !st.writer && st.readers == 0 {
            let Some(waiter) = st.write_queue.pop_front() else {
                break;
            };
            let waited = waiter.enqueued_at.elapsed();
            st.writer = true;
            if waiter.tx.send(st.epoch).is_err() {
                // Waiter vanished (cancelled) before the grant landed.
                st.writer = false;
                continue;
            }
            st.writes_granted += 1;
            st.grants += 1;
            st.total_wait += waited;
            return;
        }

        if st.writer {
            return;
        }

        let admit_readers = st.write_queue.is_empty() || shared.fair;
        if !admit_readers {
            return;
        }

        while st.readers < shared.max_readers {
            let Some(waiter) = st.read_queue.pop_front() else {
                break;
            };
            let waited = waiter.enqueued_at.elapsed();
            st.readers += 1;
            if waiter.tx.send(st.epoch).is_err() {
                st.readers -= 1;
                continue;
            }
            st.reads_granted += 1;
            st.grants += 1;
            st.total_wait += waited;
            st.max_concurrent_readers = st.max_concurrent_readers.max(st.readers);
        }
    }
}

/// Releases one reader slot on drop. Inert after `force_release`.
pub struct ReadGuard {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        if st.epoch != self.epoch {
            return;
        }
        st.readers = st.readers.saturating_sub(1);
        Shared::dispatch(&self.shared, &mut st);
    }
}

/// Releases the writer slot on drop. Inert after `force_release`.
pub struct WriteGuard {
    shared: Arc<Shared>,
    epoch: u64,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        if st.epoch != self.epoch {
            return;
        }
        st.writer = false;
        Shared::dispatch(&self.shared, &mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const T: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn readers_up_to_capacity_succeed_without_blocking() {
        let lock = SharedRwLock::new("cap", 4, true);
        let mut guards = Vec::new();
        for _ in 0..4 {
            guards.push(lock.read(Duration::from_millis(1)).await.unwrap());
        }
        assert_eq!(lock.current_readers(), 4);
        assert_eq!(lock.stats().max_concurrent_readers, 4);
        drop(guards);
        assert_eq!(lock.current_readers(), 0);
    }

    #[tokio::test]
    async fn writer_waits_for_all_readers() {
        let lock = SharedRwLock::new("rw", 8, true);
        let r1 = lock.read(T).await.unwrap();
        let r2 = lock.read(T).await.unwrap();

        let writer_lock = lock.clone();
        let writer = tokio::spawn(async move {
            let guard = writer_lock.write(Duration::from_secs(5)).await.unwrap();
            assert_eq!(writer_lock.current_readers(), 0);
            drop(guard);
        });

        // Give the writer time to enqueue, then release readers one by one.
        tokio::task::yield_now().await;
        assert!(!lock.writer_held());
        drop(r1);
        tokio::task::yield_now().await;
        assert!(!lock.writer_held());
        drop(r2);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn write_excludes_reads_until_release() {
        let lock = SharedRwLock::new("excl", 8, true);
        let w = lock.write(T).await.unwrap();

        let reader_lock = lock.clone();
        let reader = tokio::spawn(async move {
            let _g = reader_lock.read(Duration::from_secs(5)).await.unwrap();
        });
        tokio::task::yield_now().await;
        assert_eq!(lock.current_readers(), 0);
        drop(w);
        reader.await.unwrap();
        assert_eq!(lock.stats().reads_granted, 1);
    }

    #[tokio::test]
    async fn read_timeout_cleans_up_queue_entry() {
        let lock = SharedRwLock::new("timeout", 8, true);
        let w = lock.write(T).await.unwrap();

        let err = lock
            .read(Duration::from_millis(20))
            .await
            .err()
            .expect("read must time out");
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert_eq!(lock.stats().timeouts, 1);

        // The stale queue entry must not consume the next release.
        drop(w);
        let _r = lock.read(Duration::from_millis(20)).await.unwrap();
    }

    #[tokio::test]
    async fn write_timeout_surfaces_lock_timeout() {
        let lock = SharedRwLock::new("wt", 8, true);
        let _r = lock.read(T).await.unwrap();
        let err = lock
            .write(Duration::from_millis(20))
            .await
            .err()
            .expect("write must time out");
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[tokio::test]
    async fn writers_are_served_before_queued_readers() {
        let lock = SharedRwLock::new("order", 8, false);
        let holder = lock.write(T).await.unwrap();

        let write_side = lock.clone();
        let queued_writer =
            tokio::spawn(async move { write_side.write(Duration::from_secs(5)).await.unwrap() });
        tokio::task::yield_now().await;

        let read_side = lock.clone();
        let queued_reader = tokio::spawn(async move {
            let _g = read_side.read(Duration::from_secs(5)).await.unwrap();
        });
        tokio::task::yield_now().await;

        drop(holder);
        let write_guard = queued_writer.await.unwrap();
        assert!(lock.writer_held());
        drop(write_guard);
        queued_reader.await.unwrap();
    }

    #[tokio::test]
    async fn force_release_rejects_waiters_and_resets() {
        let lock = SharedRwLock::new("force", 8, true);
        let guard = lock.write(T).await.unwrap();

        let waiting = lock.clone();
        let waiter =
            tokio::spawn(async move { waiting.read(Duration::from_secs(30)).await });
        tokio::task::yield_now().await;

        lock.force_release();
        let err = waiter
            .await
            .unwrap()
            .err()
            .expect("waiter must be rejected");
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

        // Stale guard from before the reset must not corrupt state.
        drop(guard);
        assert!(!lock.writer_held());
        let _w = lock.write(T).await.unwrap();
    }

    #[tokio::test]
    async fn stats_track_grants() {
        let lock = SharedRwLock::new("stats", 8, true);
        {
            let _r = lock.read(T).await.unwrap();
        }
        {
            let _w = lock.write(T).await.unwrap();
        }
        let stats = lock.stats();
        assert_eq!(stats.reads_granted, 1);
        assert_eq!(stats.writes_granted, 1);
        assert_eq!(stats.timeouts, 0);
    }
}
