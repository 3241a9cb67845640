//! Worker pool management
//!
//! Pools are expensive to start, so the manager keeps them keyed by
//! `(executor kind, worker count)` and hands them out one acquirer at a
//! time. Released pools stay warm until `close_idle` evicts them; the
//! planner asks for the warm set to zero out spawn cost in its predictions.

pub mod process;
pub mod protocol;
pub mod thread;

use crate::config::ExecutorKind;
use process::ProcessPool;
use protocol::ProtocolError;
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment marker set on worker processes (inherited by descendants)
pub const WORKER_ENV: &str = "AMORSIZE_WORKER";

/// Pools idle longer than this are closed by `close_idle`
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

thread_local! {
    static IN_POOL_WORKER: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn set_worker_marker(value: bool) {
    IN_POOL_WORKER.with(|marker| marker.set(value));
}

/// True when the current context is inside a pool worker
///
/// Covers both worker threads (thread-local marker) and worker processes
/// (environment marker), so nested planning can be detected either way.
pub fn in_worker() -> bool {
    if IN_POOL_WORKER.with(|marker| marker.get()) {
        return true;
    }
    std::env::var(WORKER_ENV).map(|v| v == "1").unwrap_or(false)
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker reported failure: {0}")]
    Worker(String),
    #[error("pool is closed")]
    Closed,
    #[error("worker did not respond within the grace period")]
    Timeout,
    #[error("serial plans do not use pools")]
    SerialKind,
}

/// Identity of a reusable pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: ExecutorKind,
    pub workers: usize,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.kind, self.workers)
    }
}

/// A pool of either flavour
#[derive(Debug)]
pub enum WorkerPool {
    Threads(thread::ThreadPool),
    Processes(ProcessPool),
}

impl WorkerPool {
    fn new(key: PoolKey) -> Result<Self, PoolError> {
        match key.kind {
            ExecutorKind::Thread => Ok(WorkerPool::Threads(thread::ThreadPool::new(key.workers)?)),
            ExecutorKind::Process => {
                Ok(WorkerPool::Processes(ProcessPool::new(key.workers)?))
            }
            ExecutorKind::Serial => Err(PoolError::SerialKind),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self {
            WorkerPool::Threads(pool) => pool.worker_count(),
            WorkerPool::Processes(pool) => pool.worker_count(),
        }
    }

    fn close(&mut self, grace: Duration) {
        match self {
            WorkerPool::Threads(pool) => pool.shutdown(),
            WorkerPool::Processes(pool) => pool.shutdown(grace),
        }
    }
}

struct PoolSlot {
    id: u64,
    pool: Arc<Mutex<WorkerPool>>,
    last_used: Instant,
    in_use: bool,
}

#[derive(Default)]
struct ManagerState {
    slots: HashMap<PoolKey, Vec<PoolSlot>>,
    next_id: u64,
}

/// Keyed, reusable pools with idle eviction
pub struct PoolManager {
    state: Arc<Mutex<ManagerState>>,
    idle_timeout: Duration,
}

/// Exclusive borrow of one pool; releasing (or dropping) returns it warm
pub struct PoolHandle {
    key: PoolKey,
    slot_id: u64,
    pool: Arc<Mutex<WorkerPool>>,
    state: Arc<Mutex<ManagerState>>,
    discard: bool,
}

impl PoolHandle {
    pub fn key(&self) -> PoolKey {
        self.key
    }

    /// The pool itself; the handle is the single acquirer, so locking
    /// never contends with another dispatcher.
    pub fn pool(&self) -> &Arc<Mutex<WorkerPool>> {
        &self.pool
    }

    /// Drop the pool from the manager instead of returning it warm
    ///
    /// Required after force-terminating workers: a half-dead pool must not
    /// be handed to the next acquirer.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(slots) = state.slots.get_mut(&self.key) {
                if self.discard {
                    slots.retain(|slot| slot.id != self.slot_id);
                } else if let Some(slot) = slots.iter_mut().find(|slot| slot.id == self.slot_id) {
                    slot.in_use = false;
                    slot.last_used = Instant::now();
                }
            }
        }
    }
}

impl PoolManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState::default())),
            idle_timeout,
        }
    }

    /// Borrow an idle pool for `key`, creating one when none is free
    ///
    /// A pool is never handed to two concurrent acquirers; a busy key gets
    /// a fresh pool that joins the reuse set on release.
    pub fn acquire(&self, key: PoolKey) -> Result<PoolHandle, PoolError> {
        {
            let mut state = self.state.lock().expect("pool manager poisoned");
            if let Some(slots) = state.slots.get_mut(&key) {
                if let Some(slot) = slots.iter_mut().find(|slot| !slot.in_use) {
                    slot.in_use = true;
                    slot.last_used = Instant::now();
                    return Ok(PoolHandle {
                        key,
                        slot_id: slot.id,
                        pool: Arc::clone(&slot.pool),
                        state: Arc::clone(&self.state),
                        discard: false,
                    });
                }
            }
        }

        // Build outside the lock: spawning workers can take a while
        let pool = Arc::new(Mutex::new(WorkerPool::new(key)?));
        let mut state = self.state.lock().expect("pool manager poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.slots.entry(key).or_default().push(PoolSlot {
            id,
            pool: Arc::clone(&pool),
            last_used: Instant::now(),
            in_use: true,
        });
        Ok(PoolHandle {
            key,
            slot_id: id,
            pool,
            state: Arc::clone(&self.state),
            discard: false,
        })
    }

    /// Return a pool to the warm set (equivalent to dropping the handle)
    pub fn release(&self, handle: PoolHandle) {
        drop(handle);
    }

    /// Keys with at least one idle pool, for spawn-cost amortisation
    pub fn warm_keys(&self) -> Vec<PoolKey> {
        let state = self.state.lock().expect("pool manager poisoned");
        let mut keys: Vec<PoolKey> = state
            .slots
            .iter()
            .filter(|(_, slots)| slots.iter().any(|slot| !slot.in_use))
            .map(|(key, _)| *key)
            .collect();
        keys.sort_by_key(|key| (key.workers, key.kind as usize));
        keys
    }

    /// Close pools idle since before `now - idle_timeout`; returns how many
    pub fn close_idle(&self, now: Instant) -> usize {
        let mut closed = 0;
        let mut state = self.state.lock().expect("pool manager poisoned");
        let timeout = self.idle_timeout;
        for slots in state.slots.values_mut() {
            slots.retain(|slot| {
                let evict = !slot.in_use
                    && now.saturating_duration_since(slot.last_used) > timeout;
                if evict {
                    if let Ok(mut pool) = slot.pool.lock() {
                        pool.close(Duration::from_secs(1));
                    }
                    closed += 1;
                }
                !evict
            });
        }
        state.slots.retain(|_, slots| !slots.is_empty());
        closed
    }

    /// Close every pool, in use or not
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("pool manager poisoned");
        for slots in state.slots.values_mut() {
            for slot in slots.iter_mut() {
                if let Ok(mut pool) = slot.pool.lock() {
                    pool.close(Duration::from_secs(1));
                }
            }
        }
        state.slots.clear();
    }
}

/// The process-wide manager used by the executor and planner
pub fn manager() -> &'static PoolManager {
    static MANAGER: OnceLock<PoolManager> = OnceLock::new();
    MANAGER.get_or_init(|| PoolManager::new(DEFAULT_IDLE_TIMEOUT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_key(workers: usize) -> PoolKey {
        PoolKey {
            kind: ExecutorKind::Thread,
            workers,
        }
    }

    #[test]
    fn test_acquire_release_reuses_pool() {
        let manager = PoolManager::new(Duration::from_secs(60));
        let handle = manager.acquire(thread_key(2)).unwrap();
        let pool_ptr = Arc::as_ptr(handle.pool());
        manager.release(handle);

        assert_eq!(manager.warm_keys(), vec![thread_key(2)]);
        let handle = manager.acquire(thread_key(2)).unwrap();
        assert_eq!(Arc::as_ptr(handle.pool()), pool_ptr);
    }

    #[test]
    fn test_concurrent_acquirers_get_distinct_pools() {
        let manager = PoolManager::new(Duration::from_secs(60));
        let first = manager.acquire(thread_key(1)).unwrap();
        let second = manager.acquire(thread_key(1)).unwrap();
        assert_ne!(Arc::as_ptr(first.pool()), Arc::as_ptr(second.pool()));
        // While both are out, nothing is warm
        assert!(manager.warm_keys().is_empty());
        drop(first);
        drop(second);
        assert_eq!(manager.warm_keys(), vec![thread_key(1)]);
    }

    #[test]
    fn test_close_idle_evicts_only_stale_pools() {
        let manager = PoolManager::new(Duration::from_millis(10));
        let handle = manager.acquire(thread_key(1)).unwrap();
        drop(handle);

        // Too soon: nothing to evict
        assert_eq!(manager.close_idle(Instant::now()), 0);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(manager.close_idle(Instant::now()), 1);
        assert!(manager.warm_keys().is_empty());
    }

    #[test]
    fn test_busy_pools_survive_close_idle() {
        let manager = PoolManager::new(Duration::from_millis(1));
        let handle = manager.acquire(thread_key(1)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(manager.close_idle(Instant::now()), 0);
        drop(handle);
    }

    #[test]
    fn test_shutdown_clears_everything() {
        let manager = PoolManager::new(Duration::from_secs(60));
        let handle = manager.acquire(thread_key(1)).unwrap();
        drop(handle);
        let handle = manager.acquire(thread_key(2)).unwrap();
        drop(handle);
        manager.shutdown();
        assert!(manager.warm_keys().is_empty());
    }

    #[test]
    fn test_serial_kind_has_no_pool() {
        let manager = PoolManager::new(Duration::from_secs(60));
        let result = manager.acquire(PoolKey {
            kind: ExecutorKind::Serial,
            workers: 1,
        });
        assert!(matches!(result, Err(PoolError::SerialKind)));
    }

    #[test]
    fn test_in_worker_defaults_false() {
        assert!(!in_worker());
    }
}
