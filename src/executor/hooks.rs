//! Execution hooks
//!
//! Callers can observe execution through registered callbacks. Callbacks
//! are infallible from the core's point of view: invocation is wrapped in
//! a catch-and-log boundary, so a panicking hook never aborts the run.
//! When nothing is registered the fast path is a single atomic load.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Observable moments during planning and execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlanDecided,
    ChunkDone,
    Progress,
    Error,
}

/// What a hook sees
#[derive(Debug, Clone)]
pub struct HookPayload {
    pub kind: EventKind,
    pub fingerprint: Option<String>,
    pub chunk_index: Option<usize>,
    /// Items completed so far
    pub items_done: usize,
    pub count_total: Option<usize>,
    pub message: Option<String>,
}

impl HookPayload {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            fingerprint: None,
            chunk_index: None,
            items_done: 0,
            count_total: None,
            message: None,
        }
    }
}

pub type Hook = Arc<dyn Fn(&HookPayload) + Send + Sync>;

/// Per-execution hook registry
///
/// Registration takes the lock; invocation does not, so hooks must be safe
/// to call concurrently.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<HashMap<EventKind, Vec<Hook>>>,
    any_registered: AtomicBool,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("any_registered", &self.any_registered.load(Ordering::Relaxed))
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: EventKind, hook: F)
    where
        F: Fn(&HookPayload) + Send + Sync + 'static,
    {
        let mut hooks = self.hooks.lock().expect("hook registry poisoned");
        hooks.entry(kind).or_default().push(Arc::new(hook));
        self.any_registered.store(true, Ordering::Release);
    }

    /// Zero-cost check for the fast path: no hooks, no bookkeeping
    #[inline]
    pub fn active(&self) -> bool {
        self.any_registered.load(Ordering::Acquire)
    }

    /// Invoke every hook for the payload's kind, isolating panics
    pub fn emit(&self, payload: &HookPayload) {
        if !self.active() {
            return;
        }
        let hooks: Vec<Hook> = {
            let map = self.hooks.lock().expect("hook registry poisoned");
            match map.get(&payload.kind) {
                Some(hooks) => hooks.clone(),
                None => return,
            }
        };
        for hook in hooks {
            if catch_unwind(AssertUnwindSafe(|| hook(payload))).is_err() {
                tracing::warn!(kind = ?payload.kind, "hook panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_inactive_registry_skips_bookkeeping() {
        let registry = HookRegistry::new();
        assert!(!registry.active());
        // Emitting with no hooks is a no-op
        registry.emit(&HookPayload::new(EventKind::Progress));
    }

    #[test]
    fn test_hooks_fire_for_their_kind_only() {
        let registry = HookRegistry::new();
        let progress = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&progress);
        registry.register(EventKind::Progress, move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        let count = Arc::clone(&errors);
        registry.register(EventKind::Error, move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });

        registry.emit(&HookPayload::new(EventKind::Progress));
        registry.emit(&HookPayload::new(EventKind::Progress));
        assert_eq!(progress.load(Ordering::Relaxed), 2);
        assert_eq!(errors.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_panicking_hook_does_not_abort() {
        let registry = HookRegistry::new();
        let reached = Arc::new(AtomicUsize::new(0));

        registry.register(EventKind::ChunkDone, |_| panic!("bad hook"));
        let count = Arc::clone(&reached);
        registry.register(EventKind::ChunkDone, move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });

        registry.emit(&HookPayload::new(EventKind::ChunkDone));
        // The hook after the panicking one still ran
        assert_eq!(reached.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_payload_reaches_hooks() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        registry.register(EventKind::ChunkDone, move |payload| {
            *slot.lock().unwrap() = Some((payload.chunk_index, payload.items_done));
        });

        let mut payload = HookPayload::new(EventKind::ChunkDone);
        payload.chunk_index = Some(3);
        payload.items_done = 80;
        registry.emit(&payload);

        assert_eq!(*seen.lock().unwrap(), Some((Some(3), 80)));
    }
}
