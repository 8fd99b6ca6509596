//! Bounded producer/consumer queue of packages with pluggable batching.
//!
//! Three strategies share one core: a time-windowed coalescing cache
//! (dynamic), a split-only cache (static) and an arrival-ordered cache
//! (sequence). Producers never block on `push`; `wait_if_full` is the
//! backpressure knob. Every `pop` reclaims discarded items before handing
//! out a live package.

mod dynamic;
mod sequence;
mod static_cache;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::BatchStrategy;
use crate::package::Package;
use crate::priority::Priority;

pub(crate) use dynamic::DynamicCache;
pub(crate) use sequence::SequenceCache;
pub(crate) use static_cache::StaticCache;

/// Queue bound, in packages. Producers past this wait in `wait_if_full`.
pub(crate) const DEFAULT_CACHE_CAPACITY: usize = 10;

/// State shared by every strategy.
pub(crate) struct CacheCore {
    queue: Mutex<VecDeque<Package>>,
    cond: Condvar,
    capacity: usize,
    batch_size: usize,
    priority: Priority,
    running: AtomicBool,
}

impl CacheCore {
    fn new(capacity: usize, batch_size: usize, priority: Priority) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity: capacity.max(1),
            batch_size: batch_size.max(1),
            priority,
            running: AtomicBool::new(false),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Append a ready package and wake one consumer.
    fn push_package(&self, pack: Package) {
        self.queue.lock().push_back(pack);
        self.cond.notify_all();
    }
}

/// One batching strategy over the shared core.
///
/// Strategies provide admission (`enqueue`), descriptor migration
/// (`prepare`) and discard reclamation (`sweep`); the blocking contract
/// lives in the provided methods.
pub(crate) trait PackageCache: Send + Sync {
    fn core(&self) -> &CacheCore;

    /// Admit an incoming package: batch, split or forward it.
    fn enqueue(&self, pack: Package);

    /// Migrate descriptors off the items once the package is scheduled.
    fn prepare(&self, pack: &mut Package);

    /// Reclaim discarded items. Called with the queue lock held, only when
    /// the head package references a discarded request.
    fn sweep(&self, queue: &mut VecDeque<Package>);

    fn start(&self) {
        self.core().running.store(true, Ordering::Release);
    }

    fn stop(&self) {
        self.core().running.store(false, Ordering::Release);
        self.core().cond.notify_all();
    }

    /// Never blocks. Returns `false` once the cache is stopped.
    fn push(&self, pack: Package) -> bool {
        if !self.core().running() {
            return false;
        }
        self.enqueue(pack);
        true
    }

    /// Block until a package is available, or the cache is stopped and
    /// drained (`None`).
    fn pop(&self) -> Option<Package> {
        let core = self.core();
        let mut queue = core.queue.lock();
        loop {
            while queue.is_empty() {
                if !core.running() {
                    return None;
                }
                core.cond.wait(&mut queue);
            }
            if queue.front().is_some_and(Package::any_discarded) {
                self.sweep(&mut queue);
            }
            let Some(mut pack) = queue.pop_front() else {
                continue;
            };
            drop(queue);
            core.cond.notify_all();
            self.prepare(&mut pack);
            return Some(pack);
        }
    }

    /// Producer backpressure: wait until the queue has room. Returns `false`
    /// when still full after `timeout`.
    fn wait_if_full(&self, timeout: Option<Duration>) -> bool {
        let core = self.core();
        let mut queue = core.queue.lock();
        match timeout {
            Some(limit) => {
                let deadline = Instant::now() + limit;
                while queue.len() >= core.capacity && core.running() {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let _ = core.cond.wait_for(&mut queue, deadline - now);
                }
                true
            }
            None => {
                while queue.len() >= core.capacity && core.running() {
                    core.cond.wait(&mut queue);
                }
                true
            }
        }
    }
}

/// Build the cache for one executor.
pub(crate) fn create_cache(
    strategy: BatchStrategy,
    capacity: usize,
    batch_size: usize,
    priority: Priority,
    batch_timeout_ms: u64,
) -> Arc<dyn PackageCache> {
    match strategy {
        BatchStrategy::Dynamic => Arc::new(DynamicCache::new(
            capacity,
            batch_size,
            priority,
            batch_timeout_ms,
        )),
        BatchStrategy::Static => Arc::new(StaticCache::new(capacity, batch_size, priority)),
        BatchStrategy::Sequence => Arc::new(SequenceCache::new(capacity, batch_size, priority)),
    }
}
