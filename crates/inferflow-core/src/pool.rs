//! Priority-ordered worker pool.
//!
//! The pool is the only place work executes; every other component schedules
//! into it. Tasks dispatch smallest effective priority first, FIFO among
//! equals (a global sequence number breaks ties). Workers optionally run an
//! init hook before serving — binding an accelerator device context — and
//! exit if it fails; the next `resize` replaces them.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

/// Worker init hook. Returning `false` makes the worker exit without
/// serving.
pub type WorkerInitFn = Arc<dyn Fn() -> bool + Send + Sync>;

type Job = Box<dyn FnOnce() + Send>;

struct PoolTask {
    priority: i64,
    seq: u64,
    job: Job,
}

impl PartialEq for PoolTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PoolTask {}

impl PartialOrd for PoolTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PoolTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: reverse so the smallest (priority, seq)
        // pops first.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<PoolTask>>,
    cond: Condvar,
    running: AtomicBool,
    /// Desired worker count; shrinking is lazy (excess workers exit on next
    /// wake).
    target: AtomicUsize,
    alive: AtomicUsize,
    idle: AtomicUsize,
    seq: AtomicU64,
    init: Option<WorkerInitFn>,
}

/// Fixed-or-resizable pool of OS worker threads over one priority queue.
pub struct PriorityThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PriorityThreadPool {
    #[must_use]
    pub fn new(init: Option<WorkerInitFn>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(BinaryHeap::new()),
                cond: Condvar::new(),
                running: AtomicBool::new(true),
                target: AtomicUsize::new(0),
                alive: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                init,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue a task. Lower numeric priority dispatches first.
    pub fn push(&self, priority: i64, job: Job) {
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.lock().push(PoolTask { priority, seq, job });
        self.shared.cond.notify_one();
    }

    /// Grow or shrink the worker count. Growth spawns immediately; shrink is
    /// lazy: surplus workers exit the next time they would go idle.
    pub fn resize(&self, n: usize) {
        self.shared.target.store(n, Ordering::Release);
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        let alive = self.shared.alive.load(Ordering::Acquire);
        if n > alive {
            for _ in 0..(n - alive) {
                self.shared.alive.fetch_add(1, Ordering::AcqRel);
                let shared = self.shared.clone();
                let spawned = std::thread::Builder::new()
                    .name("inferflow-worker".into())
                    .spawn(move || Self::worker_main(&shared));
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => {
                        self.shared.alive.fetch_sub(1, Ordering::AcqRel);
                        error!("failed to spawn pool worker: {e}");
                    }
                }
            }
        } else {
            self.shared.cond.notify_all();
        }
        debug!(target = n, alive = self.shared.alive.load(Ordering::Acquire), "pool resized");
    }

    /// Current worker count (excluding workers whose init hook failed).
    #[must_use]
    pub fn size(&self) -> usize {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Workers currently blocked on the queue.
    #[must_use]
    pub fn idle_number(&self) -> usize {
        self.shared.idle.load(Ordering::Acquire)
    }

    fn worker_main(shared: &PoolShared) {
        if let Some(init) = &shared.init {
            if !init() {
                error!("worker init hook failed, worker exits");
                shared.alive.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        }
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if !shared.running.load(Ordering::Acquire) {
                        break None;
                    }
                    if let Some(task) = queue.pop() {
                        break Some(task.job);
                    }
                    let alive = shared.alive.load(Ordering::Acquire);
                    if alive > shared.target.load(Ordering::Acquire) {
                        // Lazy shrink: retire instead of idling. The CAS keeps
                        // concurrent retirees from undershooting the target.
                        if shared
                            .alive
                            .compare_exchange(alive, alive - 1, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                        {
                            return;
                        }
                        continue;
                    }
                    shared.idle.fetch_add(1, Ordering::AcqRel);
                    shared.cond.wait(&mut queue);
                    shared.idle.fetch_sub(1, Ordering::AcqRel);
                }
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        shared.alive.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for PriorityThreadPool {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.cond.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_then_fifo_order() {
        let pool = PriorityThreadPool::new(None);
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        // Single worker, blocked on a gate so the queue fills before any
        // ordering-relevant task runs.
        pool.resize(1);
        let gate_task = gate.clone();
        pool.push(
            i64::MIN,
            Box::new(move || {
                let mut open = gate_task.0.lock();
                while !*open {
                    gate_task.1.wait(&mut open);
                }
            }),
        );

        for (priority, id) in [(5i64, 50u32), (1, 10), (5, 51), (1, 11), (0, 0)] {
            let order = order.clone();
            pool.push(priority, Box::new(move || order.lock().push(id)));
        }

        *gate.0.lock() = true;
        gate.1.notify_all();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(order.lock().as_slice(), &[0, 10, 11, 50, 51]);
    }

    #[test]
    fn test_resize_grows_and_shrinks_lazily() {
        let pool = PriorityThreadPool::new(None);
        pool.resize(4);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.idle_number() < 4 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(pool.size(), 4);

        pool.resize(1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.size() > 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_failed_init_shrinks_pool_until_resize() {
        let fail_one = Arc::new(AtomicBool::new(true));
        let init_flag = fail_one.clone();
        let init: WorkerInitFn = Arc::new(move || !init_flag.swap(false, Ordering::SeqCst));

        let pool = PriorityThreadPool::new(Some(init));
        pool.resize(8);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.idle_number() < 7 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        // One worker's init failed; the remaining seven still serve.
        assert_eq!(pool.size(), 7);
        assert!(pool.idle_number() <= 7);

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let done = done.clone();
            pool.push(
                0,
                Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 32 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(done.load(Ordering::SeqCst), 32);

        // The next resize restores capacity.
        pool.resize(8);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.size() < 8 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(pool.size(), 8);
    }
}
