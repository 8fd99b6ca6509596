//! Timer-bounded accumulator turning item streams into fixed-size batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

/// Sink invoked with every emitted batch.
pub type BatchSink<T> = Arc<dyn Fn(Vec<T>) + Send + Sync>;

struct BatchState<T> {
    items: Vec<T>,
    /// Arrival time of the oldest pending item; the timer emits a partial
    /// batch no later than `timeout` after it.
    first_at: Option<Instant>,
}

struct BatcherInner<T> {
    state: Mutex<BatchState<T>>,
    cond: Condvar,
    sink: BatchSink<T>,
    batch_size: usize,
    timeout: Duration,
    running: AtomicBool,
}

impl<T> BatcherInner<T> {
    /// Drain everything pending in `batch_size` chunks. The lock stays held
    /// across the sink calls so emission order matches arrival order even
    /// with concurrent producers; the sink must not call back into the
    /// batcher.
    fn emit_locked(&self, st: &mut BatchState<T>) {
        while !st.items.is_empty() {
            let n = st.items.len().min(self.batch_size);
            let batch: Vec<T> = st.items.drain(..n).collect();
            (self.sink)(batch);
        }
        st.first_at = None;
    }

    fn flush(&self) {
        let mut st = self.state.lock();
        self.emit_locked(&mut st);
    }
}

/// Accumulates items and emits batches of `batch_size`, or partial batches
/// once the oldest pending item has waited `timeout`.
///
/// Every accepted item is emitted exactly once. The owner must flush
/// (`emit`) before dropping the batcher.
pub struct Batcher<T: Send + 'static> {
    inner: Arc<BatcherInner<T>>,
    timer: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Batcher<T> {
    #[must_use]
    pub fn new(sink: BatchSink<T>, timeout_ms: u64, batch_size: usize) -> Self {
        let inner = Arc::new(BatcherInner {
            state: Mutex::new(BatchState {
                items: Vec::new(),
                first_at: None,
            }),
            cond: Condvar::new(),
            sink,
            batch_size: batch_size.max(1),
            timeout: Duration::from_millis(timeout_ms.max(1)),
            running: AtomicBool::new(true),
        });
        let timer_inner = inner.clone();
        let timer = std::thread::Builder::new()
            .name("batcher-timer".into())
            .spawn(move || Self::timer_main(&timer_inner))
            .ok();
        if timer.is_none() {
            error!("failed to spawn batcher timer thread, partial batches will not flush");
        }
        Self { inner, timer }
    }

    fn timer_main(inner: &BatcherInner<T>) {
        loop {
            let due = {
                let mut st = inner.state.lock();
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                match st.first_at {
                    None => {
                        inner.cond.wait(&mut st);
                        false
                    }
                    Some(first_at) => {
                        let deadline = first_at + inner.timeout;
                        let now = Instant::now();
                        if now >= deadline {
                            true
                        } else {
                            let _ = inner.cond.wait_for(&mut st, deadline - now);
                            false
                        }
                    }
                }
            };
            if due {
                inner.flush();
            }
        }
    }

    /// Append one item; emits a full batch synchronously when `batch_size`
    /// is reached.
    pub fn add(&self, item: T) {
        let mut st = self.inner.state.lock();
        st.items.push(item);
        if st.first_at.is_none() {
            st.first_at = Some(Instant::now());
            self.inner.cond.notify_all();
        }
        if st.items.len() >= self.inner.batch_size {
            self.inner.emit_locked(&mut st);
        }
    }

    /// Force-flush pending items. Idempotent.
    pub fn emit(&self) {
        self.inner.flush();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        let pending = self.len();
        if pending != 0 {
            error!(pending, "batcher dropped with pending items, owner must emit first");
            debug_assert_eq!(pending, 0, "batcher dropped with pending items");
        }
    }
}
