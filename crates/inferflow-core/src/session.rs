//! Per-client session handles and result observation.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BatchStrategy;
use crate::executor::Executor;
use crate::package::{Package, TaskDesc};
use crate::request::{RequestControl, ResponseFn};
use crate::status::Status;

/// Opaque client context echoed back through [`Observer::notify`].
pub type UserData = Option<Box<dyn Any + Send>>;

/// Receiver of asynchronous results. A session with an observer is async;
/// one without is sync and must be driven through `request_sync`.
pub trait Observer: Send + Sync {
    fn notify(&self, status: Status, output: Package, user_data: UserData);
}

/// Wall-time statistics for one pipeline stage, per item.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PerfStatistic {
    pub count: usize,
    pub total_ms: f64,
    pub min_ms: f32,
    pub max_ms: f32,
}

impl PerfStatistic {
    fn record(&mut self, ms: f32) {
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count += 1;
        self.total_ms += f64::from(ms);
    }

    #[must_use]
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// A client's handle onto one executor.
///
/// Tracks in-flight requests by dense per-session request id, so whole tags
/// can be awaited or discarded.
pub struct Session {
    name: String,
    executor: Arc<Executor>,
    observer: Option<Arc<dyn Observer>>,
    show_perf: bool,
    /// Back-reference handed to request callbacks, so a completed request
    /// can unregister itself without keeping the session alive.
    weak_self: Weak<Session>,
    request_seq: AtomicI64,
    ctrls: Mutex<HashMap<i64, Arc<RequestControl>>>,
    ctrl_cond: Condvar,
    perf: Mutex<HashMap<String, PerfStatistic>>,
}

impl Session {
    pub(crate) fn new(
        name: String,
        executor: Arc<Executor>,
        observer: Option<Arc<dyn Observer>>,
        show_perf: bool,
    ) -> Arc<Session> {
        Arc::new_cyclic(|weak_self| Session {
            name,
            executor,
            observer,
            show_perf,
            weak_self: weak_self.clone(),
            request_seq: AtomicI64::new(0),
            ctrls: Mutex::new(HashMap::new()),
            ctrl_cond: Condvar::new(),
            perf: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sync sessions have no observer and are driven via `request_sync`.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.observer.is_none()
    }

    pub(crate) fn observer(&self) -> Option<Arc<dyn Observer>> {
        self.observer.clone()
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// In-flight request count, all tags.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.ctrls.lock().len()
    }

    /// Attach a control to every item and hand the package to the executor's
    /// cache. Returns the control for caller-side cancellation, or `None`
    /// when the package is rejected.
    pub(crate) fn send(
        &self,
        mut pack: Package,
        response: ResponseFn,
    ) -> Option<Arc<RequestControl>> {
        if pack.data.is_empty() {
            warn!(session = %self.name, "rejecting empty package");
            return None;
        }
        if pack.data_num > pack.data.len()
            && self.executor.batch_strategy() != BatchStrategy::Static
        {
            warn!(
                session = %self.name,
                "continuous packages require the static batch strategy"
            );
            return None;
        }
        let request_id = self.request_seq.fetch_add(1, Ordering::AcqRel);
        let data_num = pack.data_num.max(pack.data.len());
        let response = self.wrap_perf(response);
        let done = {
            let session = self.weak_self.clone();
            Box::new(move || {
                if let Some(session) = session.upgrade() {
                    session.unregister(request_id);
                }
            })
        };
        let ctrl = Arc::new(RequestControl::new(
            request_id,
            pack.tag.clone(),
            data_num,
            response,
            done,
        ));
        for (index, item) in pack.data.iter_mut().enumerate() {
            item.desc = Some(TaskDesc {
                ctrl: ctrl.clone(),
                index,
            });
        }
        self.ctrls.lock().insert(request_id, ctrl.clone());
        if !self.executor.push(pack) {
            self.ctrls.lock().remove(&request_id);
            warn!(session = %self.name, "executor rejected request, cache stopped");
            return None;
        }
        Some(ctrl)
    }

    fn wrap_perf(&self, response: ResponseFn) -> ResponseFn {
        if !self.show_perf {
            return response;
        }
        let session = self.weak_self.clone();
        Box::new(move |status, pack: Package| {
            if let Some(session) = session.upgrade() {
                session.record_perf(&pack.perf);
            }
            response(status, pack);
        })
    }

    fn record_perf(&self, perf: &HashMap<String, f32>) {
        let mut stats = self.perf.lock();
        for (stage, ms) in perf {
            stats.entry(stage.clone()).or_default().record(*ms);
        }
    }

    fn unregister(&self, request_id: i64) {
        self.ctrls.lock().remove(&request_id);
        self.ctrl_cond.notify_all();
    }

    /// Block until no request with this tag is outstanding.
    pub fn wait_task_done(&self, tag: &str) {
        let mut ctrls = self.ctrls.lock();
        while ctrls.values().any(|ctrl| ctrl.tag() == tag) {
            self.ctrl_cond.wait(&mut ctrls);
        }
    }

    /// Mark every outstanding request with this tag discarded. Idempotent;
    /// cached items are reclaimed by the next cache sweep.
    pub fn discard_task(&self, tag: &str) {
        let matching: Vec<Arc<RequestControl>> = self
            .ctrls
            .lock()
            .values()
            .filter(|ctrl| ctrl.tag() == tag)
            .cloned()
            .collect();
        for ctrl in matching {
            ctrl.discard();
        }
    }

    /// Per-stage timing statistics; empty unless the session was created
    /// with `show_perf`.
    #[must_use]
    pub fn performance(&self) -> HashMap<String, PerfStatistic> {
        self.perf.lock().clone()
    }

    /// Backpressure helper, see the facade request paths.
    pub(crate) fn wait_if_cache_full(&self, timeout: Option<Duration>) -> bool {
        self.executor.wait_if_cache_full(timeout)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("sync", &self.is_sync())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
