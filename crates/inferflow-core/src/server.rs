//! The per-device facade.
//!
//! One shared context per `device_id`, created on first use: it owns the
//! priority thread pool (whose workers bind the device context at startup)
//! and the executor map deduplicating executors by signature. Lock order is
//! facade context map, then executor map, then pool.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SessionDesc;
use crate::device;
use crate::executor::Executor;
use crate::model::{Model, ModelManager};
use crate::package::Package;
use crate::pool::{PriorityThreadPool, WorkerInitFn};
use crate::processor::Passthrough;
use crate::request::ResponseFn;
use crate::session::{Observer, PerfStatistic, Session, UserData};
use crate::status::{Error, Result, Status};

/// Pool growth per engine when an executor is created.
const POOL_GROW_PER_ENGINE: usize = 3;
/// Pool shrink per engine when an executor is destroyed. Smaller than the
/// growth step so warm workers survive executor churn.
const POOL_SHRINK_PER_ENGINE: usize = 2;

struct ServerContext {
    device_id: usize,
    pool: Arc<PriorityThreadPool>,
    executors: Mutex<HashMap<String, Arc<Executor>>>,
    /// Serializes resize decisions so grow/shrink cannot interleave.
    pool_lock: Mutex<()>,
}

fn contexts() -> &'static Mutex<HashMap<usize, Arc<ServerContext>>> {
    static CONTEXTS: OnceLock<Mutex<HashMap<usize, Arc<ServerContext>>>> = OnceLock::new();
    CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl ServerContext {
    fn instance(device_id: usize) -> Option<Arc<ServerContext>> {
        if !device::check_device(device_id) {
            warn!(device_id, "unknown device id");
            return None;
        }
        let mut map = contexts().lock();
        let ctx = map
            .entry(device_id)
            .or_insert_with(|| {
                let init: WorkerInitFn = Arc::new(move || device::bind_device(device_id));
                info!("🏗️ SERVER: creating device context - device_id={device_id}");
                Arc::new(ServerContext {
                    device_id,
                    pool: Arc::new(PriorityThreadPool::new(Some(init))),
                    executors: Mutex::new(HashMap::new()),
                    pool_lock: Mutex::new(()),
                })
            })
            .clone();
        Some(ctx)
    }

    fn get_or_create_executor(&self, desc: &SessionDesc, signature: &str) -> Result<Arc<Executor>> {
        let mut executors = self.executors.lock();
        if let Some(existing) = executors.get(signature) {
            debug!(signature, "executor already exists");
            return Ok(existing.clone());
        }
        info!("🏗️ SERVER: creating executor - signature={signature}");
        let executor = Executor::new(desc, self.pool.clone(), self.device_id, signature.to_string())?;
        executors.insert(signature.to_string(), executor.clone());
        drop(executors);

        let _guard = self.pool_lock.lock();
        let current = self.pool.size();
        let max_workers = POOL_GROW_PER_ENGINE * num_cpus::get();
        if current < max_workers {
            let grown = current + POOL_GROW_PER_ENGINE * executor.engine_num();
            self.pool.resize(grown.min(max_workers));
        }
        Ok(executor)
    }
}

/// Per-device entry point: sessions, requests, models.
///
/// Cheap to construct; every instance for one `device_id` shares the same
/// underlying context.
pub struct InferServer {
    ctx: Arc<ServerContext>,
}

impl InferServer {
    /// `None` when the device id is rejected by the installed device hooks.
    #[must_use]
    pub fn new(device_id: usize) -> Option<Self> {
        ServerContext::instance(device_id).map(|ctx| Self { ctx })
    }

    #[must_use]
    pub fn device_id(&self) -> usize {
        self.ctx.device_id
    }

    /// Open a session. Sessions with identical signatures share an executor.
    /// Passing an observer makes the session asynchronous.
    pub fn create_session(
        &self,
        mut desc: SessionDesc,
        observer: Option<Arc<dyn Observer>>,
    ) -> Result<Arc<Session>> {
        if desc.model.is_none() {
            return Err(Error::InvalidParam("model is required".into()));
        }
        if desc.preproc.is_none() {
            return Err(Error::InvalidParam("preproc is required".into()));
        }
        if desc.batch_size == 0 {
            return Err(Error::InvalidParam("batch_size must be >= 1".into()));
        }
        if desc.engine_num == 0 {
            return Err(Error::InvalidParam("engine_num must be >= 1".into()));
        }
        if desc.postproc.is_none() {
            warn!("postprocessor not set, forwarding model outputs verbatim");
            desc.postproc = Some(Arc::new(Passthrough));
        }
        let signature = desc.signature();
        if desc.name.is_empty() {
            desc.name = signature.clone();
        }
        let executor = self.ctx.get_or_create_executor(&desc, &signature)?;
        let session = Session::new(desc.name.clone(), executor.clone(), observer, desc.show_perf);
        executor.link(&session);
        info!(session = %desc.name, signature, "session created");
        Ok(session)
    }

    /// Unlink the session; tears the executor down (blocking until its
    /// in-flight work drains) when this was the last session on it.
    pub fn destroy_session(&self, session: &Arc<Session>) -> bool {
        let executor = session.executor().clone();
        let last = {
            let mut executors = self.ctx.executors.lock();
            if !executors.contains_key(executor.name()) {
                warn!(session = %session.name(), "session does not belong to this server");
                return false;
            }
            executor.unlink(session);
            if executor.session_num() == 0 {
                executors.remove(executor.name());
                true
            } else {
                false
            }
        };
        if last {
            info!("🗑️ SERVER: destroying executor - signature={}", executor.name());
            executor.stop();
            let headroom = POOL_SHRINK_PER_ENGINE * executor.engine_num();
            let _guard = self.ctx.pool_lock.lock();
            if self.ctx.pool.idle_number() > headroom {
                self.ctx
                    .pool
                    .resize(self.ctx.pool.size().saturating_sub(headroom));
            }
        }
        true
    }

    /// Submit asynchronously; the session's observer receives the result.
    pub fn request(
        &self,
        session: &Arc<Session>,
        pack: Package,
        user_data: UserData,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let Some(observer) = session.observer() else {
            return Err(Error::InvalidParam(
                "async request requires a session with an observer".into(),
            ));
        };
        if pack.data.is_empty() {
            return Err(Error::InvalidParam("empty package".into()));
        }
        if !session.wait_if_cache_full(timeout) {
            warn!(session = %session.name(), "session busy, request timed out");
            return Err(Error::Timeout);
        }
        let response: ResponseFn =
            Box::new(move |status, output| observer.notify(status, output, user_data));
        match session.send(pack, response) {
            Some(_) => Ok(()),
            None => Err(Error::Backend("session is shutting down".into())),
        }
    }

    /// Submit and wait. On expiry the request is marked discarded and
    /// `(Status::Timeout, empty)` is returned; already-enqueued work drains
    /// and its results are dropped by the cache sweep.
    pub fn request_sync(
        &self,
        session: &Arc<Session>,
        pack: Package,
        timeout: Option<Duration>,
    ) -> Result<(Status, Package)> {
        if !session.is_sync() {
            return Err(Error::InvalidParam(
                "sync request on a session with an observer".into(),
            ));
        }
        if pack.data.is_empty() {
            return Err(Error::InvalidParam("empty package".into()));
        }

        let wait_start = Instant::now();
        if !session.wait_if_cache_full(timeout) {
            warn!(session = %session.name(), "session busy, request timed out");
            return Err(Error::Timeout);
        }
        // Time spent waiting on a full cache counts against the timeout.
        let remaining = match timeout {
            Some(limit) => {
                let elapsed = wait_start.elapsed();
                if limit <= elapsed + Duration::from_millis(1) {
                    warn!(session = %session.name(), "session busy, request timed out");
                    return Err(Error::Timeout);
                }
                Some(limit - elapsed)
            }
            None => None,
        };

        let (tx, rx) = flume::bounded(1);
        let response: ResponseFn = Box::new(move |status, output| {
            let _ = tx.send((status, output));
        });
        let Some(ctrl) = session.send(pack, response) else {
            return Err(Error::Backend("session is shutting down".into()));
        };
        match remaining {
            Some(limit) => match rx.recv_timeout(limit) {
                Ok(result) => Ok(result),
                Err(_) => {
                    warn!(
                        session = %session.name(),
                        request_id = ctrl.request_id(),
                        "processing timed out, discarding request"
                    );
                    ctrl.discard();
                    Ok((Status::Timeout, Package::new(ctrl.tag().to_string())))
                }
            },
            None => rx
                .recv()
                .map_err(|_| Error::Backend("response channel closed".into())),
        }
    }

    /// Block until no request with this tag is outstanding on the session.
    pub fn wait_task_done(&self, session: &Arc<Session>, tag: &str) {
        session.wait_task_done(tag);
    }

    /// Mark every outstanding request with this tag discarded.
    pub fn discard_task(&self, session: &Arc<Session>, tag: &str) {
        session.discard_task(tag);
    }

    pub fn load_model(&self, uri: &str, function_name: &str) -> Result<Arc<dyn Model>> {
        ModelManager::instance().load(uri, function_name)
    }

    pub fn load_model_from_memory(
        &self,
        bytes: &[u8],
        function_name: &str,
    ) -> Result<Arc<dyn Model>> {
        ModelManager::instance().load_from_memory(bytes, function_name)
    }

    pub fn unload_model(&self, model: &Arc<dyn Model>) -> bool {
        ModelManager::instance().unload(model)
    }

    /// Validates that the path exists before remembering it.
    pub fn set_model_dir(&self, dir: &str) -> bool {
        ModelManager::instance().set_model_dir(dir)
    }

    pub fn clear_model_cache(&self) {
        ModelManager::instance().clear_cache();
    }

    /// Per-stage timing statistics of a `show_perf` session.
    #[must_use]
    pub fn get_performance(&self, session: &Arc<Session>) -> HashMap<String, PerfStatistic> {
        session.performance()
    }

    /// Live executors on this device.
    #[must_use]
    pub fn executor_num(&self) -> usize {
        self.ctx.executors.lock().len()
    }

    /// Current worker count of this device's pool.
    #[must_use]
    pub fn worker_num(&self) -> usize {
        self.ctx.pool.size()
    }

    /// Workers currently idle in this device's pool.
    #[must_use]
    pub fn idle_worker_num(&self) -> usize {
        self.ctx.pool.idle_number()
    }
}
