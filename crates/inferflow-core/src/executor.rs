//! Shared runtime instance behind sessions with identical signatures.
//!
//! An executor owns one cache, a set of replicated engines and a dispatch
//! thread pulling packages out of the cache into the least-loaded engine.
//! It binds to one accelerator device and is torn down by the facade when
//! the last session detaches.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::cache::{create_cache, PackageCache, DEFAULT_CACHE_CAPACITY};
use crate::config::{BatchStrategy, SessionDesc};
use crate::engine::{DoneFn, Engine};
use crate::package::Package;
use crate::pool::PriorityThreadPool;
use crate::priority::Priority;
use crate::processor::{Passthrough, Predictor, Processor, ProcessorConfig};
use crate::session::Session;
use crate::status::{Error, Result};

pub(crate) struct Executor {
    name: String,
    device_id: usize,
    batch_strategy: BatchStrategy,
    engine_num: usize,
    cache: Arc<dyn PackageCache>,
    engines: Arc<Vec<Engine>>,
    drain: Arc<(Mutex<()>, Condvar)>,
    sessions: Mutex<Vec<Weak<Session>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub(crate) fn new(
        desc: &SessionDesc,
        pool: Arc<PriorityThreadPool>,
        device_id: usize,
        name: String,
    ) -> Result<Arc<Executor>> {
        let model = desc
            .model
            .clone()
            .ok_or_else(|| Error::InvalidParam("model is required".into()))?;
        let preproc = desc
            .preproc
            .clone()
            .ok_or_else(|| Error::InvalidParam("preproc is required".into()))?;
        let postproc: Arc<dyn Processor> = desc
            .postproc
            .clone()
            .unwrap_or_else(|| Arc::new(Passthrough));
        let engine_num = desc.engine_num.max(1) as usize;

        let priority = Priority::new(desc.priority);
        let cache = create_cache(
            desc.batch_strategy,
            DEFAULT_CACHE_CAPACITY,
            desc.batch_size.max(1) as usize,
            priority,
            desc.batch_timeout_ms,
        );

        let config = Arc::new(ProcessorConfig {
            device_id,
            model: Some(model.clone()),
            host_input_layout: desc.host_input_layout.clone(),
            model_input_layout: desc.model_input_layout.clone(),
        });

        let mut stages: Vec<Box<dyn Processor>> = vec![
            preproc.fork(),
            Box::new(Predictor::new(model)),
            postproc.fork(),
        ];
        for stage in &mut stages {
            let status = stage.init(&config);
            if !status.is_success() {
                return Err(Error::Backend(format!(
                    "failed to init {}: {status}",
                    stage.type_name()
                )));
            }
        }

        let drain = Arc::new((Mutex::new(()), Condvar::new()));
        let notify: DoneFn = {
            let drain = drain.clone();
            Arc::new(move || {
                let _guard = drain.0.lock();
                drain.1.notify_all();
            })
        };

        let first = Engine::new(stages, notify, pool, config, desc.show_perf);
        let mut engines = Vec::with_capacity(engine_num);
        engines.push(first);
        for _ in 1..engine_num {
            let sibling = engines[0].fork()?;
            engines.push(sibling);
        }
        let engines = Arc::new(engines);

        cache.start();
        let dispatch_cache = cache.clone();
        let dispatch_engines = engines.clone();
        let dispatch_drain = drain.clone();
        let dispatch = std::thread::Builder::new()
            .name("inferflow-dispatch".into())
            .spawn(move || {
                while let Some(pack) = dispatch_cache.pop() {
                    let mut pending = Some(pack);
                    while let Some(pack) = pending.take() {
                        // Least-loaded engine with capacity, ties by index.
                        let target = dispatch_engines
                            .iter()
                            .filter(|engine| engine.has_capacity())
                            .min_by_key(|engine| engine.load());
                        match target {
                            Some(engine) => engine.feed(pack),
                            None => {
                                // Saturated: hold this package and wait for a
                                // completion; the rest stay cache-resident.
                                pending = Some(pack);
                                let mut guard = dispatch_drain.0.lock();
                                let _ = dispatch_drain
                                    .1
                                    .wait_for(&mut guard, Duration::from_millis(10));
                            }
                        }
                    }
                }
                debug!("dispatch loop exits");
            })
            .map_err(|e| Error::Backend(format!("failed to spawn dispatch thread: {e}")))?;

        Ok(Arc::new(Executor {
            name,
            device_id,
            batch_strategy: desc.batch_strategy,
            engine_num,
            cache,
            engines,
            drain,
            sessions: Mutex::new(Vec::new()),
            dispatch: Mutex::new(Some(dispatch)),
        }))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn engine_num(&self) -> usize {
        self.engine_num
    }

    pub(crate) fn batch_strategy(&self) -> BatchStrategy {
        self.batch_strategy
    }

    pub(crate) fn push(&self, pack: Package) -> bool {
        self.cache.push(pack)
    }

    /// The single backpressure knob visible to clients.
    pub(crate) fn wait_if_cache_full(&self, timeout: Option<Duration>) -> bool {
        self.cache.wait_if_full(timeout)
    }

    pub(crate) fn link(&self, session: &Arc<Session>) {
        self.sessions.lock().push(Arc::downgrade(session));
    }

    pub(crate) fn unlink(&self, session: &Arc<Session>) {
        self.sessions.lock().retain(|weak| {
            weak.upgrade()
                .is_some_and(|alive| !Arc::ptr_eq(&alive, session))
        });
    }

    pub(crate) fn session_num(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn total_load(&self) -> usize {
        self.engines.iter().map(Engine::load).sum()
    }

    /// Stop accepting work, join the dispatch thread and wait for every
    /// engine to drain. Idempotent.
    pub(crate) fn stop(&self) {
        let Some(handle) = self.dispatch.lock().take() else {
            return;
        };
        self.cache.stop();
        if handle.join().is_err() {
            error!(executor = %self.name, "dispatch thread panicked");
        }
        let mut guard = self.drain.0.lock();
        while self.total_load() > 0 {
            let _ = self
                .drain
                .1
                .wait_for(&mut guard, Duration::from_millis(100));
        }
        drop(guard);
        debug!(executor = %self.name, device_id = self.device_id, "executor drained");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if self.dispatch.lock().is_some() {
            warn!(executor = %self.name, "executor dropped without explicit stop");
            self.stop();
        }
    }
}
