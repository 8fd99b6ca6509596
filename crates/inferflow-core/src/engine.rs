//! One replicated pipeline instance: a chain of task nodes over the shared
//! thread pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::error;

use crate::package::{InferData, Package};
use crate::pool::PriorityThreadPool;
use crate::priority::Priority;
use crate::processor::{Processor, ProcessorConfig};
use crate::status::{Error, Result, Status};

pub(crate) type DoneFn = Arc<dyn Fn() + Send + Sync>;

/// One pipeline stage: a processor, a forward link, and the engine's done
/// notifier for the tail/failure paths.
pub(crate) struct TaskNode {
    /// The mutex is the processor's scoped lock: instances are
    /// single-threaded, concurrent invocations of one node serialize here.
    processor: Mutex<Box<dyn Processor>>,
    type_name: String,
    down: Option<Arc<TaskNode>>,
    pool: Arc<PriorityThreadPool>,
    done: DoneFn,
    record_perf: bool,
}

impl TaskNode {
    fn invoke(self: Arc<Self>, mut pack: Package) {
        let wait_start = Instant::now();
        let mut processor = self.processor.lock();
        let start = Instant::now();
        let status = processor.process(&mut pack);
        drop(processor);
        if self.record_perf {
            let elapsed_ms = start.elapsed().as_secs_f32() * 1000.0;
            let waited_ms = start.duration_since(wait_start).as_secs_f32() * 1000.0;
            pack.perf.insert(self.type_name.clone(), elapsed_ms);
            pack.perf
                .insert(format!("-WaitLock-{}", self.type_name), waited_ms);
        }
        if !status.is_success() {
            error!(stage = %self.type_name, %status, "processor execution failed");
            for desc in &pack.descs {
                desc.ctrl.process_failed(status);
            }
            (self.done)();
            return;
        }
        self.transmit(pack);
    }

    fn transmit(&self, mut pack: Package) {
        match &self.down {
            Some(next) => {
                // Advance one tier so in-pipeline packages drain ahead of
                // same-base new arrivals.
                pack.priority = Priority::next(pack.priority);
                let next = next.clone();
                self.pool
                    .push(pack.priority, Box::new(move || next.invoke(pack)));
            }
            None => {
                // Tail of the pipeline: respond per item. Success here never
                // overrides an earlier recorded failure.
                let item_count = pack.descs.len().max(1) as f32;
                let perf: HashMap<String, f32> = pack
                    .perf
                    .iter()
                    .map(|(stage, ms)| (stage.clone(), ms / item_count))
                    .collect();
                let mut data = std::mem::take(&mut pack.data).into_iter();
                for desc in &pack.descs {
                    let item = data.next().unwrap_or_else(InferData::empty);
                    desc.ctrl
                        .process_done(Status::Success, item, desc.index, &perf);
                }
                (self.done)();
            }
        }
    }
}

/// A chain of task nodes; forkable into siblings whose processors are
/// independent clones sharing only the thread pool.
pub(crate) struct Engine {
    /// Head to tail.
    nodes: Vec<Arc<TaskNode>>,
    task_num: Arc<AtomicUsize>,
    pool: Arc<PriorityThreadPool>,
    config: Arc<ProcessorConfig>,
    notify: DoneFn,
    record_perf: bool,
}

impl Engine {
    pub(crate) fn new(
        processors: Vec<Box<dyn Processor>>,
        notify: DoneFn,
        pool: Arc<PriorityThreadPool>,
        config: Arc<ProcessorConfig>,
        record_perf: bool,
    ) -> Self {
        let task_num = Arc::new(AtomicUsize::new(0));
        let done: DoneFn = {
            let task_num = task_num.clone();
            let notify = notify.clone();
            Arc::new(move || {
                task_num.fetch_sub(1, Ordering::AcqRel);
                notify();
            })
        };
        let mut down: Option<Arc<TaskNode>> = None;
        let mut nodes: Vec<Arc<TaskNode>> = Vec::with_capacity(processors.len());
        for processor in processors.into_iter().rev() {
            let type_name = processor.type_name().to_string();
            let node = Arc::new(TaskNode {
                processor: Mutex::new(processor),
                type_name,
                down: down.take(),
                pool: pool.clone(),
                done: done.clone(),
                record_perf,
            });
            down = Some(node.clone());
            nodes.push(node);
        }
        nodes.reverse();
        Self {
            nodes,
            task_num,
            pool,
            config,
            notify,
            record_perf,
        }
    }

    /// Sibling engine with freshly forked, re-initialized processors.
    pub(crate) fn fork(&self) -> Result<Engine> {
        let mut forked: Vec<Box<dyn Processor>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut processor = node.processor.lock().fork();
            let status = processor.init(&self.config);
            if !status.is_success() {
                return Err(Error::Backend(format!(
                    "failed to init forked {}: {status}",
                    node.type_name
                )));
            }
            forked.push(processor);
        }
        Ok(Engine::new(
            forked,
            self.notify.clone(),
            self.pool.clone(),
            self.config.clone(),
            self.record_perf,
        ))
    }

    /// Submit one package to the head node through the pool.
    pub(crate) fn feed(&self, pack: Package) {
        let Some(head) = self.nodes.first().cloned() else {
            return;
        };
        self.task_num.fetch_add(1, Ordering::AcqRel);
        self.pool
            .push(pack.priority, Box::new(move || head.invoke(pack)));
    }

    /// In-flight packages; the executor feeds the least-loaded engine.
    pub(crate) fn load(&self) -> usize {
        self.task_num.load(Ordering::Acquire)
    }

    /// An engine accepts new packages while its in-flight count stays below
    /// its stage count; beyond that, packages wait in the cache where the
    /// discard sweep can still reclaim them.
    pub(crate) fn has_capacity(&self) -> bool {
        self.load() < self.nodes.len().max(1)
    }
}
