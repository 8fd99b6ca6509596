//! Time-windowed coalescing cache.
//!
//! Incoming items fan out through a [`Batcher`]; emitted batches become new
//! packages, so items from different requests (and sessions) share packages.
//! The discard sweep rebuilds the whole queue: live items are kept and
//! re-packed, discarded items are reported back as `Success` (the client was
//! already notified of its own discard).

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::batcher::{BatchSink, Batcher};
use crate::package::{InferData, Package};
use crate::priority::Priority;
use crate::status::Status;

use super::{CacheCore, PackageCache};

pub(crate) struct DynamicCache {
    core: Arc<CacheCore>,
    batcher: Batcher<InferData>,
}

impl DynamicCache {
    pub(crate) fn new(
        capacity: usize,
        batch_size: usize,
        priority: Priority,
        batch_timeout_ms: u64,
    ) -> Self {
        let core = Arc::new(CacheCore::new(capacity, batch_size, priority));
        let sink_core = core.clone();
        let sink: BatchSink<InferData> = Arc::new(move |items: Vec<InferData>| {
            let (pack_priority, tag) = match items.first().and_then(|item| item.desc.as_ref()) {
                Some(desc) => (
                    priority.get(-desc.ctrl.request_id()),
                    desc.ctrl.tag().to_string(),
                ),
                None => (priority.get(0), String::new()),
            };
            let mut pack = Package::new(tag);
            pack.priority = pack_priority;
            pack.data_num = items.len();
            pack.data = items;
            sink_core.push_package(pack);
        });
        let batcher = Batcher::new(sink, batch_timeout_ms, batch_size);
        Self { core, batcher }
    }
}

impl PackageCache for DynamicCache {
    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn enqueue(&self, pack: Package) {
        for item in pack.data {
            debug_assert!(item.desc.is_some(), "cached item without a descriptor");
            self.batcher.add(item);
        }
    }

    fn prepare(&self, pack: &mut Package) {
        // Descriptors migrate off the items once the package is scheduled.
        pack.descs = pack
            .data
            .iter_mut()
            .filter_map(|item| item.desc.take())
            .collect();
    }

    fn sweep(&self, queue: &mut VecDeque<Package>) {
        let mut live: Vec<InferData> = Vec::new();
        for pack in queue.drain(..) {
            for item in pack.data {
                let discarded = item
                    .desc
                    .as_ref()
                    .is_some_and(|desc| desc.ctrl.is_discarded());
                if discarded {
                    if let Some(desc) = &item.desc {
                        desc.ctrl.process_failed(Status::Success);
                    }
                } else {
                    live.push(item);
                }
            }
        }
        let batch_size = self.core.batch_size;
        let priority = self.core.priority;
        let mut items = live.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<InferData> = items.by_ref().take(batch_size).collect();
            let (pack_priority, tag) = match chunk.first().and_then(|item| item.desc.as_ref()) {
                Some(desc) => (
                    priority.get(-desc.ctrl.request_id()),
                    desc.ctrl.tag().to_string(),
                ),
                None => (priority.get(0), String::new()),
            };
            let mut pack = Package::new(tag);
            pack.priority = pack_priority;
            pack.data_num = chunk.len();
            pack.data = chunk;
            queue.push_back(pack);
        }
    }

    fn stop(&self) {
        self.core.running.store(false, Ordering::Release);
        // Flush the partial batch so a stopped cache can still drain it.
        self.batcher.emit();
        self.core.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support;
    use super::*;
    use std::time::Duration;

    fn cache() -> DynamicCache {
        let cache = DynamicCache::new(10, 4, Priority::new(0), 20);
        cache.start();
        cache
    }

    #[test]
    fn test_full_batches_coalesce_across_pushes() {
        let cache = cache();
        let (p1, _c1) = test_support::package(1, 3);
        let (p2, _c2) = test_support::package(2, 3);
        assert!(cache.push(p1));
        assert!(cache.push(p2));

        let first = cache.pop().expect("full batch");
        assert_eq!(first.data.len(), 4);
        assert_eq!(first.descs.len(), 4);
        // Descriptors migrated off the items.
        assert!(first.data.iter().all(|item| item.desc.is_none()));

        cache.stop();
        let rest = cache.pop().expect("flushed partial batch");
        assert_eq!(rest.data.len(), 2);
        assert!(cache.pop().is_none());
    }

    #[test]
    fn test_partial_batch_flushes_on_timeout() {
        let cache = cache();
        let (pack, _ctrl) = test_support::package(1, 2);
        assert!(cache.push(pack));
        let popped = cache.pop().expect("timer-flushed batch");
        assert_eq!(popped.data.len(), 2);
        cache.stop();
    }

    #[test]
    fn test_sweep_rebatches_live_items() {
        let cache = cache();
        let (p1, c1) = test_support::package(1, 4);
        let (p2, _c2) = test_support::package(2, 4);
        assert!(cache.push(p1));
        assert!(cache.push(p2));
        c1.discard();

        let popped = cache.pop().expect("rebatched live items");
        assert_eq!(popped.data.len(), 4);
        assert!(popped
            .descs
            .iter()
            .all(|desc| desc.ctrl.request_id() == 2));
        cache.stop();
        assert!(cache.pop().is_none());
    }

    #[test]
    fn test_wait_if_full_times_out() {
        let cache = DynamicCache::new(1, 1, Priority::new(0), 10_000);
        cache.start();
        let (pack, _ctrl) = test_support::package(1, 1);
        assert!(cache.push(pack));
        assert!(!cache.wait_if_full(Some(Duration::from_millis(20))));
        let _ = cache.pop();
        assert!(cache.wait_if_full(Some(Duration::from_millis(20))));
        cache.stop();
    }
}
