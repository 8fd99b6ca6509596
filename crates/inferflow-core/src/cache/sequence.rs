//! Arrival-ordered cache for streamed requests.
//!
//! Splits like the static cache, but emitted packages take their priority
//! from a cache-local arrival counter instead of the request id, so packages
//! leave in strict arrival order even when base priorities would otherwise
//! reorder them. Used when requests must retain their position in a stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::package::{InferData, Package};
use crate::priority::Priority;
use crate::status::Status;

use super::{CacheCore, PackageCache};

pub(crate) struct SequenceCache {
    core: CacheCore,
    arrival: AtomicI64,
}

impl SequenceCache {
    pub(crate) fn new(capacity: usize, batch_size: usize, priority: Priority) -> Self {
        Self {
            core: CacheCore::new(capacity, batch_size, priority),
            arrival: AtomicI64::new(0),
        }
    }

    fn push_chunk(&self, tag: &str, items: Vec<InferData>) {
        let arrival = self.arrival.fetch_add(1, Ordering::AcqRel);
        let mut pack = Package::new(tag.to_string());
        pack.descs = items.iter().filter_map(|item| item.desc.clone()).collect();
        pack.priority = self.core.priority.get(-arrival);
        pack.data_num = items.len();
        pack.data = items;
        self.core.push_package(pack);
    }
}

impl PackageCache for SequenceCache {
    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn enqueue(&self, input: Package) {
        let tag = input.tag.clone();
        let batch_size = self.core.batch_size;
        let mut pending: Vec<InferData> = Vec::with_capacity(batch_size);
        for item in input.data {
            debug_assert!(item.desc.is_some(), "cached item without a descriptor");
            pending.push(item);
            if pending.len() == batch_size {
                self.push_chunk(&tag, std::mem::take(&mut pending));
            }
        }
        if !pending.is_empty() {
            self.push_chunk(&tag, pending);
        }
    }

    fn prepare(&self, pack: &mut Package) {
        for item in &mut pack.data {
            item.desc = None;
        }
    }

    // Order-preserving: drop discarded packages in place, never rebatch.
    fn sweep(&self, queue: &mut VecDeque<Package>) {
        queue.retain(|pack| {
            let discarded = pack
                .descs
                .first()
                .is_some_and(|desc| desc.ctrl.is_discarded());
            if discarded {
                for desc in &pack.descs {
                    desc.ctrl.process_failed(Status::Success);
                }
            }
            !discarded
        });
    }
}
