//! Split-only cache for pre-batched inputs.
//!
//! An incoming package is cut into chunks of at most `batch_size`; chunks
//! never coalesce across pushes. A single-payload package whose `data_num`
//! exceeds one is a continuous blob: it keeps its one payload but grows
//! `data_num` descriptors sharing the request control.

use std::collections::VecDeque;

use crate::package::{InferData, Package, TaskDesc};
use crate::priority::Priority;
use crate::status::Status;

use super::{CacheCore, PackageCache};

pub(crate) struct StaticCache {
    core: CacheCore,
}

impl StaticCache {
    pub(crate) fn new(capacity: usize, batch_size: usize, priority: Priority) -> Self {
        Self {
            core: CacheCore::new(capacity, batch_size, priority),
        }
    }

    fn push_chunk(&self, tag: &str, items: Vec<InferData>) {
        let mut pack = Package::new(tag.to_string());
        pack.descs = items.iter().filter_map(|item| item.desc.clone()).collect();
        pack.priority = match pack.descs.first() {
            Some(desc) => self.core.priority.get(-desc.ctrl.request_id()),
            None => self.core.priority.get(0),
        };
        pack.data_num = items.len();
        pack.data = items;
        self.core.push_package(pack);
    }
}

impl PackageCache for StaticCache {
    fn core(&self) -> &CacheCore {
        &self.core
    }

    fn enqueue(&self, mut input: Package) {
        if input.data.len() == 1 && input.data_num > 1 {
            // Continuous blob: one payload standing for data_num items.
            let Some(desc) = input.data[0].desc.clone() else {
                return;
            };
            let mut pack = Package::new(input.tag.clone());
            pack.priority = self.core.priority.get(-desc.ctrl.request_id());
            pack.data_num = input.data_num;
            pack.descs = (0..input.data_num)
                .map(|index| TaskDesc {
                    ctrl: desc.ctrl.clone(),
                    index,
                })
                .collect();
            pack.data = std::mem::take(&mut input.data);
            self.core.push_package(pack);
            return;
        }

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
        // Descriptors were copied onto the package at admission; shed the
        // item-local copies.
        for item in &mut pack.data {
            item.desc = None;
        }
    }

    // Whole packages drop; a static package only ever references one request.
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

#[cfg(test)]
mod tests {
    use super::super::test_support;
    use super::*;

    fn cache(batch_size: usize) -> StaticCache {
        let cache = StaticCache::new(10, batch_size, Priority::new(0));
        cache.start();
        cache
    }

    #[test]
    fn test_splits_into_batch_size_chunks() {
        let cache = cache(4);
        let (pack, _ctrl) = test_support::package(1, 5);
        assert!(cache.push(pack));

        let first = cache.pop().expect("first chunk");
        let second = cache.pop().expect("second chunk");
        assert_eq!(first.data.len(), 4);
        assert_eq!(second.data.len(), 1);
        // Indices keep their request-relative positions.
        assert_eq!(second.descs[0].index, 4);
        assert!(first.data.iter().all(|item| item.desc.is_none()));
        cache.stop();
    }

    #[test]
    fn test_continuous_blob_expands_descs() {
        let cache = cache(8);
        let (mut pack, _ctrl) = test_support::package(1, 1);
        pack.data_num = 6;
        assert!(cache.push(pack));

        let popped = cache.pop().expect("continuous package");
        assert_eq!(popped.data.len(), 1);
        assert_eq!(popped.data_num, 6);
        assert_eq!(popped.descs.len(), 6);
        assert_eq!(popped.descs[5].index, 5);
        cache.stop();
    }

    #[test]
    fn test_sweep_drops_whole_packages() {
        let cache = cache(4);
        let (p1, c1) = test_support::package(1, 4);
        let (p2, _c2) = test_support::package(2, 4);
        assert!(cache.push(p1));
        assert!(cache.push(p2));
        c1.discard();

        let popped = cache.pop().expect("live package");
        assert!(popped.descs.iter().all(|desc| desc.ctrl.request_id() == 2));
        cache.stop();
        assert!(cache.pop().is_none());
    }
}
