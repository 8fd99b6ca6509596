//! The in-flight data unit: items, descriptors and batches.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::request::RequestControl;

/// One logical client item moving through the pipeline.
///
/// The payload is opaque to the core; processors downcast it to whatever the
/// stage produces and replace it with the stage's output.
pub struct InferData {
    payload: Option<Box<dyn Any + Send>>,
    pub(crate) desc: Option<TaskDesc>,
}

impl InferData {
    #[must_use]
    pub fn new<T: Any + Send>(payload: T) -> Self {
        Self {
            payload: Some(Box::new(payload)),
            desc: None,
        }
    }

    /// An item with no payload, used for discarded or missing result slots.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            payload: None,
            desc: None,
        }
    }

    pub fn set<T: Any + Send>(&mut self, payload: T) {
        self.payload = Some(Box::new(payload));
    }

    #[must_use]
    pub fn get_ref<T: Any>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    /// Take the payload out, downcast to `T`. Returns `None` (payload kept)
    /// on a type mismatch.
    pub fn take<T: Any>(&mut self) -> Option<T> {
        match self.payload.take() {
            None => None,
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(v) => Some(*v),
                Err(original) => {
                    self.payload = Some(original);
                    None
                }
            },
        }
    }

    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }
}

impl std::fmt::Debug for InferData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferData")
            .field("has_payload", &self.payload.is_some())
            .field("has_desc", &self.desc.is_some())
            .finish()
    }
}

/// Back-reference from one item to its owning request.
///
/// Many descriptors share one control (one per original item); `index` is the
/// item's position in the client's request.
#[derive(Clone)]
pub struct TaskDesc {
    pub(crate) ctrl: Arc<RequestControl>,
    pub index: usize,
}

/// One batch moving through the pipeline.
///
/// While a package is cached, each item's descriptor lives on the item
/// (`data[i].desc`); when the cache pops the package the descriptors migrate
/// once into `descs`, freeing item-local state for the stages.
#[derive(Default)]
pub struct Package {
    pub data: Vec<InferData>,
    pub(crate) descs: Vec<TaskDesc>,
    /// Client-chosen grouping key for `wait_task_done` / `discard_task`.
    pub tag: String,
    /// Effective priority, see [`crate::priority::Priority`].
    pub priority: i64,
    /// Logical item count. Exceeds `data.len()` for continuous single-blob
    /// inputs (one payload standing for `data_num` items).
    pub data_num: usize,
    /// Per-stage wall time in milliseconds, filled when perf recording is on.
    pub perf: HashMap<String, f32>,
}

impl Package {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Append one item and keep `data_num` in step.
    pub fn add<T: Any + Send>(&mut self, payload: T) -> &mut Self {
        self.data.push(InferData::new(payload));
        self.data_num = self.data.len();
        self
    }

    /// A continuous package: one blob payload standing for `data_num`
    /// logical items. Only meaningful under the STATIC batch strategy.
    #[must_use]
    pub fn continuous<T: Any + Send>(tag: impl Into<String>, payload: T, data_num: usize) -> Self {
        let mut pack = Self::new(tag);
        pack.data.push(InferData::new(payload));
        pack.data_num = data_num;
        pack
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when any item still references a discarded request.
    pub(crate) fn any_discarded(&self) -> bool {
        let on_items = self
            .data
            .iter()
            .filter_map(|d| d.desc.as_ref())
            .any(|d| d.ctrl.is_discarded());
        on_items || self.descs.iter().any(|d| d.ctrl.is_discarded())
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("tag", &self.tag)
            .field("len", &self.data.len())
            .field("data_num", &self.data_num)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let mut item = InferData::new(41u32);
        assert_eq!(item.get_ref::<u32>(), Some(&41));
        assert!(item.get_ref::<String>().is_none());
        item.set(String::from("out"));
        assert_eq!(item.take::<String>().as_deref(), Some("out"));
        assert!(!item.has_payload());
    }

    #[test]
    fn test_take_keeps_payload_on_mismatch() {
        let mut item = InferData::new(7i64);
        assert!(item.take::<u8>().is_none());
        assert_eq!(item.take::<i64>(), Some(7));
    }

    #[test]
    fn test_add_tracks_data_num() {
        let mut pack = Package::new("t");
        pack.add(1u8).add(2u8);
        assert_eq!(pack.len(), 2);
        assert_eq!(pack.data_num, 2);
    }

    #[test]
    fn test_continuous() {
        let pack = Package::continuous("t", vec![0u8; 64], 4);
        assert_eq!(pack.len(), 1);
        assert_eq!(pack.data_num, 4);
    }
}
