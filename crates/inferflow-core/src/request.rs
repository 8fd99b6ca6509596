//! Per-request completion tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::package::{InferData, Package};
use crate::status::Status;

/// Terminal callback of one request. Fired exactly once.
pub type ResponseFn = Box<dyn FnOnce(Status, Package) + Send>;

/// Fired once when every item of the request has been accounted for,
/// releasing session-side bookkeeping.
pub(crate) type DoneNotifier = Box<dyn FnOnce() + Send>;

struct CtrlState {
    /// Sticky: the first non-success wins and is reported at completion.
    status: Status,
    slots: Vec<Option<InferData>>,
    perf: HashMap<String, f32>,
    response: Option<ResponseFn>,
    done: Option<DoneNotifier>,
}

/// Completion-tracking object for one client request.
///
/// Shared between the session that created it and the task descriptors
/// referencing it; dropped when the last descriptor reports.
pub struct RequestControl {
    request_id: i64,
    tag: String,
    data_num: usize,
    finished: AtomicUsize,
    discarded: AtomicBool,
    state: Mutex<CtrlState>,
}

impl RequestControl {
    pub(crate) fn new(
        request_id: i64,
        tag: String,
        data_num: usize,
        response: ResponseFn,
        done: DoneNotifier,
    ) -> Self {
        let mut slots = Vec::with_capacity(data_num);
        slots.resize_with(data_num, || None);
        Self {
            request_id,
            tag,
            data_num,
            finished: AtomicUsize::new(0),
            discarded: AtomicBool::new(false),
            state: Mutex::new(CtrlState {
                status: Status::Success,
                slots,
                perf: HashMap::new(),
                response: Some(response),
                done: Some(done),
            }),
        }
    }

    #[must_use]
    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn data_num(&self) -> usize {
        self.data_num
    }

    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }

    /// Non-destructive cancellation.
    ///
    /// The terminal response fires here, once, with `Status::Success` and an
    /// empty output: the client asked for the discard and is only being told
    /// it took effect. Items still cached or in-flight are reclaimed by the
    /// cache sweep / late stage completions, which can no longer trigger a
    /// response. Idempotent.
    pub fn discard(&self) {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(request_id = self.request_id, tag = %self.tag, "request discarded");
        let response = self.state.lock().response.take();
        if let Some(response) = response {
            response(Status::Success, Package::new(self.tag.clone()));
        }
    }

    /// Record one completed item. Idempotent past completion; result slots
    /// of discarded requests are not written.
    pub(crate) fn process_done(
        &self,
        status: Status,
        data: InferData,
        index: usize,
        perf: &HashMap<String, f32>,
    ) {
        {
            let mut st = self.state.lock();
            if !status.is_success() && st.status.is_success() {
                st.status = status;
            }
            if !self.is_discarded() {
                if let Some(slot) = st.slots.get_mut(index) {
                    *slot = Some(data);
                }
                for (stage, ms) in perf {
                    *st.perf.entry(stage.clone()).or_insert(0.0) += ms;
                }
            }
        }
        self.finish_one();
    }

    /// Record one item that will never produce output: a failed stage or a
    /// discard sweep (the latter reports `Status::Success`).
    pub(crate) fn process_failed(&self, status: Status) {
        if !status.is_success() {
            let mut st = self.state.lock();
            if st.status.is_success() {
                st.status = status;
            }
        }
        self.finish_one();
    }

    fn finish_one(&self) {
        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        if finished == self.data_num {
            self.complete();
        }
    }

    fn complete(&self) {
        let (response, done, status, output) = {
            let mut st = self.state.lock();
            let mut output = Package::new(self.tag.clone());
            output.data = st
                .slots
                .drain(..)
                .map(|slot| slot.unwrap_or_else(InferData::empty))
                .collect();
            output.data_num = output.data.len();
            output.perf = std::mem::take(&mut st.perf);
            (st.response.take(), st.done.take(), st.status, output)
        };
        if let Some(response) = response {
            response(status, output);
        }
        if let Some(done) = done {
            done();
        }
    }
}

impl std::fmt::Debug for RequestControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestControl")
            .field("request_id", &self.request_id)
            .field("tag", &self.tag)
            .field("data_num", &self.data_num)
            .field("finished", &self.finished.load(Ordering::Relaxed))
            .field("discarded", &self.is_discarded())
            .finish()
    }
}
