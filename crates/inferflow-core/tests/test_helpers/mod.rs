//! Shared mocks for integration tests: identity models, recording and
//! gating processors, and a counting observer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use inferflow_core::{
    set_device_hooks, Model, Observer, Package, Processor, SessionDesc, SessionDescBuilder,
    Status, UserData,
};

/// Install device hooks and logging once for the whole test binary.
/// Device ids below 100 are valid; binding always succeeds.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        set_device_hooks(Arc::new(|device_id| device_id < 100), Arc::new(|_| true));
    });
}

/// A model whose `run` is the identity: payloads pass through untouched.
pub struct IdentityModel {
    path: String,
}

impl IdentityModel {
    pub fn shared(path: &str) -> Arc<dyn Model> {
        Arc::new(IdentityModel { path: path.into() })
    }
}

impl Model for IdentityModel {
    fn path(&self) -> &str {
        &self.path
    }

    fn function_name(&self) -> &str {
        "subnet0"
    }

    fn run(&self, _pack: &mut Package) -> Status {
        Status::Success
    }
}

/// Preprocessor recording the size of every package it sees, with an
/// optional per-package delay.
pub struct RecordingPreproc {
    delay: Duration,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl RecordingPreproc {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<usize>>>) {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> (Arc<Self>, Arc<Mutex<Vec<usize>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(RecordingPreproc {
                delay,
                batches: batches.clone(),
            }),
            batches,
        )
    }
}

impl Processor for RecordingPreproc {
    fn type_name(&self) -> &str {
        "RecordingPreproc"
    }

    fn process(&mut self, pack: &mut Package) -> Status {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.batches.lock().push(pack.data.len());
        Status::Success
    }

    fn fork(&self) -> Box<dyn Processor> {
        Box::new(RecordingPreproc {
            delay: self.delay,
            batches: self.batches.clone(),
        })
    }
}

/// A gate the test opens to release every blocked processor invocation.
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Gate> {
        Arc::new(Gate {
            open: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

/// Preprocessor blocking on a gate, recording the tags it processed.
pub struct GatePreproc {
    gate: Arc<Gate>,
    processed: Arc<Mutex<Vec<String>>>,
}

impl GatePreproc {
    pub fn new(gate: Arc<Gate>) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let processed = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(GatePreproc {
                gate,
                processed: processed.clone(),
            }),
            processed,
        )
    }
}

impl Processor for GatePreproc {
    fn type_name(&self) -> &str {
        "GatePreproc"
    }

    fn process(&mut self, pack: &mut Package) -> Status {
        self.gate.wait();
        self.processed.lock().push(pack.tag.clone());
        Status::Success
    }

    fn fork(&self) -> Box<dyn Processor> {
        Box::new(GatePreproc {
            gate: self.gate.clone(),
            processed: self.processed.clone(),
        })
    }
}

/// Preprocessor that always fails.
pub struct FailingPreproc;

impl Processor for FailingPreproc {
    fn type_name(&self) -> &str {
        "FailingPreproc"
    }

    fn process(&mut self, _pack: &mut Package) -> Status {
        Status::ErrorBackend
    }

    fn fork(&self) -> Box<dyn Processor> {
        Box::new(FailingPreproc)
    }
}

/// One observed completion: status, output length and the submitted label.
pub type Event = (Status, usize, Option<String>);

pub struct CountingObserver {
    events: Mutex<Vec<Event>>,
}

impl CountingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(CountingObserver {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Poll until `n` events arrived; `false` on timeout.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.events.lock().len() < n {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

impl Observer for CountingObserver {
    fn notify(&self, status: Status, output: Package, user_data: UserData) {
        let label = user_data.and_then(|data| data.downcast::<String>().ok().map(|s| *s));
        self.events.lock().push((status, output.data.len(), label));
    }
}

/// A builder pre-filled with an identity model and the given preprocessor.
pub fn desc(model_path: &str, preproc: Arc<dyn Processor>) -> SessionDescBuilder {
    SessionDesc::builder()
        .model(IdentityModel::shared(model_path))
        .preproc(preproc)
}

/// A package of `n` distinct `u32` payloads.
pub fn pack(tag: &str, n: usize) -> Package {
    let mut pack = Package::new(tag);
    for i in 0..n {
        pack.add(i as u32);
    }
    pack
}

/// Boxed label for async user data.
pub fn label(s: &str) -> UserData {
    Some(Box::new(s.to_string()))
}
