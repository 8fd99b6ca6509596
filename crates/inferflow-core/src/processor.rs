//! Pipeline compute stages.

use std::sync::Arc;

use crate::model::Model;
use crate::package::Package;
use crate::status::Status;

/// Everything a stage may need at initialization time.
pub struct ProcessorConfig {
    pub device_id: usize,
    pub model: Option<Arc<dyn Model>>,
    /// Opaque to the core; forwarded to preprocessors.
    pub host_input_layout: Option<String>,
    /// Opaque to the core; forwarded to preprocessors.
    pub model_input_layout: Option<String>,
}

/// One single-threaded compute step.
///
/// An instance may hold device resources that disallow concurrent
/// invocation; the owning pipeline node serializes calls. Parallelism comes
/// from replicated pipelines, each owning independent clones produced by
/// [`Processor::fork`] — forks share immutable model resources but never
/// mutable buffers.
pub trait Processor: Send + Sync {
    fn type_name(&self) -> &str;

    fn init(&mut self, config: &ProcessorConfig) -> Status {
        let _ = config;
        Status::Success
    }

    /// Run the stage over one package, replacing item payloads in place.
    fn process(&mut self, pack: &mut Package) -> Status;

    /// Clone into fresh state for a replicated pipeline.
    fn fork(&self) -> Box<dyn Processor>;
}

/// Default postprocessor: forwards model outputs verbatim.
#[derive(Debug, Default, Clone)]
pub struct Passthrough;

impl Processor for Passthrough {
    fn type_name(&self) -> &str {
        "Passthrough"
    }

    fn process(&mut self, _pack: &mut Package) -> Status {
        Status::Success
    }

    fn fork(&self) -> Box<dyn Processor> {
        Box::new(Passthrough)
    }
}

/// The inference stage: drives a loaded model handle.
pub struct Predictor {
    model: Arc<dyn Model>,
}

impl Predictor {
    #[must_use]
    pub fn new(model: Arc<dyn Model>) -> Self {
        Self { model }
    }
}

impl Processor for Predictor {
    fn type_name(&self) -> &str {
        "Predictor"
    }

    fn process(&mut self, pack: &mut Package) -> Status {
        self.model.run(pack)
    }

    fn fork(&self) -> Box<dyn Processor> {
        // Forks share the immutable model resources.
        Box::new(Predictor {
            model: self.model.clone(),
        })
    }
}
