//! Session configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::Model;
use crate::processor::Processor;
use crate::status::{Error, Result};

/// How the executor's cache turns requests into batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStrategy {
    /// Coalesce items across requests inside a time window.
    #[default]
    Dynamic,
    /// Split pre-batched inputs; never coalesce across pushes.
    Static,
    /// Strict arrival order for streamed requests.
    Sequence,
}

impl std::fmt::Display for BatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStrategy::Dynamic => "BatchStrategy::Dynamic",
            BatchStrategy::Static => "BatchStrategy::Static",
            BatchStrategy::Sequence => "BatchStrategy::Sequence",
        };
        f.write_str(s)
    }
}

/// Everything needed to open a session.
///
/// Sessions with equal signatures (model path, function name, pre/post
/// processor type names) share one executor regardless of the rest.
#[derive(Clone)]
pub struct SessionDesc {
    /// Auto-derived from the signature when empty.
    pub name: String,
    pub model: Option<Arc<dyn Model>>,
    pub preproc: Option<Arc<dyn Processor>>,
    /// Defaults to a passthrough forwarding model outputs verbatim.
    pub postproc: Option<Arc<dyn Processor>>,
    pub batch_strategy: BatchStrategy,
    pub batch_size: u32,
    /// Dynamic strategy only: a partial batch flushes this long after its
    /// first item arrived.
    pub batch_timeout_ms: u64,
    /// Replicated pipeline count.
    pub engine_num: u32,
    /// Smaller dispatches first.
    pub priority: i32,
    pub show_perf: bool,
    pub host_input_layout: Option<String>,
    pub model_input_layout: Option<String>,
}

impl Default for SessionDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            model: None,
            preproc: None,
            postproc: None,
            batch_strategy: BatchStrategy::default(),
            batch_size: 1,
            batch_timeout_ms: 100,
            engine_num: 1,
            priority: 0,
            show_perf: false,
            host_input_layout: None,
            model_input_layout: None,
        }
    }
}

impl SessionDesc {
    pub fn builder() -> SessionDescBuilder {
        SessionDescBuilder {
            desc: SessionDesc::default(),
        }
    }

    /// Executor dedup key.
    #[must_use]
    pub fn signature(&self) -> String {
        let (model_path, function_name) = match &self.model {
            Some(model) => (model.path(), model.function_name()),
            None => ("", ""),
        };
        let preproc = self.preproc.as_ref().map_or("", |p| p.type_name());
        let postproc = self.postproc.as_ref().map_or("Passthrough", |p| p.type_name());
        format!("{model_path}_{function_name}_{preproc}_{postproc}")
    }
}

impl std::fmt::Debug for SessionDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDesc")
            .field("name", &self.name)
            .field("signature", &self.signature())
            .field("batch_strategy", &self.batch_strategy)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout_ms", &self.batch_timeout_ms)
            .field("engine_num", &self.engine_num)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Fluent builder for [`SessionDesc`].
pub struct SessionDescBuilder {
    desc: SessionDesc,
}

impl SessionDescBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.desc.name = name.into();
        self
    }

    pub fn model(mut self, model: Arc<dyn Model>) -> Self {
        self.desc.model = Some(model);
        self
    }

    pub fn preproc(mut self, preproc: Arc<dyn Processor>) -> Self {
        self.desc.preproc = Some(preproc);
        self
    }

    pub fn postproc(mut self, postproc: Arc<dyn Processor>) -> Self {
        self.desc.postproc = Some(postproc);
        self
    }

    pub fn batch_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.desc.batch_strategy = strategy;
        self
    }

    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.desc.batch_size = batch_size;
        self
    }

    pub fn batch_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.desc.batch_timeout_ms = timeout_ms;
        self
    }

    pub fn engine_num(mut self, engine_num: u32) -> Self {
        self.desc.engine_num = engine_num;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.desc.priority = priority;
        self
    }

    pub fn show_perf(mut self, show_perf: bool) -> Self {
        self.desc.show_perf = show_perf;
        self
    }

    pub fn host_input_layout(mut self, layout: impl Into<String>) -> Self {
        self.desc.host_input_layout = Some(layout.into());
        self
    }

    pub fn model_input_layout(mut self, layout: impl Into<String>) -> Self {
        self.desc.model_input_layout = Some(layout.into());
        self
    }

    pub fn build(self) -> Result<SessionDesc> {
        if self.desc.model.is_none() {
            return Err(Error::InvalidParam("model is required".into()));
        }
        if self.desc.preproc.is_none() {
            return Err(Error::InvalidParam("preproc is required".into()));
        }
        if self.desc.batch_size == 0 {
            return Err(Error::InvalidParam("batch_size must be >= 1".into()));
        }
        if self.desc.engine_num == 0 {
            return Err(Error::InvalidParam("engine_num must be >= 1".into()));
        }
        Ok(self.desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Package;
    use crate::processor::Passthrough;
    use crate::status::Status;

    struct FakeModel;

    impl Model for FakeModel {
        fn path(&self) -> &str {
            "fake.model"
        }
        fn function_name(&self) -> &str {
            "subnet0"
        }
        fn run(&self, _pack: &mut Package) -> Status {
            Status::Success
        }
    }

    #[test]
    fn test_builder_requires_model_and_preproc() {
        assert!(SessionDesc::builder().build().is_err());
        assert!(SessionDesc::builder()
            .model(Arc::new(FakeModel))
            .build()
            .is_err());
        let desc = SessionDesc::builder()
            .model(Arc::new(FakeModel))
            .preproc(Arc::new(Passthrough))
            .batch_size(4)
            .build()
            .unwrap();
        assert_eq!(desc.batch_size, 4);
    }

    #[test]
    fn test_signature_defaults_postproc() {
        let desc = SessionDesc::builder()
            .model(Arc::new(FakeModel))
            .preproc(Arc::new(Passthrough))
            .build()
            .unwrap();
        assert_eq!(desc.signature(), "fake.model_subnet0_Passthrough_Passthrough");
    }

    #[test]
    fn test_builder_rejects_zero_sizes() {
        let base = || {
            SessionDesc::builder()
                .model(Arc::new(FakeModel) as Arc<dyn Model>)
                .preproc(Arc::new(Passthrough) as Arc<dyn Processor>)
        };
        assert!(base().batch_size(0).build().is_err());
        assert!(base().engine_num(0).build().is_err());
    }
}
