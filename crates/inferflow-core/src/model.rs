//! Model handles and the process-wide model cache.
//!
//! The core never talks to an accelerator SDK directly: loading is delegated
//! to a registered [`ModelFactory`] and execution goes through
//! [`Model::run`], the single backend boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::package::Package;
use crate::status::{Error, Result, Status};

/// A loaded model. Immutable and shared across replicated pipelines.
pub trait Model: Send + Sync {
    fn path(&self) -> &str;
    fn function_name(&self) -> &str;
    /// Run one batch through the model. This is the accelerator boundary;
    /// failures surface as a non-success `Status`, never a panic.
    fn run(&self, pack: &mut Package) -> Status;
}

/// Constructs model handles from a uri or an in-memory blob.
pub trait ModelFactory: Send + Sync {
    fn create(&self, uri: &str, function_name: &str) -> Option<Arc<dyn Model>>;

    fn create_from_memory(&self, _bytes: &[u8], _function_name: &str) -> Option<Arc<dyn Model>> {
        None
    }
}

/// Process-wide cache of loaded models, keyed by `uri + function_name`.
pub struct ModelManager {
    factory: RwLock<Option<Arc<dyn ModelFactory>>>,
    cache: Mutex<HashMap<String, Arc<dyn Model>>>,
    model_dir: RwLock<Option<PathBuf>>,
}

impl ModelManager {
    pub fn instance() -> &'static ModelManager {
        static INSTANCE: OnceLock<ModelManager> = OnceLock::new();
        INSTANCE.get_or_init(|| ModelManager {
            factory: RwLock::new(None),
            cache: Mutex::new(HashMap::new()),
            model_dir: RwLock::new(None),
        })
    }

    /// Register the loader used for every subsequent `load`.
    pub fn set_factory(&self, factory: Arc<dyn ModelFactory>) {
        *self.factory.write() = Some(factory);
    }

    /// Remember a directory that relative model uris resolve against.
    /// Returns `false` (and keeps the old value) when the path is not a
    /// directory.
    pub fn set_model_dir(&self, dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "model dir does not exist");
            return false;
        }
        *self.model_dir.write() = Some(dir.to_path_buf());
        true
    }

    fn resolve(&self, uri: &str) -> String {
        if Path::new(uri).is_absolute() {
            return uri.to_string();
        }
        match self.model_dir.read().as_ref() {
            Some(dir) => dir.join(uri).to_string_lossy().into_owned(),
            None => uri.to_string(),
        }
    }

    pub fn load(&self, uri: &str, function_name: &str) -> Result<Arc<dyn Model>> {
        let key = format!("{uri}_{function_name}");
        if let Some(model) = self.cache.lock().get(&key) {
            return Ok(model.clone());
        }
        let factory = self
            .factory
            .read()
            .clone()
            .ok_or_else(|| Error::Backend("no model factory registered".into()))?;
        let resolved = self.resolve(uri);
        let model = factory
            .create(&resolved, function_name)
            .ok_or_else(|| Error::Backend(format!("failed to load model: {resolved}")))?;
        info!(uri = %resolved, function_name, "model loaded");
        self.cache.lock().insert(key, model.clone());
        Ok(model)
    }

    /// Load from an in-memory blob. Not cached: the caller owns the bytes.
    pub fn load_from_memory(&self, bytes: &[u8], function_name: &str) -> Result<Arc<dyn Model>> {
        let factory = self
            .factory
            .read()
            .clone()
            .ok_or_else(|| Error::Backend("no model factory registered".into()))?;
        factory
            .create_from_memory(bytes, function_name)
            .ok_or_else(|| Error::Backend("failed to load model from memory".into()))
    }

    /// Drop a handle from the cache; returns whether it was known.
    pub fn unload(&self, model: &Arc<dyn Model>) -> bool {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|_, cached| !Arc::ptr_eq(cached, model));
        cache.len() != before
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
