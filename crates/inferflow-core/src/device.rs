//! Accelerator device hooks.
//!
//! The core never binds a device itself; the embedder installs two hooks:
//! a checker consulted when a server facade is created for a device id, and
//! a binder run once at the start of every pool worker to attach the device
//! context. Defaults accept everything and bind nothing.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// `Fn(device_id) -> bool`; `false` means rejection/failure.
pub type DeviceHook = Arc<dyn Fn(usize) -> bool + Send + Sync>;

struct DeviceHooks {
    checker: DeviceHook,
    binder: DeviceHook,
}

fn hooks() -> &'static RwLock<DeviceHooks> {
    static HOOKS: OnceLock<RwLock<DeviceHooks>> = OnceLock::new();
    HOOKS.get_or_init(|| {
        RwLock::new(DeviceHooks {
            checker: Arc::new(|_| true),
            binder: Arc::new(|_| true),
        })
    })
}

/// Install the device hooks for the whole process.
pub fn set_device_hooks(checker: DeviceHook, binder: DeviceHook) {
    let mut hooks = hooks().write();
    hooks.checker = checker;
    hooks.binder = binder;
}

pub(crate) fn check_device(device_id: usize) -> bool {
    let checker = hooks().read().checker.clone();
    checker(device_id)
}

pub(crate) fn bind_device(device_id: usize) -> bool {
    let binder = hooks().read().binder.clone();
    binder(device_id)
}
