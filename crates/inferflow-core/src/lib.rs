//! Pipelined inference serving core.
//!
//! Batches heterogeneous client requests, routes them through a staged
//! execution graph (preprocess, model inference, postprocess) and delivers
//! results synchronously or asynchronously with per-request priority,
//! cancellation and timeout semantics.
//!
//! # Architecture
//!
//! - [`InferServer`]: per-device facade creating sessions and sizing the
//!   worker pool.
//! - [`Session`]: a client's handle; sessions with identical signatures
//!   multiplex onto one shared executor.
//! - Executor: owns a batching cache, replicated pipeline engines and a
//!   dispatch loop feeding the least-loaded engine.
//! - [`pool::PriorityThreadPool`]: the only place work executes; priorities
//!   propagate across pipeline stages.
//!
//! The accelerator SDK stays outside: models come through [`ModelFactory`],
//! device binding through [`set_device_hooks`], compute stages through the
//! [`Processor`] trait.

#![warn(clippy::cast_lossless)]

pub mod batcher;
mod cache;
pub mod config;
pub mod device;
mod engine;
mod executor;
pub mod model;
pub mod package;
pub mod pool;
pub mod priority;
pub mod processor;
pub mod request;
pub mod server;
pub mod session;
pub mod status;

pub use config::{BatchStrategy, SessionDesc, SessionDescBuilder};
pub use device::{set_device_hooks, DeviceHook};
pub use model::{Model, ModelFactory, ModelManager};
pub use package::{InferData, Package, TaskDesc};
pub use priority::Priority;
pub use processor::{Passthrough, Predictor, Processor, ProcessorConfig};
pub use request::{RequestControl, ResponseFn};
pub use server::InferServer;
pub use session::{Observer, PerfStatistic, Session, UserData};
pub use status::{Error, Result, Status};
