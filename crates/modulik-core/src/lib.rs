//! Modulik core: keeps a module available to a host process while running it
//! in an isolated worker that restarts whenever its source changes.
//!
//! This crate provides:
//! - Launching and supervising a worker process per module ([`ModuleHandle`])
//! - Transparent call forwarding that survives restarts ([`FunctionProxy`])
//! - Buffering of calls made while the worker is unavailable
//! - A length-prefixed JSON bridge with round-trip serialization checks
//! - A runtime for writing worker binaries ([`worker`])

pub mod bridge;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod handle;
pub mod state;
pub mod worker;

mod log;
mod registry;
mod supervisor;

pub use bridge::{Arg, ArgItem, CallbackId, ExecutionId, ReadinessData};
pub use callbacks::Callback;
pub use config::{Config, WorkerEntry};
pub use error::{Error, ModuleError, Result};
pub use handle::{Exports, FunctionProxy, LifecycleEvent, Module, ModuleHandle};
pub use log::Notice;
