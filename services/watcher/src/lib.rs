//! Model alias watcher library.
//!
//! The watcher keeps a serving process in step with the version a registry
//! alias points at. The serving process holds the model artifact in memory,
//! so every alias move needs a restart, and every retired version needs its
//! registry records deleted and its artifacts garbage collected.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler (loop, timer, shutdown)
//! ├── VersionPoller       (alias -> version)
//! ├── RestartCoordinator  (restart + stabilization)
//! ├── CleanupPipeline     (orphan discovery, verified deletion)
//! └── GarbageCollector    (mlflow gc with fallback)
//! ```
//!
//! The registry and process execution sit behind the [`ModelRegistry`] and
//! [`CommandExecutor`] traits so the loop can be driven by test doubles.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod exec;
pub mod gc;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod restart;

// Re-export commonly used types
pub use config::Config;
pub use exec::{CommandExecutor, CommandOutcome, CommandSpec, MockExecutor, ProcessExecutor};
pub use reconciler::{CycleOutcome, CycleReport, Reconciler, ReconcilerConfig};
pub use registry::{MlflowRegistry, MockRegistry, ModelRegistry};
