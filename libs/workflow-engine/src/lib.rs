//! Maestro workflow engine
//!
//! Drives multi-step content-optimization pipelines: definition registry,
//! dependency-DAG scheduling with conditional execution, per-step retry
//! with exponential backoff, distributed step locks for multi-worker
//! safety, and synchronous lifecycle events.

pub mod condition;
pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod executor;
pub mod registry;
pub mod validate;

pub use condition::*;
pub use dispatcher::*;
pub use engine::*;
pub use events::*;
pub use executor::*;
pub use registry::*;
pub use validate::*;
