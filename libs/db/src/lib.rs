//! Maestro persistence layer
//!
//! Two stores back the engine:
//!
//! - the **state store** (PostgreSQL): durable system of record for
//!   workflow definitions and instances;
//! - the **coordination store** (Redis): fast shared KV with TTL and
//!   compare-and-set, used for step locks, the per-instance mutex and
//!   hot-path state caching.
//!
//! Every store is defined as a trait so tests can substitute the
//! in-memory fakes.

pub mod coordination;
pub mod definition_store;
pub mod instance_store;
pub mod memory;
pub mod mutex;
pub mod pg;
pub mod redis_coordination;

pub use coordination::*;
pub use definition_store::*;
pub use instance_store::*;
pub use memory::*;
pub use mutex::*;
pub use pg::*;
pub use redis_coordination::*;
