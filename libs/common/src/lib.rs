//! Shared utilities for Maestro services

pub mod telemetry;

pub use telemetry::init_tracing;
