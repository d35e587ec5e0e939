//! Structured logging for the engine.

pub mod logger;

pub use logger::{Logger, Severity};
