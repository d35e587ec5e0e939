//! Shared engine infrastructure: errors, query context, configuration.

pub mod config;
pub mod context;
pub mod error;

pub use config::EngineConfig;
pub use context::{Credentials, QueryContext};
pub use error::{Error, ErrorCode, Result, Severity};
