//! Datastore error type
//!
//! The datastore decides severity: fatal errors abort the query,
//! non-fatal errors are recorded and the affected key is skipped.

use thiserror::Error;

use crate::core;

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DatastoreError {
    pub message: String,
    pub fatal: bool,
}

impl DatastoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl From<DatastoreError> for core::Error {
    fn from(e: DatastoreError) -> Self {
        core::Error::datastore(e.fatal, e.message)
    }
}

pub type Result<T> = std::result::Result<T, DatastoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_carries_into_engine_error() {
        let e: core::Error = DatastoreError::fatal("io").into();
        assert!(e.is_fatal());
        let e: core::Error = DatastoreError::new("missing").into();
        assert!(!e.is_fatal());
    }
}
