//! Planner errors

use thiserror::Error;

use crate::core;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("keyspace `{0}` not found")]
    KeyspaceNotFound(String),

    #[error("index `{index}` not found on keyspace `{keyspace}`")]
    IndexNotFound { keyspace: String, index: String },

    #[error("MERGE missing source")]
    MergeMissingSource,

    #[error("internal planner error: {0}")]
    Internal(String),

    #[error(transparent)]
    Plan(#[from] crate::plan::PlanError),
}

impl From<PlannerError> for core::Error {
    fn from(e: PlannerError) -> Self {
        match e {
            PlannerError::Plan(p) => p.into(),
            other => core::Error::plan_internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlannerError>;
