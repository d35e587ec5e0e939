//! Plan decode errors

use thiserror::Error;

use crate::core;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("unknown plan operator `{0}`")]
    UnknownOperator(String),

    #[error("plan object has no #operator discriminator")]
    MissingDiscriminator,

    #[error("plan decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<PlanError> for core::Error {
    fn from(e: PlanError) -> Self {
        core::Error::plan_decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;
