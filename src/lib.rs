//! quarry - query plan and execution core for a JSON document store
//!
//! Accepts validated statements (SELECT, INSERT, UPDATE, DELETE, MERGE,
//! CREATE FUNCTION, PREPARE), compiles them into cost-annotated plan trees
//! with a stable JSON wire form, and runs them as a pipeline of
//! cooperatively concurrent operators linked by bounded channels.

pub mod algebra;
pub mod core;
pub mod datastore;
pub mod engine;
pub mod execution;
pub mod expression;
pub mod functions;
pub mod observability;
pub mod plan;
pub mod planner;
pub mod prepared;
pub mod value;
