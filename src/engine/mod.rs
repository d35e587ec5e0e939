//! Query engine coordinator
//!
//! Turns a statement into a plan, a plan into a live execution tree,
//! and relays the root's output to the caller. Owns the deadline: on
//! expiry every operator's stop channel gets a signal and the query
//! surfaces a timeout error. An external kill walks the same shutdown
//! path but is not an error: the rows delivered so far are returned.

use std::sync::Arc;

use serde_json::Value;

use crate::algebra::Statement;
use crate::core::{EngineConfig, Error, QueryContext, Result};
use crate::datastore::Catalog;
use crate::execution::{
    build_exec, item_channel, join_operator, spawn_operator, BuildEnv, StopHandle,
};
use crate::functions::FunctionRegistry;
use crate::observability::Logger;
use crate::plan::PlanOp;
use crate::planner::{Builder, PlannerOptions};
use crate::prepared::PreparedCache;

/// The outcome of one query.
#[derive(Debug)]
pub struct QueryResults {
    pub rows: Vec<Value>,
    pub errors: Vec<Error>,
    pub mutation_count: u64,
}

/// Top-level engine: planner, prepared cache, and execution
/// coordinator over one catalog.
pub struct QueryEngine {
    catalog: Arc<dyn Catalog>,
    config: EngineConfig,
    functions: Arc<FunctionRegistry>,
    prepared: Arc<PreparedCache>,
}

impl QueryEngine {
    pub fn new(catalog: Arc<dyn Catalog>, config: EngineConfig) -> Self {
        Self {
            catalog,
            config,
            functions: Arc::new(FunctionRegistry::new()),
            prepared: Arc::new(PreparedCache::new()),
        }
    }

    pub fn prepared(&self) -> &Arc<PreparedCache> {
        &self.prepared
    }

    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        &self.functions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fresh context for one statement, wired to this engine's
    /// function registry and default deadline.
    pub fn context(&self, stmt: &Statement) -> Arc<QueryContext> {
        Arc::new(
            QueryContext::new(stmt.readonly())
                .with_timeout(self.config.timeout)
                .with_functions(Arc::clone(&self.functions)),
        )
    }

    /// Compile a statement.
    pub fn plan(&self, stmt: &Statement, options: PlannerOptions) -> Result<PlanOp> {
        let mut builder = Builder::new(self.catalog.as_ref(), &self.config, options)
            .with_prepared_cache(&self.prepared);
        let plan = builder.build(stmt)?;
        Logger::info(
            "plan_built",
            &[("root", plan.name()), ("readonly", if plan.readonly() { "true" } else { "false" })],
        );
        Ok(plan)
    }

    /// Plan and run a statement under a fresh context.
    pub async fn execute(&self, stmt: &Statement, options: PlannerOptions) -> Result<QueryResults> {
        let plan = self.plan(stmt, options)?;
        let ctx = self.context(stmt);
        self.run(&plan, ctx).await
    }

    /// Run a previously prepared plan. Verification failure evicts the
    /// cache entry and surfaces the error; the caller replans.
    pub async fn execute_prepared(&self, name: &str) -> Result<QueryResults> {
        let prepared = self.prepared.get_verified(name, self.catalog.as_ref())?;
        let ctx = Arc::new(
            QueryContext::new(prepared.plan.readonly())
                .with_timeout(self.config.timeout)
                .with_functions(Arc::clone(&self.functions)),
        );
        self.run(&prepared.plan, ctx).await
    }

    /// Execute a plan tree: build the execution twin, start the root,
    /// relay output, and tear everything down.
    pub async fn run(&self, plan: &PlanOp, ctx: Arc<QueryContext>) -> Result<QueryResults> {
        let env = BuildEnv::new(Arc::clone(&self.catalog), self.config.clone());
        let mut stops: Vec<StopHandle> = Vec::new();
        let mut root = build_exec(plan, &env, &mut stops)?;

        let (tx, mut rx) = item_channel(self.config.pipeline_cap);
        root.base_mut().set_output(tx);
        let handle = spawn_operator(root, &ctx);

        let deadline = ctx.deadline().map(tokio::time::Instant::from_std);
        let expiry = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expiry);

        let mut rows = Vec::new();
        let mut timed_out = false;
        let mut killed = false;
        loop {
            tokio::select! {
                biased;
                _ = ctx.killed(), if !killed => {
                    killed = true;
                    stop_all(&stops);
                }
                _ = &mut expiry, if !timed_out => {
                    timed_out = true;
                    ctx.error(Error::timeout());
                    stop_all(&stops);
                }
                item = rx.recv() => {
                    match item {
                        Some(row) => rows.push(row.into_value()),
                        None => break,
                    }
                }
            }
        }

        let root = join_operator(handle).await;
        if let Some(mut root) = root {
            root.done().await;
        }

        if let Some(fatal) = ctx.first_fatal() {
            return Err(fatal);
        }
        Ok(QueryResults {
            rows,
            errors: ctx.errors(),
            mutation_count: ctx.mutation_count(),
        })
    }
}

/// Reach every operator's stop channel, root first.
fn stop_all(stops: &[StopHandle]) {
    for stop in stops {
        stop.send_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{KeyspaceRef, Select};
    use crate::datastore::{Keyspace, MemCatalog};
    use serde_json::json;

    fn engine_with_rows(n: usize) -> QueryEngine {
        let catalog = Arc::new(MemCatalog::new());
        let ks = catalog.create_keyspace("t");
        ks.upsert(
            (0..n)
                .map(|i| (format!("k{:03}", i), json!({"a": i})))
                .collect(),
        );
        QueryEngine::new(catalog, EngineConfig::default())
    }

    #[tokio::test]
    async fn test_select_streams_all_rows() {
        let engine = engine_with_rows(5);
        let stmt = Statement::Select(Select::new(KeyspaceRef::new("t")));
        let results = engine
            .execute(&stmt, PlannerOptions::default())
            .await
            .unwrap();
        assert_eq!(results.rows.len(), 5);
        assert!(results.errors.is_empty());
    }

    #[tokio::test]
    async fn test_kill_returns_cleanly_without_error() {
        let engine = engine_with_rows(50);
        let stmt = Statement::Select(Select::new(KeyspaceRef::new("t")));
        let plan = engine.plan(&stmt, PlannerOptions::default()).unwrap();
        let ctx = engine.context(&stmt);
        ctx.kill();
        let results = engine.run(&plan, ctx).await.unwrap();
        // killed before start: nothing needs to have been delivered
        assert!(results.rows.len() <= 50);
    }

    #[tokio::test]
    async fn test_timeout_is_fatal() {
        let engine = engine_with_rows(10);
        let stmt = Statement::Select(Select::new(KeyspaceRef::new("t")));
        let plan = engine.plan(&stmt, PlannerOptions::default()).unwrap();
        let ctx = Arc::new(
            QueryContext::new(true).with_timeout(std::time::Duration::from_millis(0)),
        );
        let err = engine.run(&plan, ctx).await.unwrap_err();
        assert_eq!(err.code(), crate::core::ErrorCode::Timeout);
    }
}
