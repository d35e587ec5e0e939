//! Query context
//!
//! Context shared by every operator of a running query: the error sink,
//! the readonly flag, the deadline, and the cooperative stop flag.
//! The context is read-mostly; the sink and the stop flag take
//! atomic/locked updates from any operator task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use uuid::Uuid;

use super::error::Error;
use crate::functions::FunctionRegistry;
use crate::observability::{Logger, Severity};

/// Credentials presented with the query, checked by Authorize operators.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    /// Keyspaces this user may touch; empty means unrestricted.
    pub allowed_keyspaces: Vec<String>,
}

impl Credentials {
    pub fn may_access(&self, keyspace: &str) -> bool {
        self.allowed_keyspaces.is_empty()
            || self.allowed_keyspaces.iter().any(|k| k == keyspace)
    }
}

/// Shared per-query execution context.
#[derive(Debug)]
pub struct QueryContext {
    query_id: Uuid,
    readonly: bool,
    deadline: Option<Instant>,
    credentials: Credentials,
    functions: Arc<FunctionRegistry>,

    errors: Mutex<Vec<Error>>,
    fatal: AtomicBool,
    killed: Notify,
    kill_requested: AtomicBool,
    started_at: Instant,
    mutations: AtomicU64,
}

impl QueryContext {
    pub fn new(readonly: bool) -> Self {
        Self {
            query_id: Uuid::new_v4(),
            readonly,
            deadline: None,
            credentials: Credentials::default(),
            functions: Arc::new(FunctionRegistry::new()),
            errors: Mutex::new(Vec::new()),
            fatal: AtomicBool::new(false),
            killed: Notify::new(),
            kill_requested: AtomicBool::new(false),
            started_at: Instant::now(),
            mutations: AtomicU64::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn add_mutations(&self, n: u64) {
        self.mutations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    /// Record an error. Fatal errors flip the stop flag so every
    /// operator exits its main loop at the next poll.
    pub fn error(&self, e: Error) {
        let severity = if e.is_fatal() {
            Severity::Error
        } else {
            Severity::Warn
        };
        Logger::log(
            severity,
            "query_error",
            &[
                ("code", e.code().code()),
                ("message", e.message()),
                ("query_id", &self.query_id.to_string()),
            ],
        );
        if e.is_fatal() {
            self.fatal.store(true, Ordering::SeqCst);
        }
        if let Ok(mut sink) = self.errors.lock() {
            sink.push(e);
        }
    }

    /// All errors recorded so far.
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn first_fatal(&self) -> Option<Error> {
        self.errors
            .lock()
            .ok()
            .and_then(|e| e.iter().find(|e| e.is_fatal()).cloned())
    }

    /// Cooperative stop flag: set by a fatal error, an expired deadline,
    /// or an external kill.
    pub fn stopped(&self) -> bool {
        if self.fatal.load(Ordering::SeqCst) || self.kill_requested.load(Ordering::SeqCst) {
            return true;
        }
        match self.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// External kill: same shutdown path as a timeout.
    pub fn kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        self.killed.notify_waiters();
    }

    /// Resolves when `kill` is called.
    pub async fn killed(&self) {
        if self.kill_requested.load(Ordering::SeqCst) {
            return;
        }
        self.killed.notified().await;
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new(false)
    }
}
