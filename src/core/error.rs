//! Engine error types
//!
//! Every error carries a stable code and a severity. Fatal errors abort
//! the running query; plain errors are recorded and the affected row is
//! skipped. Operator bodies never raise errors through return values to
//! their callers; they record them in the execution context's sink.

use std::fmt;

/// Severity levels for engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation failed but the query may continue
    Error,
    /// The query must stop
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Stable engine error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Expression evaluation failed on a row
    Evaluation,
    /// Datastore operation failed; severity set by the datastore
    Datastore,
    /// A row value had the wrong shape (e.g. non-string MERGE key)
    InvalidValue,
    /// Unknown `#operator` or malformed plan JSON
    PlanDecode,
    /// Unreachable planner/executor state
    PlanInternal,
    /// Query deadline exceeded
    Timeout,
    /// Credentials rejected for a keyspace
    Authorization,
    /// CREATE FUNCTION name already registered
    FunctionExists,
    /// Function lookup failed
    FunctionNotFound,
    /// Cached plan no longer matches the catalog
    PreparedVerify,
    /// EXECUTE of a name with no cached plan
    PreparedNotFound,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCode::Evaluation => "QRY_EVALUATION",
            ErrorCode::Datastore => "QRY_DATASTORE",
            ErrorCode::InvalidValue => "QRY_INVALID_VALUE",
            ErrorCode::PlanDecode => "QRY_PLAN_DECODE",
            ErrorCode::PlanInternal => "QRY_PLAN_INTERNAL",
            ErrorCode::Timeout => "QRY_TIMEOUT",
            ErrorCode::Authorization => "QRY_AUTHORIZATION",
            ErrorCode::FunctionExists => "QRY_FUNCTION_EXISTS",
            ErrorCode::FunctionNotFound => "QRY_FUNCTION_NOT_FOUND",
            ErrorCode::PreparedVerify => "QRY_PREPARED_VERIFY",
            ErrorCode::PreparedNotFound => "QRY_PREPARED_NOT_FOUND",
        }
    }

    /// Default severity; datastore errors override per instance.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::PlanInternal | ErrorCode::Timeout => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Engine error with code, severity, and message
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    severity: Severity,
    message: String,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
        }
    }

    pub fn evaluation(what: &str, reason: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Evaluation, format!("{}: {}", what, reason))
    }

    pub fn datastore(fatal: bool, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Datastore,
            severity: if fatal { Severity::Fatal } else { Severity::Error },
            message: message.into(),
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidValue, message)
    }

    pub fn plan_decode(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlanDecode, message)
    }

    pub fn plan_internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlanInternal, message)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorCode::Timeout, "query deadline exceeded")
    }

    pub fn authorization(keyspace: &str) -> Self {
        Self::new(
            ErrorCode::Authorization,
            format!("access to keyspace `{}` denied", keyspace),
        )
    }

    pub fn function_exists(name: &str) -> Self {
        Self::new(
            ErrorCode::FunctionExists,
            format!("function `{}` already exists", name),
        )
    }

    pub fn function_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::FunctionNotFound,
            format!("function `{}` not found", name),
        )
    }

    pub fn prepared_verify(name: &str) -> Self {
        Self::new(
            ErrorCode::PreparedVerify,
            format!("prepared plan `{}` no longer matches the catalog", name),
        )
    }

    pub fn prepared_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::PreparedNotFound,
            format!("no prepared plan named `{}`", name),
        )
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code.code(), self.message)
    }
}

impl std::error::Error for Error {}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::Evaluation.code(), "QRY_EVALUATION");
        assert_eq!(ErrorCode::PlanDecode.code(), "QRY_PLAN_DECODE");
        assert_eq!(ErrorCode::PreparedVerify.code(), "QRY_PREPARED_VERIFY");
    }

    #[test]
    fn test_datastore_severity_is_instance_level() {
        assert!(Error::datastore(true, "disk gone").is_fatal());
        assert!(!Error::datastore(false, "missing key").is_fatal());
    }

    #[test]
    fn test_internal_and_timeout_are_fatal() {
        assert!(Error::plan_internal("x").is_fatal());
        assert!(Error::timeout().is_fatal());
    }

    #[test]
    fn test_display_shape() {
        let e = Error::invalid_value("bad key");
        assert_eq!(format!("{}", e), "[ERROR] QRY_INVALID_VALUE: bad key");
    }
}
