//! The privileged remote surface of a tenant database.
//!
//! Everything schemaguard does to a tenant goes through three
//! procedures (see [`crate::bootstrap`]) plus a session advisory lock.
//! [`SchemaBackend`] is that surface; [`PgBackend`] calls it over sqlx
//! and [`InMemoryBackend`] serves offline snapshots and tests.

mod memory;
mod postgres;

pub use memory::InMemoryBackend;
pub use postgres::PgBackend;

use async_trait::async_trait;
use schemaguard_core::guard::GuardViolation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A database error attached to one query or statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementError {
    /// Primary message.
    pub message: String,
    /// SQLSTATE code.
    #[serde(default)]
    pub code: Option<String>,
    /// Detail line.
    #[serde(default)]
    pub detail: Option<String>,
    /// Hint line.
    #[serde(default)]
    pub hint: Option<String>,
}

impl StatementError {
    /// Creates an error with a message and SQLSTATE.
    #[must_use]
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
            detail: None,
            hint: None,
        }
    }
}

impl From<&GuardViolation> for StatementError {
    fn from(violation: &GuardViolation) -> Self {
        Self::new(violation.to_string(), violation.sqlstate())
    }
}

/// Result of one preflight query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutcome {
    /// The query as sent.
    pub query: String,
    /// Whether it ran.
    pub ok: bool,
    /// Result rows as JSON objects.
    #[serde(default)]
    pub rows: Vec<Value>,
    /// The error, when `ok` is false.
    #[serde(default)]
    pub error: Option<StatementError>,
}

impl QueryOutcome {
    /// A failed query.
    #[must_use]
    pub fn failed(query: impl Into<String>, error: StatementError) -> Self {
        Self {
            query: query.into(),
            ok: false,
            rows: Vec::new(),
            error: Some(error),
        }
    }
}

/// Result of one executed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementOutcome {
    /// The statement as sent.
    pub statement: String,
    /// Whether it succeeded.
    pub ok: bool,
    /// The error, when `ok` is false.
    #[serde(default)]
    pub error: Option<StatementError>,
}

impl StatementOutcome {
    /// A successful statement.
    #[must_use]
    pub fn succeeded(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ok: true,
            error: None,
        }
    }

    /// A failed statement.
    #[must_use]
    pub fn failed(statement: impl Into<String>, error: StatementError) -> Self {
        Self {
            statement: statement.into(),
            ok: false,
            error: Some(error),
        }
    }
}

/// The privileged procedures and apply lock of one tenant database.
///
/// Implementations must keep per-entry failures inside the returned
/// outcomes; an `Err` means the call as a whole failed.
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Calls `schema_introspection_v1()` and returns its JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::NotBootstrapped`](crate::error::MigrateError::NotBootstrapped)
    /// when the procedure is missing, or the driver error.
    async fn introspect(&self) -> Result<Value>;

    /// Calls `schema_run_selects_v1(queries)`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the call itself fails.
    async fn run_selects(&self, queries: &[String]) -> Result<Vec<QueryOutcome>>;

    /// Calls `schema_execute_statements_v1(statements, allow_destructive,
    /// confirmation_phrase)`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the call itself fails.
    async fn execute_statements(
        &self,
        statements: &[String],
        allow_destructive: bool,
        confirmation_phrase: Option<&str>,
    ) -> Result<Vec<StatementOutcome>>;

    /// Takes the tenant apply lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::LockContention`](crate::error::MigrateError::LockContention)
    /// when another session holds it.
    async fn acquire_apply_lock(&self, tenant_id: &str) -> Result<()>;

    /// Releases the tenant apply lock. Releasing a lock that is not held
    /// is not an error.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the unlock call fails.
    async fn release_apply_lock(&self, tenant_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_outcome_wire_shape() {
        let outcome: StatementOutcome = serde_json::from_value(json!({
            "statement": "CREATE POLICY p ON t",
            "ok": false,
            "error": {"message": "boom", "code": "42P01", "detail": null, "hint": "check it"}
        }))
        .unwrap();
        let error = outcome.error.unwrap();
        assert_eq!(error.code.as_deref(), Some("42P01"));
        assert_eq!(error.hint.as_deref(), Some("check it"));
    }

    #[test]
    fn test_query_outcome_rows_default() {
        let outcome: QueryOutcome =
            serde_json::from_value(json!({"query": "SELECT 1", "ok": true, "error": null})).unwrap();
        assert!(outcome.rows.is_empty());
    }

    #[test]
    fn test_guard_violation_to_statement_error() {
        let error = StatementError::from(&GuardViolation::ForbiddenKeyword("DROP"));
        assert_eq!(error.code.as_deref(), Some("42501"));
        assert!(error.message.contains("DROP"));
    }
}
