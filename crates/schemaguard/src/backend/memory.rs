use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use schemaguard_core::guard::{self, strip_terminator};
use serde_json::{Value, json};
use tracing::debug;

use super::{QueryOutcome, SchemaBackend, StatementError, StatementOutcome};
use crate::bootstrap::{INTROSPECTION_PROCEDURE, bootstrap_sql};
use crate::config::DEFAULT_SERVICE_ROLE;
use crate::error::{MigrateError, Result};

#[derive(Debug, Default)]
struct State {
    snapshot: Value,
    executed: Vec<String>,
    queried: Vec<String>,
    rpc_calls: usize,
    locked: HashSet<String>,
}

/// A tenant database held in memory.
///
/// Serves a fixed introspection document, applies the same statement
/// rules as the server procedures, and records what it was asked to
/// run. Statements never change the snapshot by themselves; use
/// [`InMemoryBackend::snapshot_after_apply`] to model the effect of an
/// apply.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    bootstrapped: bool,
    failing_statements: HashMap<String, StatementError>,
    failing_queries: HashMap<String, StatementError>,
    query_rows: HashMap<String, Vec<Value>>,
    after_apply: Option<Value>,
    state: Mutex<State>,
}

impl InMemoryBackend {
    /// Creates a bootstrapped backend serving `snapshot`.
    #[must_use]
    pub fn new(snapshot: Value) -> Self {
        Self {
            bootstrapped: true,
            state: Mutex::new(State {
                snapshot,
                ..State::default()
            }),
            ..Self::default()
        }
    }

    /// Creates a backend whose procedures are not installed.
    #[must_use]
    pub fn not_bootstrapped() -> Self {
        Self {
            bootstrapped: false,
            ..Self::new(json!({}))
        }
    }

    /// Makes `statement` fail with `error` when executed.
    #[must_use]
    pub fn fail_statement(mut self, statement: &str, error: StatementError) -> Self {
        self.failing_statements
            .insert(strip_terminator(statement).to_string(), error);
        self
    }

    /// Makes `query` fail with `error`.
    #[must_use]
    pub fn fail_query(mut self, query: &str, error: StatementError) -> Self {
        self.failing_queries.insert(query.to_string(), error);
        self
    }

    /// Sets the rows returned for `query`. Other queries return no rows.
    #[must_use]
    pub fn query_rows(mut self, query: &str, rows: Vec<Value>) -> Self {
        self.query_rows.insert(query.to_string(), rows);
        self
    }

    /// Replaces the snapshot after every execute call that ran at least
    /// one statement successfully.
    #[must_use]
    pub fn snapshot_after_apply(mut self, snapshot: Value) -> Self {
        self.after_apply = Some(snapshot);
        self
    }

    /// Statements that ran successfully, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    /// Queries that ran successfully, in order.
    #[must_use]
    pub fn queried(&self) -> Vec<String> {
        self.state().queried.clone()
    }

    /// Number of procedure calls made.
    #[must_use]
    pub fn rpc_calls(&self) -> usize {
        self.state().rpc_calls
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.state().snapshot.clone()
    }

    /// Marks the tenant lock as held by another session.
    pub fn hold_lock(&self, tenant_id: &str) {
        self.state().locked.insert(tenant_id.to_string());
    }

    /// Returns true if the tenant lock is held.
    #[must_use]
    pub fn is_locked(&self, tenant_id: &str) -> bool {
        self.state().locked.contains(tenant_id)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(&self, procedure: &str) -> Result<()> {
        self.state().rpc_calls += 1;
        if self.bootstrapped {
            Ok(())
        } else {
            Err(MigrateError::NotBootstrapped {
                procedure: procedure.to_string(),
                remediation_sql: bootstrap_sql(DEFAULT_SERVICE_ROLE),
            })
        }
    }
}

#[async_trait]
impl SchemaBackend for InMemoryBackend {
    async fn introspect(&self) -> Result<Value> {
        self.call(INTROSPECTION_PROCEDURE)?;
        Ok(self.snapshot())
    }

    async fn run_selects(&self, queries: &[String]) -> Result<Vec<QueryOutcome>> {
        self.call(crate::bootstrap::RUN_SELECTS_PROCEDURE)?;
        let mut outcomes = Vec::with_capacity(queries.len());
        for query in queries {
            if let Err(violation) = guard::check_select(query) {
                outcomes.push(QueryOutcome::failed(query, StatementError::from(&violation)));
                continue;
            }
            if let Some(error) = self.failing_queries.get(query) {
                outcomes.push(QueryOutcome::failed(query, error.clone()));
                continue;
            }
            self.state().queried.push(query.clone());
            outcomes.push(QueryOutcome {
                query: query.clone(),
                ok: true,
                rows: self.query_rows.get(query).cloned().unwrap_or_default(),
                error: None,
            });
        }
        Ok(outcomes)
    }

    async fn execute_statements(
        &self,
        statements: &[String],
        allow_destructive: bool,
        confirmation_phrase: Option<&str>,
    ) -> Result<Vec<StatementOutcome>> {
        self.call(crate::bootstrap::EXECUTE_STATEMENTS_PROCEDURE)?;
        if let Err(violation) = guard::check_confirmation(allow_destructive, confirmation_phrase) {
            return Err(MigrateError::Database {
                message: violation.to_string(),
                code: Some(violation.sqlstate().to_string()),
                detail: None,
                hint: None,
            });
        }

        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            if let Err(violation) = guard::check_statement(statement, allow_destructive) {
                outcomes.push(StatementOutcome::failed(
                    statement,
                    StatementError::from(&violation),
                ));
                continue;
            }
            if let Some(error) = self.failing_statements.get(strip_terminator(statement)) {
                outcomes.push(StatementOutcome::failed(statement, error.clone()));
                continue;
            }
            debug!(sql = %statement, "In-memory execute");
            self.state().executed.push(statement.clone());
            outcomes.push(StatementOutcome::succeeded(statement));
        }

        if outcomes.iter().any(|o| o.ok) {
            if let Some(after) = &self.after_apply {
                self.state().snapshot = after.clone();
            }
        }
        Ok(outcomes)
    }

    async fn acquire_apply_lock(&self, tenant_id: &str) -> Result<()> {
        if self.state().locked.insert(tenant_id.to_string()) {
            Ok(())
        } else {
            Err(MigrateError::LockContention {
                tenant_id: tenant_id.to_string(),
            })
        }
    }

    async fn release_apply_lock(&self, tenant_id: &str) -> Result<()> {
        self.state().locked.remove(tenant_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_rules_enforced() {
        let backend = InMemoryBackend::new(json!({}));
        let outcomes = backend
            .execute_statements(
                &["DROP TABLE t".to_string(), "CREATE POLICY p ON t".to_string()],
                false,
                None,
            )
            .await
            .unwrap();
        assert!(!outcomes[0].ok);
        assert!(outcomes[1].ok);
        assert_eq!(backend.executed(), ["CREATE POLICY p ON t"]);
    }

    #[tokio::test]
    async fn test_phrase_checked_before_statements() {
        let backend = InMemoryBackend::new(json!({}));
        let err = backend
            .execute_statements(&["DROP TABLE t".to_string()], true, Some("yes"))
            .await
            .unwrap_err();
        assert_eq!(err.sqlstate(), Some("22023"));
        assert!(backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_not_bootstrapped() {
        let backend = InMemoryBackend::not_bootstrapped();
        let err = backend.introspect().await.unwrap_err();
        match err {
            MigrateError::NotBootstrapped {
                procedure,
                remediation_sql,
            } => {
                assert_eq!(procedure, "schema_introspection_v1");
                assert!(remediation_sql.contains("schema_execute_statements_v1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let backend = InMemoryBackend::new(json!({}));
        backend.acquire_apply_lock("t1").await.unwrap();
        assert!(matches!(
            backend.acquire_apply_lock("t1").await,
            Err(MigrateError::LockContention { .. })
        ));
        backend.acquire_apply_lock("t2").await.unwrap();
        backend.release_apply_lock("t1").await.unwrap();
        backend.acquire_apply_lock("t1").await.unwrap();
    }
}
