//! Gated execution against a tenant database.
//!
//! Every call fails fast on the client for entries the server would
//! reject, keeping their position in the batch, and sends the rest in a
//! single procedure call.

use std::sync::Arc;

use schemaguard_core::change::PreflightQuery;
use schemaguard_core::guard::{self, strip_terminator};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{QueryOutcome, SchemaBackend, StatementError, StatementOutcome};
use crate::error::{MigrateError, Result};

/// How a batch of statements may run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Lift the safe-mode statement rules.
    pub allow_destructive: bool,
    /// Must be exactly `ALLOW DESTRUCTIVE CHANGES` in destructive mode.
    pub confirmation_phrase: Option<String>,
}

impl ExecuteOptions {
    /// Safe mode.
    #[must_use]
    pub fn safe() -> Self {
        Self::default()
    }

    /// Destructive mode with the given confirmation phrase.
    #[must_use]
    pub fn destructive(confirmation_phrase: impl Into<String>) -> Self {
        Self {
            allow_destructive: true,
            confirmation_phrase: Some(confirmation_phrase.into()),
        }
    }
}

/// Runs introspection, preflight queries and statements through a
/// [`SchemaBackend`].
pub struct Executor {
    backend: Arc<dyn SchemaBackend>,
    dry_run: bool,
}

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new(backend: Arc<dyn SchemaBackend>) -> Self {
        Self {
            backend,
            dry_run: false,
        }
    }

    /// Enables dry-run mode: statements are logged, not executed.
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Returns true in dry-run mode.
    #[must_use]
    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Returns the backend.
    #[must_use]
    pub const fn backend(&self) -> &Arc<dyn SchemaBackend> {
        &self.backend
    }

    /// Fetches the live schema document.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::NotBootstrapped`] when the procedure is
    /// missing, or a database error.
    pub async fn introspect(&self) -> Result<Value> {
        self.backend.introspect().await
    }

    /// Runs preflight queries.
    ///
    /// # Errors
    ///
    /// Fails only when the procedure call itself fails; per-query
    /// failures are in the outcomes.
    pub async fn run_preflight(&self, queries: &[PreflightQuery]) -> Result<Vec<QueryOutcome>> {
        let sql: Vec<String> = queries.iter().map(|q| q.sql.clone()).collect();
        self.run_selects(&sql).await
    }

    /// Runs read-only SELECT queries, one outcome per query in order.
    ///
    /// # Errors
    ///
    /// Fails only when the procedure call itself fails.
    pub async fn run_selects(&self, queries: &[String]) -> Result<Vec<QueryOutcome>> {
        let mut slots: Vec<Option<QueryOutcome>> = Vec::with_capacity(queries.len());
        let mut to_send = Vec::new();
        for query in queries {
            match guard::check_select(query) {
                Ok(()) => {
                    slots.push(None);
                    to_send.push(query.clone());
                }
                Err(violation) => {
                    warn!(query = %query, %violation, "Preflight query rejected");
                    slots.push(Some(QueryOutcome::failed(
                        query,
                        StatementError::from(&violation),
                    )));
                }
            }
        }

        let sent = if to_send.is_empty() {
            Vec::new()
        } else {
            self.backend.run_selects(&to_send).await?
        };
        merge(slots, sent, "query")
    }

    /// Executes statements, one outcome per statement in order.
    ///
    /// The batch is not atomic: a failing statement does not stop the
    /// ones after it.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Validation`] before any SQL runs when
    /// destructive mode lacks the exact confirmation phrase, and fails
    /// when the procedure call itself fails.
    pub async fn execute(
        &self,
        statements: &[String],
        options: &ExecuteOptions,
    ) -> Result<Vec<StatementOutcome>> {
        guard::check_confirmation(
            options.allow_destructive,
            options.confirmation_phrase.as_deref(),
        )
        .map_err(|v| MigrateError::Validation(v.to_string()))?;

        let mut slots: Vec<Option<StatementOutcome>> = Vec::with_capacity(statements.len());
        let mut to_send = Vec::new();
        for statement in statements {
            let statement = strip_terminator(statement);
            match guard::check_statement(statement, options.allow_destructive) {
                Ok(()) => {
                    slots.push(None);
                    to_send.push(statement.to_string());
                }
                Err(violation) => {
                    warn!(sql = %statement, %violation, "Statement rejected");
                    slots.push(Some(StatementOutcome::failed(
                        statement,
                        StatementError::from(&violation),
                    )));
                }
            }
        }

        if self.dry_run {
            for statement in &to_send {
                info!(sql = %statement, "[dry-run] Would execute");
            }
            let synthetic = to_send.into_iter().map(StatementOutcome::succeeded).collect();
            return merge(slots, synthetic, "statement");
        }

        let sent = if to_send.is_empty() {
            Vec::new()
        } else {
            debug!(
                count = to_send.len(),
                allow_destructive = options.allow_destructive,
                "Sending statements"
            );
            self.backend
                .execute_statements(
                    &to_send,
                    options.allow_destructive,
                    options.confirmation_phrase.as_deref(),
                )
                .await?
        };

        let outcomes = merge(slots, sent, "statement")?;
        let failed = outcomes.iter().filter(|o| !o.ok).count();
        info!(
            total = outcomes.len(),
            failed,
            "Statements executed"
        );
        Ok(outcomes)
    }
}

/// Fills the empty slots with the server's outcomes, in order.
fn merge<T>(slots: Vec<Option<T>>, sent: Vec<T>, what: &str) -> Result<Vec<T>> {
    let expected = slots.iter().filter(|s| s.is_none()).count();
    if sent.len() != expected {
        return Err(MigrateError::InvalidState(format!(
            "server returned {} {what} results for {expected} {what}s",
            sent.len()
        )));
    }
    let mut sent = sent.into_iter();
    Ok(slots
        .into_iter()
        .filter_map(|slot| slot.or_else(|| sent.next()))
        .collect())
}
