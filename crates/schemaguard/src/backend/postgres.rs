use async_trait::async_trait;
use schemaguard_core::hash::apply_lock_key;
use serde_json::Value;
use sqlx::Postgres;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{QueryOutcome, SchemaBackend, StatementOutcome};
use crate::bootstrap::{
    EXECUTE_STATEMENTS_PROCEDURE, INTROSPECTION_PROCEDURE, RUN_SELECTS_PROCEDURE, bootstrap_sql,
};
use crate::error::{MigrateError, Result, UNDEFINED_FUNCTION};

/// Calls the privileged procedures of one tenant database.
///
/// The pool should have at least two connections: the apply lock pins
/// one connection for the duration of an apply.
pub struct PgBackend {
    pool: PgPool,
    service_role: String,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgBackend {
    /// Creates a backend over a tenant pool. `service_role` is used in
    /// the remediation SQL when the procedures are missing.
    #[must_use]
    pub fn new(pool: PgPool, service_role: impl Into<String>) -> Self {
        Self {
            pool,
            service_role: service_role.into(),
            lock_conn: Mutex::new(None),
        }
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn classify(&self, err: &sqlx::Error, procedure: &str) -> MigrateError {
        let classified = MigrateError::from_sqlx(err);
        if classified.sqlstate() == Some(UNDEFINED_FUNCTION) {
            return MigrateError::NotBootstrapped {
                procedure: procedure.to_string(),
                remediation_sql: bootstrap_sql(&self.service_role),
            };
        }
        classified
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    async fn introspect(&self) -> Result<Value> {
        debug!(procedure = INTROSPECTION_PROCEDURE, "Introspecting tenant schema");
        sqlx::query_scalar::<_, Value>("SELECT public.schema_introspection_v1()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.classify(&e, INTROSPECTION_PROCEDURE))
    }

    async fn run_selects(&self, queries: &[String]) -> Result<Vec<QueryOutcome>> {
        debug!(procedure = RUN_SELECTS_PROCEDURE, count = queries.len(), "Running preflight");
        let results: Value = sqlx::query_scalar("SELECT public.schema_run_selects_v1($1)")
            .bind(queries)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.classify(&e, RUN_SELECTS_PROCEDURE))?;
        Ok(serde_json::from_value(results)?)
    }

    async fn execute_statements(
        &self,
        statements: &[String],
        allow_destructive: bool,
        confirmation_phrase: Option<&str>,
    ) -> Result<Vec<StatementOutcome>> {
        debug!(
            procedure = EXECUTE_STATEMENTS_PROCEDURE,
            count = statements.len(),
            allow_destructive,
            "Executing statements"
        );
        let results: Value =
            sqlx::query_scalar("SELECT public.schema_execute_statements_v1($1, $2, $3)")
                .bind(statements)
                .bind(allow_destructive)
                .bind(confirmation_phrase)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| self.classify(&e, EXECUTE_STATEMENTS_PROCEDURE))?;
        Ok(serde_json::from_value(results)?)
    }

    async fn acquire_apply_lock(&self, tenant_id: &str) -> Result<()> {
        let key = apply_lock_key(tenant_id);
        let mut held = self.lock_conn.lock().await;
        if held.is_some() {
            return Err(MigrateError::LockContention {
                tenant_id: tenant_id.to_string(),
            });
        }

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Err(MigrateError::LockContention {
                tenant_id: tenant_id.to_string(),
            });
        }
        debug!(tenant = %tenant_id, key, "Apply lock acquired");
        *held = Some(conn);
        Ok(())
    }

    async fn release_apply_lock(&self, tenant_id: &str) -> Result<()> {
        let Some(mut conn) = self.lock_conn.lock().await.take() else {
            return Ok(());
        };
        let key = apply_lock_key(tenant_id);
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await;
        match released {
            Ok(true) => {
                debug!(tenant = %tenant_id, key, "Apply lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(tenant = %tenant_id, key, "Apply lock was not held by this session");
                Ok(())
            }
            Err(e) => {
                // A session lock dies with its connection.
                let _ = conn.close().await;
                Err(e.into())
            }
        }
    }
}
