//! The audit trail of plans and applies.
//!
//! One row per plan in `schema_migration_audit` on the control
//! database. A record moves `planned` → (preflight attached, still
//! `planned`) → `applied` | `failed`, and never back.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemaguard_core::change::SummaryCounts;
use schemaguard_core::plan::SchemaPlan;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use uuid::Uuid;

use crate::backend::{QueryOutcome, StatementOutcome};
use crate::error::{MigrateError, Result};

/// SQL to create the audit table (PostgreSQL).
pub const CREATE_AUDIT_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migration_audit (
    id uuid PRIMARY KEY,
    tenant_id text NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    ssot_hash text NOT NULL,
    snapshot_hash_before text NOT NULL,
    snapshot_hash_after text,
    summary_counts jsonb NOT NULL,
    plan_json jsonb NOT NULL,
    preflight_results jsonb,
    approver_id text,
    approval_method text,
    approval_phrase text,
    executed_sql_safe text,
    executed_sql_manual text,
    executed_result jsonb,
    status text NOT NULL CHECK (status IN ('planned', 'applied', 'failed'))
)
";

/// SQL to index the audit table for history listing.
pub const CREATE_AUDIT_INDEX_SQL: &str = r"
CREATE INDEX IF NOT EXISTS schema_migration_audit_tenant_created_idx
    ON schema_migration_audit (tenant_id, created_at DESC)
";

/// Lifecycle state of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Plan stored, nothing applied.
    Planned,
    /// Every statement of the apply succeeded.
    Applied,
    /// The apply ran with failures, or could not run.
    Failed,
}

impl AuditStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "planned" => Ok(Self::Planned),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(MigrateError::InvalidState(format!(
                "unknown audit status '{other}'"
            ))),
        }
    }
}

/// Which apply path was approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMethod {
    /// SAFE statements only.
    ApplySafe,
    /// Manual statements with the confirmation phrase.
    ApplyDestructive,
}

impl ApprovalMethod {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApplySafe => "apply_safe",
            Self::ApplyDestructive => "apply_destructive",
        }
    }
}

impl FromStr for ApprovalMethod {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apply_safe" => Ok(Self::ApplySafe),
            "apply_destructive" => Ok(Self::ApplyDestructive),
            other => Err(MigrateError::InvalidState(format!(
                "unknown approval method '{other}'"
            ))),
        }
    }
}

/// Who approved an apply, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approval {
    /// Approving operator.
    pub approver_id: String,
    /// Apply path.
    pub method: ApprovalMethod,
    /// Confirmation phrase given, for destructive applies.
    pub phrase: Option<String>,
}

/// One plan's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Equal to the plan id.
    pub id: Uuid,
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ssot_hash: String,
    pub snapshot_hash_before: String,
    pub snapshot_hash_after: Option<String>,
    pub summary_counts: SummaryCounts,
    /// The full [`SchemaPlan`] as JSON.
    pub plan_json: Value,
    pub preflight_results: Option<Value>,
    pub approver_id: Option<String>,
    pub approval_method: Option<ApprovalMethod>,
    pub approval_phrase: Option<String>,
    pub executed_sql_safe: Option<String>,
    pub executed_sql_manual: Option<String>,
    /// Per-statement outcomes, or `{"error": ...}` when the call failed.
    pub executed_result: Option<Value>,
    pub status: AuditStatus,
}

impl AuditRecord {
    /// A fresh `planned` record for `plan`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the plan cannot be encoded.
    pub fn planned(tenant_id: impl Into<String>, plan: &SchemaPlan) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: plan.plan_id(),
            tenant_id: tenant_id.into(),
            created_at: now,
            updated_at: now,
            ssot_hash: plan.ssot_version_hash().to_string(),
            snapshot_hash_before: plan.db_snapshot_hash_before().to_string(),
            snapshot_hash_after: None,
            summary_counts: plan.summary_counts(),
            plan_json: serde_json::to_value(plan)?,
            preflight_results: None,
            approver_id: None,
            approval_method: None,
            approval_phrase: None,
            executed_sql_safe: None,
            executed_sql_manual: None,
            executed_result: None,
            status: AuditStatus::Planned,
        })
    }

    /// Decodes the stored plan.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `plan_json` is not a plan.
    pub fn plan(&self) -> Result<SchemaPlan> {
        Ok(serde_json::from_value(self.plan_json.clone())?)
    }

    fn ensure_planned(&self) -> Result<()> {
        if self.status == AuditStatus::Planned {
            Ok(())
        } else {
            Err(MigrateError::InvalidState(format!(
                "plan {} is already {}",
                self.id, self.status
            )))
        }
    }

    /// Attaches preflight results. The record stays `planned`; running
    /// preflight again replaces them.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::InvalidState`] unless the record is `planned`.
    pub fn attach_preflight(&mut self, results: &[QueryOutcome]) -> Result<()> {
        self.ensure_planned()?;
        self.preflight_results = Some(serde_json::to_value(results)?);
        self.updated_at = Utc::now();
        Ok(())
    }

    fn record_approval(&mut self, approval: &Approval, statements: &[String]) {
        let executed = statements.join("\n");
        match approval.method {
            ApprovalMethod::ApplySafe => self.executed_sql_safe = Some(executed),
            ApprovalMethod::ApplyDestructive => self.executed_sql_manual = Some(executed),
        }
        self.approver_id = Some(approval.approver_id.clone());
        self.approval_method = Some(approval.method);
        self.approval_phrase.clone_from(&approval.phrase);
        self.updated_at = Utc::now();
    }

    /// Records a finished apply: `applied` if every statement succeeded,
    /// `failed` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::InvalidState`] unless the record is `planned`.
    pub fn complete(
        &mut self,
        approval: &Approval,
        statements: &[String],
        outcomes: &[StatementOutcome],
        snapshot_hash_after: Option<String>,
    ) -> Result<AuditStatus> {
        self.ensure_planned()?;
        self.record_approval(approval, statements);
        self.executed_result = Some(serde_json::to_value(outcomes)?);
        self.snapshot_hash_after = snapshot_hash_after;
        self.status = if outcomes.iter().all(|o| o.ok) {
            AuditStatus::Applied
        } else {
            AuditStatus::Failed
        };
        Ok(self.status)
    }

    /// Records an apply that could not run.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::InvalidState`] unless the record is `planned`.
    pub fn fail(
        &mut self,
        approval: &Approval,
        statements: &[String],
        error: &MigrateError,
    ) -> Result<()> {
        self.ensure_planned()?;
        self.record_approval(approval, statements);
        self.executed_result = Some(json!({ "error": error.to_string() }));
        self.status = AuditStatus::Failed;
        Ok(())
    }
}

/// Persistence of audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Creates the backing table if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the table cannot be created.
    async fn init(&self) -> Result<()>;

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// Returns an error if a record with the same id exists or the write
    /// fails.
    async fn insert(&self, record: &AuditRecord) -> Result<()>;

    /// Replaces a stored record that is still `planned`.
    ///
    /// The write is a compare-and-set on the stored status: once a
    /// record has reached `applied` or `failed`, every later update is
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::InvalidState`] if the record is missing or
    /// no longer `planned`.
    async fn update(&self, record: &AuditRecord) -> Result<()>;

    /// Loads a record by plan id.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored row cannot be decoded.
    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>>;

    /// Lists a tenant's records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a stored row cannot be decoded.
    async fn list(&self, tenant_id: &str, limit: usize) -> Result<Vec<AuditRecord>>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Audit records in the control database.
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    /// Creates a store over the control pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn from_row(row: &PgRow) -> Result<AuditRecord> {
        let status: String = row.try_get("status")?;
        let method: Option<String> = row.try_get("approval_method")?;
        let Json(summary_counts): Json<SummaryCounts> = row.try_get("summary_counts")?;
        Ok(AuditRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            ssot_hash: row.try_get("ssot_hash")?,
            snapshot_hash_before: row.try_get("snapshot_hash_before")?,
            snapshot_hash_after: row.try_get("snapshot_hash_after")?,
            summary_counts,
            plan_json: row.try_get("plan_json")?,
            preflight_results: row.try_get("preflight_results")?,
            approver_id: row.try_get("approver_id")?,
            approval_method: method.as_deref().map(str::parse::<ApprovalMethod>).transpose()?,
            approval_phrase: row.try_get("approval_phrase")?,
            executed_sql_safe: row.try_get("executed_sql_safe")?,
            executed_sql_manual: row.try_get("executed_sql_manual")?,
            executed_result: row.try_get("executed_result")?,
            status: status.parse::<AuditStatus>()?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, tenant_id, created_at, updated_at, ssot_hash, \
    snapshot_hash_before, snapshot_hash_after, summary_counts, plan_json, \
    preflight_results, approver_id, approval_method, approval_phrase, \
    executed_sql_safe, executed_sql_manual, executed_result, status";

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_AUDIT_TABLE_SQL)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_AUDIT_INDEX_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(&self, record: &AuditRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO schema_migration_audit \
             (id, tenant_id, created_at, updated_at, ssot_hash, snapshot_hash_before, \
              summary_counts, plan_json, preflight_results, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.id)
        .bind(&record.tenant_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(&record.ssot_hash)
        .bind(&record.snapshot_hash_before)
        .bind(Json(record.summary_counts))
        .bind(&record.plan_json)
        .bind(&record.preflight_results)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, record: &AuditRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schema_migration_audit SET \
             updated_at = $2, snapshot_hash_after = $3, preflight_results = $4, \
             approver_id = $5, approval_method = $6, approval_phrase = $7, \
             executed_sql_safe = $8, executed_sql_manual = $9, executed_result = $10, \
             status = $11 \
             WHERE id = $1 AND status = 'planned'",
        )
        .bind(record.id)
        .bind(record.updated_at)
        .bind(&record.snapshot_hash_after)
        .bind(&record.preflight_results)
        .bind(&record.approver_id)
        .bind(record.approval_method.map(ApprovalMethod::as_str))
        .bind(&record.approval_phrase)
        .bind(&record.executed_sql_safe)
        .bind(&record.executed_sql_manual)
        .bind(&record.executed_result)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MigrateError::InvalidState(format!(
                "audit record {} does not exist or is no longer planned",
                record.id
            )));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM schema_migration_audit WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list(&self, tenant_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM schema_migration_audit \
             WHERE tenant_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::from_row).collect()
    }
}

// =============================================================================
// In memory
// =============================================================================

/// Audit records held in memory, for offline runs and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, record: &AuditRecord) -> Result<()> {
        let mut records = self.records();
        if records.iter().any(|r| r.id == record.id) {
            return Err(MigrateError::InvalidState(format!(
                "audit record {} already exists",
                record.id
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn update(&self, record: &AuditRecord) -> Result<()> {
        let mut records = self.records();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) if existing.status == AuditStatus::Planned => {
                *existing = record.clone();
                Ok(())
            }
            Some(existing) => Err(MigrateError::InvalidState(format!(
                "audit record {} is already {}",
                record.id, existing.status
            ))),
            None => Err(MigrateError::InvalidState(format!(
                "audit record {} does not exist",
                record.id
            ))),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditRecord>> {
        Ok(self.records().iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, tenant_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        // Insertion order breaks created_at ties.
        Ok(self
            .records()
            .iter()
            .rev()
            .filter(|r| r.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StatementError;
    use schemaguard_core::diff::{DiffPolicy, diff_schema};
    use schemaguard_core::expectation::{Column, SchemaExpectation, Table};
    use schemaguard_core::snapshot::DbSnapshot;

    fn plan() -> SchemaPlan {
        let expected =
            SchemaExpectation::new().table(Table::new("t", vec![Column::new("id", "uuid")]));
        let diff = diff_schema(&expected, &DbSnapshot::default(), &DiffPolicy::new());
        SchemaPlan::new(Uuid::new_v4(), "a", "b", diff)
    }

    fn approval() -> Approval {
        Approval {
            approver_id: "ops@example.com".into(),
            method: ApprovalMethod::ApplySafe,
            phrase: None,
        }
    }

    #[test]
    fn test_planned_record_mirrors_plan() {
        let plan = plan();
        let record = AuditRecord::planned("tenant-1", &plan).unwrap();
        assert_eq!(record.id, plan.plan_id());
        assert_eq!(record.status, AuditStatus::Planned);
        assert_eq!(record.summary_counts, plan.summary_counts());
        assert_eq!(record.plan().unwrap(), plan);
    }

    #[test]
    fn test_preflight_keeps_planned() {
        let mut record = AuditRecord::planned("tenant-1", &plan()).unwrap();
        record.attach_preflight(&[]).unwrap();
        assert_eq!(record.status, AuditStatus::Planned);
        assert_eq!(record.preflight_results, Some(json!([])));
    }

    #[test]
    fn test_complete_all_ok_is_applied() {
        let mut record = AuditRecord::planned("tenant-1", &plan()).unwrap();
        let statements = vec!["CREATE POLICY p ON t".to_string()];
        let outcomes = vec![StatementOutcome::succeeded("CREATE POLICY p ON t")];
        let status = record
            .complete(&approval(), &statements, &outcomes, Some("after".into()))
            .unwrap();
        assert_eq!(status, AuditStatus::Applied);
        assert_eq!(record.executed_sql_safe.as_deref(), Some("CREATE POLICY p ON t"));
        assert_eq!(record.executed_sql_manual, None);
        assert_eq!(record.approver_id.as_deref(), Some("ops@example.com"));
        assert_eq!(record.snapshot_hash_after.as_deref(), Some("after"));
    }

    #[test]
    fn test_complete_with_failure_is_failed() {
        let mut record = AuditRecord::planned("tenant-1", &plan()).unwrap();
        let outcomes = vec![
            StatementOutcome::succeeded("a"),
            StatementOutcome::failed("b", StatementError::new("boom", "XX000")),
        ];
        let status = record
            .complete(&approval(), &["a".into(), "b".into()], &outcomes, None)
            .unwrap();
        assert_eq!(status, AuditStatus::Failed);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut record = AuditRecord::planned("tenant-1", &plan()).unwrap();
        record.complete(&approval(), &[], &[], None).unwrap();
        assert_eq!(record.status, AuditStatus::Applied);

        assert!(matches!(
            record.attach_preflight(&[]),
            Err(MigrateError::InvalidState(_))
        ));
        assert!(matches!(
            record.complete(&approval(), &[], &[], None),
            Err(MigrateError::InvalidState(_))
        ));
        let err = MigrateError::Validation("x".into());
        assert!(record.fail(&approval(), &[], &err).is_err());
    }

    #[test]
    fn test_fail_records_error() {
        let mut record = AuditRecord::planned("tenant-1", &plan()).unwrap();
        let err = MigrateError::Database {
            message: "connection reset".into(),
            code: None,
            detail: None,
            hint: None,
        };
        record.fail(&approval(), &["a".into()], &err).unwrap();
        assert_eq!(record.status, AuditStatus::Failed);
        assert!(record.executed_result.as_ref().unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("connection reset"));
    }

    #[test]
    fn test_status_round_trip() {
        for status in [AuditStatus::Planned, AuditStatus::Applied, AuditStatus::Failed] {
            assert_eq!(status.as_str().parse::<AuditStatus>().unwrap(), status);
        }
        assert!("done".parse::<AuditStatus>().is_err());
    }

    #[tokio::test]
    async fn test_memory_store_lists_newest_first_per_tenant() {
        let store = MemoryAuditStore::new();
        let first = AuditRecord::planned("t1", &plan()).unwrap();
        let other = AuditRecord::planned("t2", &plan()).unwrap();
        let second = AuditRecord::planned("t1", &plan()).unwrap();
        for record in [&first, &other, &second] {
            store.insert(record).await.unwrap();
        }

        let listed = store.list("t1", 10).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|r| r.id).collect();
        assert_eq!(ids, [second.id, first.id]);
        assert_eq!(store.list("t1", 1).await.unwrap().len(), 1);
        assert!(store.insert(&first).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_refuses_update_after_terminal_state() {
        let store = MemoryAuditStore::new();
        let planned = AuditRecord::planned("t1", &plan()).unwrap();
        store.insert(&planned).await.unwrap();

        let mut applied = planned.clone();
        applied.complete(&approval(), &[], &[], None).unwrap();
        store.update(&applied).await.unwrap();

        let mut stale = planned;
        stale.fail(&approval(), &[], &MigrateError::Validation("late".into())).unwrap();
        assert!(matches!(
            store.update(&stale).await,
            Err(MigrateError::InvalidState(_))
        ));
        assert_eq!(
            store.get(applied.id).await.unwrap().unwrap().status,
            AuditStatus::Applied
        );
    }
}
