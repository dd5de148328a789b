//! The operator contract for one tenant: plan, preflight, apply, history.

use std::sync::Arc;

use schemaguard_core::guard;
use schemaguard_core::hash::snapshot_hash;
use schemaguard_core::plan::SchemaPlan;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{Approval, ApprovalMethod, AuditRecord, AuditStatus, AuditStore};
use crate::backend::{QueryOutcome, StatementOutcome};
use crate::error::{MigrateError, Result};
use crate::executor::{ExecuteOptions, Executor};
use crate::planner::Planner;
use crate::reader::SsotSource;

/// Result of [`MigrationService::create_plan`].
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    /// The stored plan.
    pub plan: SchemaPlan,
    /// Preflight results, when preflight was requested.
    pub preflight_results: Option<Vec<QueryOutcome>>,
}

/// Result of an apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub plan_id: Uuid,
    /// Final status. In dry-run mode the stored record stays `planned`.
    pub status: AuditStatus,
    pub dry_run: bool,
    /// One outcome per statement, in plan order.
    pub results: Vec<StatementOutcome>,
    pub snapshot_hash_after: Option<String>,
}

impl ApplyReport {
    /// Number of failed statements.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }
}

/// Plans and applies migrations for one tenant, recording every step in
/// the audit trail.
pub struct MigrationService {
    tenant_id: String,
    ssot: Arc<dyn SsotSource>,
    executor: Executor,
    planner: Planner,
    audit: Arc<dyn AuditStore>,
}

impl MigrationService {
    /// Creates a service.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        ssot: Arc<dyn SsotSource>,
        executor: Executor,
        planner: Planner,
        audit: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ssot,
            executor,
            planner,
            audit,
        }
    }

    /// The tenant this service works on.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Computes a plan against the live schema and stores it as
    /// `planned`, optionally running its preflight queries first.
    ///
    /// # Errors
    ///
    /// Fails on SSOT, introspection, preflight or audit errors. Nothing
    /// is stored on failure.
    pub async fn create_plan(&self, run_preflight: bool) -> Result<PlanReport> {
        let plan = self.planner.plan(self.ssot.as_ref(), &self.executor).await?;
        let mut record = AuditRecord::planned(&self.tenant_id, &plan)?;

        let preflight_results = if run_preflight && !plan.preflight_queries().is_empty() {
            let results = self.executor.run_preflight(plan.preflight_queries()).await?;
            record.attach_preflight(&results)?;
            Some(results)
        } else {
            None
        };

        self.audit.insert(&record).await?;
        info!(
            tenant_id = %self.tenant_id,
            plan_id = %plan.plan_id(),
            changes = plan.changes().len(),
            "Plan stored"
        );
        Ok(PlanReport {
            plan,
            preflight_results,
        })
    }

    /// Runs the preflight queries of a stored plan and attaches the
    /// results to it.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Validation`] for unknown, foreign or
    /// already-applied plans.
    pub async fn run_preflight(&self, plan_id: Uuid) -> Result<Vec<QueryOutcome>> {
        let mut record = self.load_planned(plan_id).await?;
        let plan = record.plan()?;
        let results = self.executor.run_preflight(plan.preflight_queries()).await?;
        record.attach_preflight(&results)?;
        self.audit.update(&record).await?;
        info!(
            plan_id = %plan_id,
            queries = results.len(),
            failed = results.iter().filter(|r| !r.ok).count(),
            "Preflight attached"
        );
        Ok(results)
    }

    /// Applies the SAFE statements of a stored plan.
    ///
    /// # Errors
    ///
    /// See [`MigrationService::apply_destructive`].
    pub async fn apply_safe(&self, plan_id: Uuid, approver_id: &str) -> Result<ApplyReport> {
        let approval = Approval {
            approver_id: approver_id.to_string(),
            method: ApprovalMethod::ApplySafe,
            phrase: None,
        };
        self.apply(
            plan_id,
            &approval,
            &ExecuteOptions::safe(),
            SchemaPlan::safe_statements,
        )
        .await
    }

    /// Applies the executable CAUTION and DESTRUCTIVE statements of a
    /// stored plan.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Validation`] before anything else when the
    /// phrase is not exactly `ALLOW DESTRUCTIVE CHANGES`, or when the
    /// plan is unknown, belongs to another tenant or is not `planned`.
    /// Returns [`MigrateError::LockContention`] when another apply holds
    /// the tenant lock. Procedure-level failures are recorded as
    /// `failed` and returned.
    pub async fn apply_destructive(
        &self,
        plan_id: Uuid,
        approver_id: &str,
        confirmation_phrase: &str,
    ) -> Result<ApplyReport> {
        guard::check_confirmation(true, Some(confirmation_phrase))
            .map_err(|v| MigrateError::Validation(v.to_string()))?;
        let approval = Approval {
            approver_id: approver_id.to_string(),
            method: ApprovalMethod::ApplyDestructive,
            phrase: Some(confirmation_phrase.to_string()),
        };
        self.apply(
            plan_id,
            &approval,
            &ExecuteOptions::destructive(confirmation_phrase),
            SchemaPlan::manual_statements,
        )
        .await
    }

    /// Lists this tenant's audit records, newest first.
    ///
    /// # Errors
    ///
    /// Fails when the audit store cannot be read.
    pub async fn history(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.audit.list(&self.tenant_id, limit).await
    }

    async fn load_planned(&self, plan_id: Uuid) -> Result<AuditRecord> {
        let record = self
            .audit
            .get(plan_id)
            .await?
            .ok_or_else(|| MigrateError::Validation(format!("unknown plan {plan_id}")))?;
        if record.tenant_id != self.tenant_id {
            return Err(MigrateError::Validation(format!(
                "plan {plan_id} belongs to another tenant"
            )));
        }
        if record.status != AuditStatus::Planned {
            return Err(MigrateError::Validation(format!(
                "plan {plan_id} is already {}",
                record.status
            )));
        }
        Ok(record)
    }

    async fn apply(
        &self,
        plan_id: Uuid,
        approval: &Approval,
        options: &ExecuteOptions,
        select: fn(&SchemaPlan) -> Vec<String>,
    ) -> Result<ApplyReport> {
        // The status check must happen under the lock.
        let backend = self.executor.backend();
        backend.acquire_apply_lock(&self.tenant_id).await?;
        let applied = self.apply_locked(plan_id, approval, options, select).await;
        if let Err(err) = backend.release_apply_lock(&self.tenant_id).await {
            warn!(tenant_id = %self.tenant_id, error = %err, "Failed to release apply lock");
        }
        applied
    }

    async fn apply_locked(
        &self,
        plan_id: Uuid,
        approval: &Approval,
        options: &ExecuteOptions,
        select: fn(&SchemaPlan) -> Vec<String>,
    ) -> Result<ApplyReport> {
        let mut record = self.load_planned(plan_id).await?;
        let statements = select(&record.plan()?);
        info!(
            tenant_id = %self.tenant_id,
            plan_id = %plan_id,
            method = approval.method.as_str(),
            statements = statements.len(),
            dry_run = self.executor.is_dry_run(),
            "Applying plan"
        );

        let results = match self.executor.execute(&statements, options).await {
            Ok(results) => results,
            Err(err) => {
                error!(plan_id = %plan_id, error = %err, "Apply failed");
                if !self.executor.is_dry_run() {
                    record.fail(approval, &statements, &err)?;
                    self.audit.update(&record).await?;
                }
                return Err(err);
            }
        };

        if self.executor.is_dry_run() {
            let status = if results.iter().all(|r| r.ok) {
                AuditStatus::Applied
            } else {
                AuditStatus::Failed
            };
            return Ok(ApplyReport {
                plan_id,
                status,
                dry_run: true,
                results,
                snapshot_hash_after: None,
            });
        }

        let after = match self.executor.introspect().await {
            Ok(snapshot) => Some(snapshot_hash(&snapshot)),
            Err(err) => {
                warn!(plan_id = %plan_id, error = %err, "Post-apply introspection failed");
                None
            }
        };
        let status = record.complete(approval, &statements, &results, after.clone())?;
        self.audit.update(&record).await?;

        let failed = results.iter().filter(|r| !r.ok).count();
        if failed > 0 {
            warn!(plan_id = %plan_id, failed, "Apply finished with failures");
        } else {
            info!(plan_id = %plan_id, status = %status, "Apply finished");
        }
        Ok(ApplyReport {
            plan_id,
            status,
            dry_run: false,
            results,
            snapshot_hash_after: after,
        })
    }
}
