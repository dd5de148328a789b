//! The immutable output of planning.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change::{PreflightQuery, RiskLevel, SchemaChange, SummaryCounts};
use crate::diff::SchemaDiff;
use crate::patch::{self, PatchArtifacts};

/// A reviewed-before-applied migration plan for one tenant.
///
/// Fields are private: once built, a plan is only read. It round-trips
/// through JSON so it can be stored in the audit trail and reloaded at
/// apply time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaPlan {
    plan_id: Uuid,
    ssot_version_hash: String,
    db_snapshot_hash_before: String,
    summary_counts: SummaryCounts,
    changes: Vec<SchemaChange>,
    preflight_queries: Vec<PreflightQuery>,
    artifacts: PatchArtifacts,
}

impl SchemaPlan {
    /// Builds a plan from a diff, generating its artifacts.
    #[must_use]
    pub fn new(
        plan_id: Uuid,
        ssot_version_hash: impl Into<String>,
        db_snapshot_hash_before: impl Into<String>,
        diff: SchemaDiff,
    ) -> Self {
        let artifacts = patch::generate_patch(&diff);
        Self {
            plan_id,
            ssot_version_hash: ssot_version_hash.into(),
            db_snapshot_hash_before: db_snapshot_hash_before.into(),
            summary_counts: diff.summary_counts,
            changes: diff.changes,
            preflight_queries: diff.preflight_queries,
            artifacts,
        }
    }

    /// Plan id.
    #[must_use]
    pub const fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    /// SHA-256 of the SSOT text the plan was computed from.
    #[must_use]
    pub fn ssot_version_hash(&self) -> &str {
        &self.ssot_version_hash
    }

    /// SHA-256 of the snapshot the plan was computed against.
    #[must_use]
    pub fn db_snapshot_hash_before(&self) -> &str {
        &self.db_snapshot_hash_before
    }

    /// Changes per risk tier.
    #[must_use]
    pub const fn summary_counts(&self) -> SummaryCounts {
        self.summary_counts
    }

    /// Ordered changes.
    #[must_use]
    pub fn changes(&self) -> &[SchemaChange] {
        &self.changes
    }

    /// Preflight queries.
    #[must_use]
    pub fn preflight_queries(&self) -> &[PreflightQuery] {
        &self.preflight_queries
    }

    /// Generated SQL and Markdown artifacts.
    #[must_use]
    pub const fn artifacts(&self) -> &PatchArtifacts {
        &self.artifacts
    }

    /// Returns true if the plan has nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if the plan has changes above SAFE.
    #[must_use]
    pub fn needs_review(&self) -> bool {
        self.changes.iter().any(|c| c.risk_level > RiskLevel::Safe)
    }

    /// SAFE statements in plan order.
    #[must_use]
    pub fn safe_statements(&self) -> Vec<String> {
        patch::safe_statements(&self.changes)
    }

    /// Executable CAUTION/DESTRUCTIVE statements in plan order.
    #[must_use]
    pub fn manual_statements(&self) -> Vec<String> {
        patch::manual_statements(&self.changes)
    }

    /// Preflight SQL in plan order.
    #[must_use]
    pub fn preflight_sql(&self) -> Vec<String> {
        self.preflight_queries.iter().map(|q| q.sql.clone()).collect()
    }
}
