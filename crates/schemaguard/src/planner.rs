//! Builds [`SchemaPlan`]s: read, parse, introspect, diff, generate.
//!
//! The planner never persists anything; the service stores what it
//! returns.

use schemaguard_core::diff::{DiffPolicy, diff_schema};
use schemaguard_core::hash::{snapshot_hash, ssot_hash};
use schemaguard_core::plan::SchemaPlan;
use schemaguard_core::snapshot::DbSnapshot;
use schemaguard_core::ssot::parse_ssot;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;
use crate::executor::Executor;
use crate::reader::SsotSource;

/// Computes plans under a fixed risk policy.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    policy: DiffPolicy,
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub const fn new(policy: DiffPolicy) -> Self {
        Self { policy }
    }

    /// The risk policy.
    #[must_use]
    pub const fn policy(&self) -> &DiffPolicy {
        &self.policy
    }

    /// Plans against the live tenant schema.
    ///
    /// # Errors
    ///
    /// Fails when the SSOT cannot be read or parsed, or introspection
    /// fails (including [`MigrateError::NotBootstrapped`](crate::error::MigrateError::NotBootstrapped)).
    pub async fn plan(&self, source: &dyn SsotSource, executor: &Executor) -> Result<SchemaPlan> {
        let ssot = source.read().await?;
        // Parse before touching the database.
        parse_ssot(&ssot)?;
        let snapshot = executor.introspect().await?;
        let plan = self.plan_from(&ssot, &snapshot)?;
        info!(
            ssot = %source.describe(),
            plan_id = %plan.plan_id(),
            safe = plan.summary_counts().safe,
            caution = plan.summary_counts().caution,
            destructive = plan.summary_counts().destructive,
            "Plan created"
        );
        Ok(plan)
    }

    /// Plans from SSOT text and an introspection document.
    ///
    /// # Errors
    ///
    /// Fails when the SSOT cannot be parsed or the document does not
    /// have the snapshot shape.
    pub fn plan_from(&self, ssot: &str, snapshot: &Value) -> Result<SchemaPlan> {
        let expected = parse_ssot(ssot)?;
        let db = DbSnapshot::from_json(snapshot)?;
        let diff = diff_schema(&expected, &db, &self.policy);
        Ok(SchemaPlan::new(
            Uuid::new_v4(),
            ssot_hash(ssot),
            snapshot_hash(snapshot),
            diff,
        ))
    }
}
