//! Gated, audited schema drift migrations for per-tenant PostgreSQL
//! databases.
//!
//! `schemaguard` is the runtime half of the system. It reaches each
//! tenant database only through three privileged procedures installed
//! by [`bootstrap::bootstrap_sql`], and records every plan and apply in
//! an audit table on a control database.
//!
//! # Architecture
//!
//! - **Backend** - the privileged procedures and tenant apply lock
//!   ([`backend::PgBackend`], [`backend::InMemoryBackend`])
//! - **Executor** - client-side gating and dry-run in front of the backend
//! - **Planner** - SSOT + introspection into a [`SchemaPlan`](schemaguard_core::plan::SchemaPlan)
//! - **Audit** - the `schema_migration_audit` trail
//! - **Service** - create-plan, preflight, apply-safe, apply-destructive, history
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use schemaguard::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> schemaguard::error::Result<()> {
//! let backend = Arc::new(InMemoryBackend::new(json!({})));
//! let service = MigrationService::new(
//!     "tenant-1",
//!     Arc::new(SsotText::new("CREATE TABLE IF NOT EXISTS \"Notes\" (id uuid);")),
//!     Executor::new(backend),
//!     Planner::default(),
//!     Arc::new(MemoryAuditStore::new()),
//! );
//!
//! let report = service.create_plan(false).await?;
//! let applied = service.apply_safe(report.plan.plan_id(), "ops@example.com").await?;
//! assert_eq!(applied.status, AuditStatus::Applied);
//! # Ok(())
//! # }
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Print the SQL that installs the privileged procedures
//! schemaguard bootstrap-sql
//!
//! # Plan against a tenant and run preflight queries
//! schemaguard --tenant acme plan --preflight
//!
//! # Apply the SAFE part of a plan
//! schemaguard --tenant acme apply-safe <plan-id> --approver ops@example.com
//! ```

pub mod audit;
pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod executor;
pub mod planner;
pub mod reader;
pub mod service;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::audit::{
        Approval, ApprovalMethod, AuditRecord, AuditStatus, AuditStore, MemoryAuditStore,
        PgAuditStore,
    };
    pub use crate::backend::{
        InMemoryBackend, PgBackend, QueryOutcome, SchemaBackend, StatementError,
        StatementOutcome,
    };
    pub use crate::bootstrap::bootstrap_sql;
    pub use crate::config::Settings;
    pub use crate::error::{MigrateError, Result};
    pub use crate::executor::{ExecuteOptions, Executor};
    pub use crate::planner::Planner;
    pub use crate::reader::{SsotFile, SsotSource, SsotText};
    pub use crate::service::{ApplyReport, MigrationService, PlanReport};
}
