//! Schema drift detection and risk-partitioned patch generation.
//!
//! `schemaguard-core` is the I/O-free half of schemaguard. Given the
//! canonical SSOT DDL script and a JSON snapshot of a tenant database it:
//!
//! - parses the script into a [`SchemaExpectation`](expectation::SchemaExpectation)
//! - diffs it against a [`DbSnapshot`](snapshot::DbSnapshot) into
//!   risk-classified [`SchemaChange`](change::SchemaChange)s
//! - partitions the changes into SAFE and manual-review SQL
//! - wraps everything into an immutable [`SchemaPlan`](plan::SchemaPlan)
//!
//! Database access, auditing and the CLI live in the `schemaguard` crate.
//!
//! # Example
//!
//! ```rust
//! use schemaguard_core::prelude::*;
//! use serde_json::json;
//!
//! let expected = parse_ssot(
//!     "CREATE TABLE IF NOT EXISTS public.\"Students\" (id uuid NOT NULL, notes text);",
//! )
//! .unwrap();
//!
//! let snapshot = DbSnapshot::from_json(&json!({
//!     "tables": [{
//!         "name": "Students",
//!         "rls_enabled": true,
//!         "columns": [{"name": "id", "data_type": "uuid", "nullable": false}]
//!     }],
//!     "policies": [{
//!         "name": "Allow full access to authenticated users on Students",
//!         "table": "Students"
//!     }]
//! }))
//! .unwrap();
//!
//! let diff = diff_schema(&expected, &snapshot, &DiffPolicy::new());
//! assert_eq!(diff.changes.len(), 1);
//! assert_eq!(diff.changes[0].change_id, "column:add:Students:notes");
//! assert_eq!(diff.changes[0].risk_level, RiskLevel::Safe);
//! ```

pub mod change;
pub mod diff;
pub mod expectation;
pub mod guard;
pub mod hash;
pub mod patch;
pub mod plan;
pub mod snapshot;
pub mod ssot;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::change::{
        ChangeAction, ChangeCategory, ChangeObject, PreflightQuery, RiskLevel, SchemaChange,
        SummaryCounts,
    };
    pub use crate::diff::{DiffPolicy, SchemaDiff, diff_schema};
    pub use crate::expectation::{
        Column, Constraint, Extension, Index, SchemaExpectation, Table, View,
    };
    pub use crate::guard::{DESTRUCTIVE_CONFIRMATION_PHRASE, GuardViolation};
    pub use crate::patch::{PatchArtifacts, generate_patch};
    pub use crate::plan::SchemaPlan;
    pub use crate::snapshot::{DbSnapshot, RawSnapshot};
    pub use crate::ssot::{ParseError, Span, parse_ssot};
}
