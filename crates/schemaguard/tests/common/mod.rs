//! Shared fixtures for schemaguard integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use schemaguard::prelude::*;
use serde_json::{Value, json};

pub const TENANT: &str = "tenant-acme";

pub const APPROVER: &str = "ops@example.com";

pub const SSOT: &str = r#"
-- Canonical tenant schema
CREATE TABLE IF NOT EXISTS public."Students" (
    id uuid NOT NULL DEFAULT gen_random_uuid(),
    first_name text NOT NULL,
    notes text
);
"#;

/// Students exists with RLS and its policy, but `first_name` is
/// nullable and `notes` is missing.
pub fn drifted_snapshot() -> Value {
    json!({
        "tables": [{
            "name": "Students",
            "rls_enabled": true,
            "columns": [
                {"name": "id", "data_type": "uuid", "nullable": false, "default": "gen_random_uuid()"},
                {"name": "first_name", "data_type": "text", "nullable": true}
            ]
        }],
        "policies": [{
            "name": "Allow full access to authenticated users on Students",
            "table": "Students",
            "command": "ALL",
            "roles": ["authenticated", "app_user"]
        }]
    })
}

/// The drifted snapshot after the SAFE column add.
pub fn patched_snapshot() -> Value {
    let mut snapshot = drifted_snapshot();
    snapshot["tables"][0]["columns"]
        .as_array_mut()
        .expect("columns")
        .push(json!({"name": "notes", "data_type": "text", "nullable": true}));
    snapshot
}

pub const NULLS_QUERY: &str =
    "SELECT count(*) AS null_count FROM public.\"Students\" WHERE \"first_name\" IS NULL";

pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub audit: Arc<MemoryAuditStore>,
    pub service: MigrationService,
}

pub fn harness(backend: InMemoryBackend) -> Harness {
    harness_with(backend, false, Planner::default())
}

pub fn harness_with(backend: InMemoryBackend, dry_run: bool, planner: Planner) -> Harness {
    let backend = Arc::new(backend);
    let audit = Arc::new(MemoryAuditStore::new());
    let service = MigrationService::new(
        TENANT,
        Arc::new(SsotText::new(SSOT)),
        Executor::new(backend.clone()).dry_run(dry_run),
        planner,
        audit.clone(),
    );
    Harness {
        backend,
        audit,
        service,
    }
}

pub fn statements(sql: &[&str]) -> Vec<String> {
    sql.iter().map(|s| s.to_string()).collect()
}
