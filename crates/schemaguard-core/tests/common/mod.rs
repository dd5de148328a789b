#![allow(dead_code)]

use schemaguard_core::expectation::canonical_policy_name;
use schemaguard_core::prelude::*;
use serde_json::{Value, json};

/// A trimmed-down tenant setup script in the shape the SSOT uses.
pub const SETUP_SQL: &str = r#"
-- Tenant setup
CREATE EXTENSION IF NOT EXISTS "pgcrypto";

CREATE TABLE IF NOT EXISTS public."Students" (
    id uuid NOT NULL DEFAULT gen_random_uuid(),
    first_name text NOT NULL,
    notes text NULL,
    created_at timestamptz NOT NULL DEFAULT now(),
    CONSTRAINT "Students_pkey" PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS public."Employees" (
    id uuid NOT NULL DEFAULT gen_random_uuid(),
    email varchar(255) NOT NULL,
    hourly_rate numeric(10, 2) DEFAULT 0
);

ALTER TABLE public."Students" ADD COLUMN IF NOT EXISTS "guardian_id" uuid;

CREATE UNIQUE INDEX IF NOT EXISTS "Employees_email_key" ON public."Employees" (email);

ALTER TABLE public."Students"
    ADD CONSTRAINT "Students_guardian_fk" FOREIGN KEY (guardian_id) REFERENCES public."Employees"(id);

ALTER TABLE public."Students" ENABLE ROW LEVEL SECURITY;

CREATE OR REPLACE FUNCTION public.touch_updated_at() RETURNS trigger AS $$
BEGIN
    NEW.updated_at := now();
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE POLICY "Allow full access to authenticated users on Students" ON public."Students"
    FOR ALL TO authenticated USING (true) WITH CHECK (true);

CREATE OR REPLACE VIEW public."ActiveStudents" AS
    SELECT id, first_name FROM public."Students";

GRANT SELECT ON public."Students" TO authenticated;
"#;

/// Builds introspection documents the way `schema_introspection_v1()`
/// returns them.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    tables: Vec<Value>,
    indexes: Vec<Value>,
    constraints: Vec<Value>,
    policies: Vec<Value>,
    views: Vec<Value>,
    extensions: Vec<Value>,
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table. Columns are `(name, data_type, nullable)`.
    pub fn table(mut self, name: &str, rls_enabled: bool, columns: &[(&str, &str, bool)]) -> Self {
        let columns: Vec<Value> = columns
            .iter()
            .map(|(n, t, nullable)| json!({"name": n, "data_type": t, "nullable": nullable, "default": null}))
            .collect();
        self.tables
            .push(json!({"name": name, "rls_enabled": rls_enabled, "columns": columns}));
        self
    }

    /// Adds the canonical full-access policy for `table`.
    pub fn canonical_policy(mut self, table: &str) -> Self {
        self.policies.push(json!({
            "name": canonical_policy_name(table),
            "table": table,
            "command": "ALL",
            "roles": ["authenticated", "app_user"],
            "permissive": "PERMISSIVE"
        }));
        self
    }

    /// Adds a policy stored under exactly `name`.
    pub fn policy(mut self, name: &str, table: &str) -> Self {
        self.policies.push(json!({
            "name": name,
            "table": table,
            "command": "ALL",
            "roles": ["authenticated", "app_user"],
            "permissive": "PERMISSIVE"
        }));
        self
    }

    pub fn index(mut self, name: &str, table: &str) -> Self {
        self.indexes
            .push(json!({"name": name, "table": table, "unique": false, "definition": ""}));
        self
    }

    pub fn constraint(mut self, name: &str, table: &str, kind: &str) -> Self {
        self.constraints
            .push(json!({"name": name, "table": table, "kind": kind, "definition": ""}));
        self
    }

    pub fn view(mut self, name: &str) -> Self {
        self.views.push(json!({"name": name, "definition": ""}));
        self
    }

    pub fn extension(mut self, name: &str) -> Self {
        self.extensions.push(json!({"name": name, "version": "1.0"}));
        self
    }

    pub fn json(&self) -> Value {
        json!({
            "tables": self.tables,
            "indexes": self.indexes,
            "constraints": self.constraints,
            "policies": self.policies,
            "views": self.views,
            "extensions": self.extensions,
        })
    }

    pub fn build(&self) -> DbSnapshot {
        DbSnapshot::from_json(&self.json()).expect("builder produces a valid snapshot")
    }
}

/// A snapshot matching [`SETUP_SQL`] exactly.
pub fn converged_snapshot() -> SnapshotBuilder {
    SnapshotBuilder::new()
        .extension("pgcrypto")
        .table(
            "Students",
            true,
            &[
                ("id", "uuid", false),
                ("first_name", "text", false),
                ("notes", "text", true),
                ("created_at", "timestamp with time zone", false),
                ("guardian_id", "uuid", true),
            ],
        )
        .table(
            "Employees",
            true,
            &[
                ("id", "uuid", false),
                ("email", "character varying(255)", false),
                ("hourly_rate", "numeric(10,2)", true),
            ],
        )
        .canonical_policy("Students")
        .canonical_policy("Employees")
        .index("Employees_email_key", "Employees")
        .constraint("Students_guardian_fk", "Students", "f")
        .view("ActiveStudents")
}

pub fn parse(sql: &str) -> SchemaExpectation {
    parse_ssot(sql).unwrap_or_else(|e| panic!("Failed to parse SSOT: {e}"))
}

pub fn ids(diff: &SchemaDiff) -> Vec<&str> {
    diff.changes.iter().map(|c| c.change_id.as_str()).collect()
}
