//! Schema drift engine.
//!
//! Compares the SSOT [`SchemaExpectation`] against a live [`DbSnapshot`]
//! and produces risk-classified [`SchemaChange`]s plus the
//! [`PreflightQuery`]s needed to size risky ones.
//!
//! Changes are emitted in a fixed order: extensions, then per table
//! (table, columns, RLS, policies), then standalone indexes, standalone
//! constraints and views. No dependency-aware reordering is done.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::change::{
    ChangeAction, ChangeCategory, ChangeObject, PreflightQuery, RiskLevel, SchemaChange,
    SummaryCounts,
};
use crate::expectation::{Column, SchemaExpectation, Table, qualified, quote_ident};
use crate::snapshot::{DbSnapshot, TableSnapshot};

/// Roles the canonical full-access policy is granted to.
pub const POLICY_ROLES: &str = "authenticated, app_user";

// ================================================================
// Policy
// ================================================================

/// Risk policy injected into a diff.
///
/// Tables in the locked set never receive a SAFE change: anything the
/// generic rules call SAFE is raised to CAUTION. Risk is never lowered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffPolicy {
    locked_tables: BTreeSet<String>,
}

impl DiffPolicy {
    /// Creates a policy with no locked tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a locked table.
    #[must_use]
    pub fn lock_table(mut self, table: impl Into<String>) -> Self {
        self.locked_tables.insert(table.into());
        self
    }

    /// Creates a policy from a list of locked table names.
    #[must_use]
    pub fn with_locked_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locked_tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `table` is locked.
    #[must_use]
    pub fn is_locked(&self, table: &str) -> bool {
        self.locked_tables.contains(table)
    }

    /// Applies the locked-table floor to a generic risk.
    #[must_use]
    pub fn floor(&self, table: Option<&str>, risk: RiskLevel) -> RiskLevel {
        match table {
            Some(t) if self.is_locked(t) => risk.max(RiskLevel::Caution),
            _ => risk,
        }
    }

    /// The locked tables, sorted.
    pub fn locked_tables(&self) -> impl Iterator<Item = &str> {
        self.locked_tables.iter().map(String::as_str)
    }
}

// ================================================================
// Result
// ================================================================

/// Result of comparing an expectation with a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    /// Changes per risk tier.
    pub summary_counts: SummaryCounts,
    /// Ordered changes.
    pub changes: Vec<SchemaChange>,
    /// Read-only queries to run before applying risky changes.
    pub preflight_queries: Vec<PreflightQuery>,
}

impl SchemaDiff {
    /// Returns true if no drift was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes at the given risk level.
    pub fn changes_at(&self, risk: RiskLevel) -> impl Iterator<Item = &SchemaChange> {
        self.changes.iter().filter(move |c| c.risk_level == risk)
    }

    /// Looks up a change by id.
    #[must_use]
    pub fn change(&self, change_id: &str) -> Option<&SchemaChange> {
        self.changes.iter().find(|c| c.change_id == change_id)
    }
}

// ================================================================
// Type normalization
// ================================================================

/// Canonical spelling of common PostgreSQL type aliases.
const TYPE_ALIASES: &[(&str, &str)] = &[
    ("int", "integer"),
    ("int4", "integer"),
    ("serial", "integer"),
    ("serial4", "integer"),
    ("int8", "bigint"),
    ("bigserial", "bigint"),
    ("serial8", "bigint"),
    ("int2", "smallint"),
    ("smallserial", "smallint"),
    ("bool", "boolean"),
    ("varchar", "character varying"),
    ("char", "character"),
    ("timestamptz", "timestamp with time zone"),
    ("timestamp", "timestamp without time zone"),
    ("timetz", "time with time zone"),
    ("time", "time without time zone"),
    ("float8", "double precision"),
    ("float4", "real"),
    ("decimal", "numeric"),
];

/// Normalizes a type name for comparison: lower case, collapsed
/// whitespace, no spaces inside modifiers, and aliases resolved.
#[must_use]
pub fn normalize_type(data_type: &str) -> String {
    let lowered = data_type
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace(" (", "(")
        .replace("( ", "(")
        .replace(" )", ")")
        .replace(", ", ",")
        .replace(" ,", ",");

    // Split "base(mods)[]" so aliases resolve on the base name only.
    let (head, tail) = match lowered.find(['(', '[']) {
        Some(i) => lowered.split_at(i),
        None => (lowered.as_str(), ""),
    };

    let base = TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == head)
        .map_or(head, |(_, canonical)| *canonical);

    // Modifiers on time types sit before the zone qualifier:
    // `timestamp(3) with time zone`.
    if let Some(rest) = tail.strip_prefix('(') {
        if let Some(close) = rest.find(')') {
            let mods = &rest[..close];
            let after = &rest[close + 1..];
            if let Some(zone) = after.strip_prefix(' ') {
                return format!("{head}({mods}) {zone}");
            }
            if base.contains("time zone") {
                if let Some((word, zone)) = base.split_once(' ') {
                    return format!("{word}({mods}) {zone}{after}");
                }
            }
            return format!("{base}({mods}){after}");
        }
    }
    format!("{base}{tail}")
}

/// Returns true if the two types differ after normalization.
#[must_use]
pub fn types_differ(expected: &str, actual: &str) -> bool {
    normalize_type(expected) != normalize_type(actual)
}

// ================================================================
// Builders
// ================================================================

/// Everything that describes one change before the policy floor applies.
struct ChangeSpec<'a> {
    category: ChangeCategory,
    action: ChangeAction,
    id_verb: &'static str,
    table: Option<&'a str>,
    name: &'a str,
    sql_preview: String,
    risk: RiskLevel,
    reason: String,
}

impl ChangeSpec<'_> {
    fn change_id(&self) -> String {
        let prefix = self.category.id_prefix();
        let (verb, name) = (self.id_verb, self.name);
        match (self.category, self.table) {
            (ChangeCategory::Table | ChangeCategory::Rls, _) | (_, None) => {
                format!("{prefix}:{verb}:{name}")
            }
            (_, Some(table)) => format!("{prefix}:{verb}:{table}:{name}"),
        }
    }

    fn build(self, policy: &DiffPolicy) -> SchemaChange {
        let change_id = self.change_id();
        let risk_level = policy.floor(self.table, self.risk);
        let reason = if risk_level > self.risk {
            format!("{} Escalated: table is locked.", self.reason)
        } else {
            self.reason
        };
        SchemaChange {
            change_id,
            category: self.category,
            action: self.action,
            object: ChangeObject {
                table: self.table.map(str::to_string),
                name: self.name.to_string(),
            },
            sql_preview: self.sql_preview,
            risk_level,
            reason,
            title: String::new(),
        }
    }
}

/// Synthesizes the title of every change from its category and object.
fn assign_titles(changes: &mut [SchemaChange]) {
    for change in changes {
        let table = change.object.table.as_deref().unwrap_or_default();
        let name = &change.object.name;
        change.title = match (change.category, change.action) {
            (ChangeCategory::Table, _) => format!("Create table {name}"),
            (ChangeCategory::Column, ChangeAction::Add) => format!("Add column {table}.{name}"),
            (ChangeCategory::Column, _) if change.change_id.starts_with("column:type:") => {
                format!("Change type of {table}.{name}")
            }
            (ChangeCategory::Column, _) => format!("Set NOT NULL on {table}.{name}"),
            (ChangeCategory::Rls, _) => format!("Enable row level security on {table}"),
            (ChangeCategory::Policy, _) => format!("Create policy \"{name}\" on {table}"),
            (ChangeCategory::Index, _) => format!("Create index {name} on {table}"),
            (ChangeCategory::Constraint, _) => format!("Add constraint {name} on {table}"),
            (ChangeCategory::Extension, _) => format!("Create extension {name}"),
            (ChangeCategory::View, _) => format!("Create view {name}"),
        };
    }
}

// ================================================================
// Diff walk
// ================================================================

struct DiffContext<'a> {
    policy: &'a DiffPolicy,
    changes: Vec<SchemaChange>,
    preflight: Vec<PreflightQuery>,
}

impl DiffContext<'_> {
    fn push(&mut self, spec: ChangeSpec<'_>) {
        self.changes.push(spec.build(self.policy));
    }

    fn diff_extensions(&mut self, expected: &SchemaExpectation, snapshot: &DbSnapshot) {
        for ext in &expected.extensions {
            if snapshot.has_extension(&ext.name) {
                continue;
            }
            self.push(ChangeSpec {
                category: ChangeCategory::Extension,
                action: ChangeAction::Create,
                id_verb: "create",
                table: None,
                name: &ext.name,
                sql_preview: ext.sql.clone(),
                risk: RiskLevel::Safe,
                reason: format!("Extension {} is not installed.", ext.name),
            });
        }
    }

    fn diff_missing_table(&mut self, table: &Table) {
        self.push(ChangeSpec {
            category: ChangeCategory::Table,
            action: ChangeAction::Create,
            id_verb: "create",
            table: Some(&table.name),
            name: &table.name,
            sql_preview: table.create_sql.clone(),
            risk: RiskLevel::Safe,
            reason: format!(
                "Table {} does not exist; CREATE TABLE IF NOT EXISTS is idempotent.",
                table.name
            ),
        });
    }

    fn diff_missing_column(&mut self, table: &str, column: &Column) {
        let (risk, reason) = if !column.nullable && column.default.is_none() {
            (
                RiskLevel::Caution,
                format!(
                    "Column {table}.{} is NOT NULL without a default; adding it fails if the table has rows.",
                    column.name
                ),
            )
        } else {
            (
                RiskLevel::Safe,
                format!("Column {table}.{} is missing; adding it is additive.", column.name),
            )
        };
        self.push(ChangeSpec {
            category: ChangeCategory::Column,
            action: ChangeAction::Add,
            id_verb: "add",
            table: Some(table),
            name: &column.name,
            sql_preview: format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {};",
                qualified(table),
                column.definition_sql()
            ),
            risk,
            reason,
        });
    }

    fn diff_type_mismatch(&mut self, table: &str, column: &Column, actual: &str) {
        self.push(ChangeSpec {
            category: ChangeCategory::Column,
            action: ChangeAction::Alter,
            id_verb: "type",
            table: Some(table),
            name: &column.name,
            sql_preview: format!(
                "-- Manual migration required: {}.{} is {actual} in the database but {} in the SSOT.\n-- Type changes are never generated automatically.",
                qualified(table),
                quote_ident(&column.name),
                column.data_type
            ),
            risk: RiskLevel::Destructive,
            reason: format!(
                "Column {table}.{} has type {actual}, expected {}; converting may lose or reject data.",
                column.name, column.data_type
            ),
        });
    }

    fn diff_not_null(&mut self, table: &str, column: &Column) {
        let col = quote_ident(&column.name);
        self.push(ChangeSpec {
            category: ChangeCategory::Column,
            action: ChangeAction::Alter,
            id_verb: "notnull",
            table: Some(table),
            name: &column.name,
            sql_preview: format!(
                "ALTER TABLE {} ALTER COLUMN {col} SET NOT NULL;",
                qualified(table)
            ),
            risk: RiskLevel::Caution,
            reason: format!(
                "Column {table}.{} is nullable in the database but NOT NULL in the SSOT; existing NULLs block the change.",
                column.name
            ),
        });
        self.preflight.push(PreflightQuery {
            id: format!("preflight:nulls:{table}:{}", column.name),
            risk_level: RiskLevel::Caution,
            description: format!(
                "Rows in {table} where {} IS NULL; must be 0 before SET NOT NULL.",
                column.name
            ),
            sql: format!(
                "SELECT count(*) AS null_count FROM {} WHERE {col} IS NULL",
                qualified(table)
            ),
        });
    }

    fn diff_columns(&mut self, table: &Table, live: &TableSnapshot) {
        for column in &table.columns {
            let Some(actual) = live.column(&column.name) else {
                self.diff_missing_column(&table.name, column);
                continue;
            };
            if types_differ(&column.data_type, &actual.data_type) {
                self.diff_type_mismatch(&table.name, column, &actual.data_type);
            }
            if !column.nullable && actual.nullable {
                self.diff_not_null(&table.name, column);
            }
        }
    }

    fn diff_security(&mut self, table: &Table, snapshot: &DbSnapshot) {
        if table.expects_rls_enabled && !snapshot.rls_enabled(&table.name) {
            self.push(ChangeSpec {
                category: ChangeCategory::Rls,
                action: ChangeAction::Alter,
                id_verb: "enable",
                table: Some(&table.name),
                name: &table.name,
                sql_preview: format!(
                    "ALTER TABLE {} ENABLE ROW LEVEL SECURITY;",
                    qualified(&table.name)
                ),
                risk: RiskLevel::Safe,
                reason: format!("Row level security is disabled on {}.", table.name),
            });
        }

        for policy_name in &table.expected_policies {
            if snapshot.has_policy(&table.name, policy_name) {
                continue;
            }
            self.push(ChangeSpec {
                category: ChangeCategory::Policy,
                action: ChangeAction::Create,
                id_verb: "create",
                table: Some(&table.name),
                name: policy_name,
                sql_preview: format!(
                    "CREATE POLICY {} ON {} FOR ALL TO {POLICY_ROLES} USING (true) WITH CHECK (true);",
                    quote_ident(policy_name),
                    qualified(&table.name)
                ),
                risk: RiskLevel::Safe,
                reason: format!("Policy \"{policy_name}\" is missing on {}.", table.name),
            });
        }
    }

    fn diff_indexes(&mut self, expected: &SchemaExpectation, snapshot: &DbSnapshot) {
        for index in &expected.indexes {
            if snapshot.index(&index.name).is_some() {
                continue;
            }
            self.push(ChangeSpec {
                category: ChangeCategory::Index,
                action: ChangeAction::Create,
                id_verb: "create",
                table: Some(&index.table),
                name: &index.name,
                sql_preview: index.sql.clone(),
                risk: RiskLevel::Safe,
                reason: format!("Index {} on {} is missing.", index.name, index.table),
            });
        }
    }

    fn diff_constraints(&mut self, expected: &SchemaExpectation, snapshot: &DbSnapshot) {
        for constraint in &expected.constraints {
            if snapshot.has_constraint(&constraint.table, &constraint.name) {
                continue;
            }
            self.push(ChangeSpec {
                category: ChangeCategory::Constraint,
                action: ChangeAction::Add,
                id_verb: "add",
                table: Some(&constraint.table),
                name: &constraint.name,
                sql_preview: constraint.sql.clone(),
                risk: RiskLevel::Caution,
                reason: format!(
                    "Constraint {} on {} is missing; existing rows may violate it.",
                    constraint.name, constraint.table
                ),
            });

            if constraint.is_foreign_key() {
                self.preflight.push(PreflightQuery {
                    id: format!("preflight:fk:{}:{}", constraint.table, constraint.name),
                    risk_level: RiskLevel::Caution,
                    description: format!(
                        "Advisory: verify existing rows of {} satisfy {} before adding {}. Referencing columns are not introspected, so orphan rows are not counted automatically; this returns the table's row count.",
                        constraint.table, constraint.definition, constraint.name
                    ),
                    sql: format!(
                        "SELECT count(*) AS row_count FROM {}",
                        qualified(&constraint.table)
                    ),
                });
            }
        }
    }

    fn diff_views(&mut self, expected: &SchemaExpectation, snapshot: &DbSnapshot) {
        for view in &expected.views {
            if snapshot.has_view(&view.name) {
                continue;
            }
            self.push(ChangeSpec {
                category: ChangeCategory::View,
                action: ChangeAction::Create,
                id_verb: "create",
                table: None,
                name: &view.name,
                sql_preview: view.sql.clone(),
                risk: RiskLevel::Safe,
                reason: format!("View {} does not exist.", view.name),
            });
        }
    }
}

// ================================================================
// Entry point
// ================================================================

/// Compares `expected` with `snapshot` under `policy`.
#[must_use]
pub fn diff_schema(
    expected: &SchemaExpectation,
    snapshot: &DbSnapshot,
    policy: &DiffPolicy,
) -> SchemaDiff {
    let mut ctx = DiffContext {
        policy,
        changes: Vec::new(),
        preflight: Vec::new(),
    };

    ctx.diff_extensions(expected, snapshot);
    for table in &expected.tables {
        match snapshot.table(&table.name) {
            None => ctx.diff_missing_table(table),
            Some(live) => ctx.diff_columns(table, live),
        }
        ctx.diff_security(table, snapshot);
    }
    ctx.diff_indexes(expected, snapshot);
    ctx.diff_constraints(expected, snapshot);
    ctx.diff_views(expected, snapshot);

    assign_titles(&mut ctx.changes);
    let summary_counts = SummaryCounts::tally(&ctx.changes);
    debug!(
        safe = summary_counts.safe,
        caution = summary_counts.caution,
        destructive = summary_counts.destructive,
        preflight = ctx.preflight.len(),
        "schema diff computed"
    );

    SchemaDiff {
        summary_counts,
        changes: ctx.changes,
        preflight_queries: ctx.preflight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_type_aliases() {
        assert_eq!(normalize_type("INT"), "integer");
        assert_eq!(normalize_type("varchar(255)"), "character varying(255)");
        assert_eq!(normalize_type("Character  Varying(255)"), "character varying(255)");
        assert_eq!(normalize_type("timestamptz"), "timestamp with time zone");
        assert_eq!(normalize_type("numeric(10, 2)"), "numeric(10,2)");
        assert_eq!(normalize_type("decimal(10,2)"), "numeric(10,2)");
        assert_eq!(normalize_type("text[]"), "text[]");
        assert_eq!(normalize_type("bool"), "boolean");
        assert_eq!(
            normalize_type("timestamp(3)"),
            "timestamp(3) without time zone"
        );
        assert_eq!(
            normalize_type("timestamp(3) with time zone"),
            "timestamp(3) with time zone"
        );
    }

    #[test]
    fn test_types_differ_case_insensitive() {
        assert!(!types_differ("TEXT", "text"));
        assert!(!types_differ("serial", "integer"));
        assert!(types_differ("integer", "text"));
        assert!(types_differ("varchar(100)", "character varying(255)"));
    }

    #[test]
    fn test_policy_floor() {
        let policy = DiffPolicy::new().lock_table("Students");
        assert_eq!(
            policy.floor(Some("Students"), RiskLevel::Safe),
            RiskLevel::Caution
        );
        assert_eq!(
            policy.floor(Some("Students"), RiskLevel::Destructive),
            RiskLevel::Destructive
        );
        assert_eq!(policy.floor(Some("Other"), RiskLevel::Safe), RiskLevel::Safe);
        assert_eq!(policy.floor(None, RiskLevel::Safe), RiskLevel::Safe);
    }

    fn spec(
        category: ChangeCategory,
        table: Option<&'static str>,
        name: &'static str,
    ) -> ChangeSpec<'static> {
        ChangeSpec {
            category,
            action: ChangeAction::Create,
            id_verb: "create",
            table,
            name,
            sql_preview: String::new(),
            risk: RiskLevel::Safe,
            reason: "Missing.".to_string(),
        }
    }

    #[test]
    fn test_change_id_format() {
        assert_eq!(
            spec(ChangeCategory::Column, Some("Students"), "notes").change_id(),
            "column:create:Students:notes"
        );
        assert_eq!(
            spec(ChangeCategory::Table, Some("Students"), "Students").change_id(),
            "table:create:Students"
        );
        assert_eq!(
            spec(ChangeCategory::Extension, None, "pgcrypto").change_id(),
            "extension:create:pgcrypto"
        );
    }

    #[test]
    fn test_build_escalates_locked_table() {
        let policy = DiffPolicy::new().lock_table("Students");
        let change = spec(ChangeCategory::Index, Some("Students"), "idx").build(&policy);
        assert_eq!(change.risk_level, RiskLevel::Caution);
        assert_eq!(change.reason, "Missing. Escalated: table is locked.");

        let change = spec(ChangeCategory::Index, Some("Other"), "idx").build(&policy);
        assert_eq!(change.risk_level, RiskLevel::Safe);
        assert_eq!(change.reason, "Missing.");
    }
}
