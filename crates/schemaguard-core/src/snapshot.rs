//! Live database snapshot types.
//!
//! A [`DbSnapshot`] is built from the JSON document returned by the
//! `schema_introspection_v1()` procedure. Hashing works on the raw
//! document (see [`crate::hash::snapshot_hash`]), not on this indexed form.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expectation::truncate_identifier;

/// A column as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSnapshot {
    /// Column name.
    pub name: String,
    /// Type as rendered by `format_type()`.
    pub data_type: String,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Default expression, if any.
    #[serde(default)]
    pub default: Option<String>,
}

/// A table as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    /// Table name.
    pub name: String,
    /// Whether row level security is enabled.
    #[serde(default)]
    pub rls_enabled: bool,
    /// Columns in ordinal order.
    #[serde(default)]
    pub columns: Vec<ColumnSnapshot>,
}

impl TableSnapshot {
    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSnapshot> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// An index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// Index name.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
    /// `pg_get_indexdef()` output.
    #[serde(default)]
    pub definition: String,
}

/// A table constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintSnapshot {
    /// Constraint name.
    pub name: String,
    /// Constrained table.
    pub table: String,
    /// `pg_constraint.contype` (`p`, `f`, `u`, `c`, `x`).
    #[serde(default)]
    pub kind: String,
    /// `pg_get_constraintdef()` output.
    #[serde(default)]
    pub definition: String,
}

/// A row level security policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    /// Policy name.
    pub name: String,
    /// Table the policy is attached to.
    pub table: String,
    /// Command (`ALL`, `SELECT`, ...).
    #[serde(default)]
    pub command: String,
    /// Roles the policy applies to.
    #[serde(default)]
    pub roles: Vec<String>,
    /// `PERMISSIVE` or `RESTRICTIVE`.
    #[serde(default)]
    pub permissive: Option<String>,
}

/// A view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSnapshot {
    /// View name.
    pub name: String,
    /// View definition.
    #[serde(default)]
    pub definition: String,
}

/// An installed extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSnapshot {
    /// Extension name.
    pub name: String,
    /// Installed version.
    #[serde(default)]
    pub version: Option<String>,
}

/// The wire shape of `schema_introspection_v1()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    /// Tables in schema `public`.
    #[serde(default)]
    pub tables: Vec<TableSnapshot>,
    /// Indexes in schema `public`.
    #[serde(default)]
    pub indexes: Vec<IndexSnapshot>,
    /// Constraints in schema `public`.
    #[serde(default)]
    pub constraints: Vec<ConstraintSnapshot>,
    /// Policies in schema `public`.
    #[serde(default)]
    pub policies: Vec<PolicySnapshot>,
    /// Views in schema `public`.
    #[serde(default)]
    pub views: Vec<ViewSnapshot>,
    /// Installed extensions.
    #[serde(default)]
    pub extensions: Vec<ExtensionSnapshot>,
}

/// Indexed view of a live schema, keyed for constant-time lookup.
#[derive(Debug, Clone, Default)]
pub struct DbSnapshot {
    tables: HashMap<String, TableSnapshot>,
    indexes: HashMap<String, IndexSnapshot>,
    constraints: HashSet<(String, String)>,
    policies: HashSet<(String, String)>,
    views: HashSet<String>,
    extensions: HashSet<String>,
}

impl DbSnapshot {
    /// Builds the indexed snapshot from the introspection document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not have the expected shape.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        let raw = RawSnapshot::deserialize(value)?;
        Ok(Self::from_raw(raw))
    }

    /// Builds the indexed snapshot from its wire form.
    #[must_use]
    pub fn from_raw(raw: RawSnapshot) -> Self {
        Self {
            tables: raw
                .tables
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
            indexes: raw
                .indexes
                .into_iter()
                .map(|i| (i.name.clone(), i))
                .collect(),
            constraints: raw
                .constraints
                .into_iter()
                .map(|c| (c.table, c.name))
                .collect(),
            policies: raw
                .policies
                .into_iter()
                .map(|p| (p.table, p.name))
                .collect(),
            views: raw.views.into_iter().map(|v| v.name).collect(),
            extensions: raw.extensions.into_iter().map(|e| e.name).collect(),
        }
    }

    /// Looks up a table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(truncate_identifier(name))
    }

    /// Returns true if RLS is enabled on `table`. Unknown tables report
    /// `false`.
    #[must_use]
    pub fn rls_enabled(&self, table: &str) -> bool {
        self.table(table).is_some_and(|t| t.rls_enabled)
    }

    /// Looks up an index by name.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexSnapshot> {
        self.indexes.get(truncate_identifier(name))
    }

    /// Returns true if `table` has a constraint called `name`.
    #[must_use]
    pub fn has_constraint(&self, table: &str, name: &str) -> bool {
        self.constraints.contains(&stored_pair(table, name))
    }

    /// Returns true if `table` has a policy called `name`.
    #[must_use]
    pub fn has_policy(&self, table: &str, name: &str) -> bool {
        self.policies.contains(&stored_pair(table, name))
    }

    /// Returns true if the view exists.
    #[must_use]
    pub fn has_view(&self, name: &str) -> bool {
        self.views.contains(truncate_identifier(name))
    }

    /// Returns true if the extension is installed.
    #[must_use]
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains(truncate_identifier(name))
    }

    /// Number of tables.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

fn stored_pair(table: &str, name: &str) -> (String, String) {
    (
        truncate_identifier(table).to_string(),
        truncate_identifier(name).to_string(),
    )
}

impl From<RawSnapshot> for DbSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        Self::from_raw(raw)
    }
}
