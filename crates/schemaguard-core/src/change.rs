//! Typed, risk-classified schema changes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Risk tier of a proposed change. Ordered from least to most risky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Idempotent, additive DDL that can be applied automatically.
    Safe,
    /// May fail or block on existing data; needs review.
    Caution,
    /// Can lose or rewrite data; manual migration only.
    Destructive,
}

impl RiskLevel {
    /// Upper-case label used in reports.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Caution => "CAUTION",
            Self::Destructive => "DESTRUCTIVE",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Kind of schema object a change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeCategory {
    /// A table.
    Table,
    /// A column.
    Column,
    /// An index.
    Index,
    /// A table constraint.
    Constraint,
    /// Row level security flag.
    Rls,
    /// An RLS policy.
    Policy,
    /// An extension.
    Extension,
    /// A view.
    View,
}

impl ChangeCategory {
    /// Lower-case prefix used in change ids.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::Index => "index",
            Self::Constraint => "constraint",
            Self::Rls => "rls",
            Self::Policy => "policy",
            Self::Extension => "extension",
            Self::View => "view",
        }
    }
}

/// What a change does to its object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    /// Create a new object.
    Create,
    /// Add a sub-object (column, constraint).
    Add,
    /// Alter an existing object.
    Alter,
}

/// The object a change applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeObject {
    /// Owning table, when the object lives on one.
    pub table: Option<String>,
    /// Object name.
    pub name: String,
}

/// One detected difference between the SSOT and the live schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Deterministic id, e.g. `column:add:Students:notes`.
    pub change_id: String,
    /// Object kind.
    pub category: ChangeCategory,
    /// Action on the object.
    pub action: ChangeAction,
    /// Target object.
    pub object: ChangeObject,
    /// SQL that would apply the change, or a `--` comment when the
    /// change needs a manual migration.
    pub sql_preview: String,
    /// Risk tier.
    pub risk_level: RiskLevel,
    /// Why the change carries its risk.
    pub reason: String,
    /// Short human-readable title.
    pub title: String,
}

impl SchemaChange {
    /// Returns true if `sql_preview` holds a runnable statement rather
    /// than only comments.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        is_executable_sql(&self.sql_preview)
    }
}

/// Returns true if `sql` contains a statement terminator outside comment
/// lines.
#[must_use]
pub fn is_executable_sql(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("--"))
        .any(|line| line.contains(';'))
}

/// A read-only SELECT that quantifies risk before a change is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightQuery {
    /// Deterministic id, e.g. `preflight:nulls:Students:age`.
    pub id: String,
    /// Risk tier of the change it guards.
    pub risk_level: RiskLevel,
    /// What the result means.
    pub description: String,
    /// Single SELECT statement without a terminator.
    pub sql: String,
}

/// Number of changes per risk tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    /// SAFE changes.
    pub safe: usize,
    /// CAUTION changes.
    pub caution: usize,
    /// DESTRUCTIVE changes.
    pub destructive: usize,
}

impl SummaryCounts {
    /// Tallies changes by risk.
    #[must_use]
    pub fn tally(changes: &[SchemaChange]) -> Self {
        changes.iter().fold(Self::default(), |mut acc, c| {
            match c.risk_level {
                RiskLevel::Safe => acc.safe += 1,
                RiskLevel::Caution => acc.caution += 1,
                RiskLevel::Destructive => acc.destructive += 1,
            }
            acc
        })
    }

    /// Total number of changes.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.safe + self.caution + self.destructive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Caution);
        assert!(RiskLevel::Caution < RiskLevel::Destructive);
        assert_eq!(RiskLevel::Safe.max(RiskLevel::Caution), RiskLevel::Caution);
    }

    #[test]
    fn test_risk_serializes_upper_case() {
        let json = serde_json::to_string(&RiskLevel::Destructive).unwrap();
        assert_eq!(json, "\"DESTRUCTIVE\"");
        let json = serde_json::to_string(&ChangeCategory::Rls).unwrap();
        assert_eq!(json, "\"RLS\"");
    }

    #[test]
    fn test_is_executable_sql() {
        assert!(is_executable_sql("ALTER TABLE t ENABLE ROW LEVEL SECURITY;"));
        assert!(!is_executable_sql("-- manual migration required;"));
        assert!(!is_executable_sql("SELECT 1"));
        assert!(is_executable_sql("-- note\nCREATE TABLE x ();"));
    }
}
