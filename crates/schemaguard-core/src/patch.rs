//! Risk-partitioned SQL artifacts.
//!
//! SAFE changes go into an auto-appliable script; CAUTION and
//! DESTRUCTIVE changes go into a manual-review script plus a Markdown
//! runbook explaining each one.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::change::{RiskLevel, SchemaChange};
use crate::diff::SchemaDiff;

/// The generated artifacts of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchArtifacts {
    /// SAFE statements, newline-joined.
    pub patch_sql_safe: String,
    /// Executable CAUTION/DESTRUCTIVE statements, newline-joined.
    pub manual_sql: String,
    /// Markdown review steps for CAUTION then DESTRUCTIVE changes.
    pub manual_steps: String,
}

/// Statements `apply-safe` runs, in plan order.
#[must_use]
pub fn safe_statements(changes: &[SchemaChange]) -> Vec<String> {
    changes
        .iter()
        .filter(|c| c.risk_level == RiskLevel::Safe)
        .map(|c| c.sql_preview.clone())
        .collect()
}

/// Executable statements that need review, in plan order.
#[must_use]
pub fn manual_statements(changes: &[SchemaChange]) -> Vec<String> {
    changes
        .iter()
        .filter(|c| c.risk_level != RiskLevel::Safe && c.is_executable())
        .map(|c| c.sql_preview.clone())
        .collect()
}

/// Builds the artifacts for a diff.
#[must_use]
pub fn generate_patch(diff: &SchemaDiff) -> PatchArtifacts {
    PatchArtifacts {
        patch_sql_safe: safe_statements(&diff.changes).join("\n"),
        manual_sql: manual_statements(&diff.changes).join("\n"),
        manual_steps: manual_steps(&diff.changes),
    }
}

fn manual_steps(changes: &[SchemaChange]) -> String {
    let mut out = String::new();
    let mut step = 0usize;

    for risk in [RiskLevel::Caution, RiskLevel::Destructive] {
        let group: Vec<&SchemaChange> = changes.iter().filter(|c| c.risk_level == risk).collect();
        if group.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "## {} changes\n", risk.label());
        for change in group {
            step += 1;
            let _ = writeln!(out, "### {step}. {}\n", change.title);
            let _ = writeln!(out, "- **Risk:** {}", change.risk_level);
            let _ = writeln!(out, "- **Change:** `{}`", change.change_id);
            let _ = writeln!(out, "- **Why:** {}", change.reason);
            if change.is_executable() {
                let _ = writeln!(out, "\n```sql\n{}\n```", change.sql_preview);
            } else {
                let _ = writeln!(
                    out,
                    "\nNo SQL is generated for this change; write and review a manual migration."
                );
            }
            out.push('\n');
        }
    }
    out
}

/// Renders a full Markdown report of a diff: summary, every change and
/// the preflight queries.
#[must_use]
pub fn render_report(diff: &SchemaDiff) -> String {
    let mut out = String::from("# Schema drift report\n\n");
    let counts = diff.summary_counts;
    let _ = writeln!(
        out,
        "| SAFE | CAUTION | DESTRUCTIVE |\n|---|---|---|\n| {} | {} | {} |\n",
        counts.safe, counts.caution, counts.destructive
    );

    if diff.is_empty() {
        out.push_str("No drift detected.\n");
        return out;
    }

    out.push_str("## Changes\n\n");
    for change in &diff.changes {
        let _ = writeln!(
            out,
            "- [{}] {} (`{}`)",
            change.risk_level, change.title, change.change_id
        );
    }

    if !diff.preflight_queries.is_empty() {
        out.push_str("\n## Preflight queries\n\n");
        for query in &diff.preflight_queries {
            let _ = writeln!(
                out,
                "- `{}`: {}\n\n  ```sql\n  {}\n  ```",
                query.id, query.description, query.sql
            );
        }
    }

    let steps = manual_steps(&diff.changes);
    if !steps.is_empty() {
        out.push('\n');
        out.push_str(&steps);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeAction, ChangeCategory, ChangeObject, SummaryCounts};

    fn change(id: &str, risk: RiskLevel, sql: &str) -> SchemaChange {
        SchemaChange {
            change_id: id.to_string(),
            category: ChangeCategory::Column,
            action: ChangeAction::Add,
            object: ChangeObject {
                table: Some("t".into()),
                name: id.to_string(),
            },
            sql_preview: sql.to_string(),
            risk_level: risk,
            reason: format!("reason for {id}"),
            title: format!("title {id}"),
        }
    }

    fn diff(changes: Vec<SchemaChange>) -> SchemaDiff {
        SchemaDiff {
            summary_counts: SummaryCounts::tally(&changes),
            changes,
            preflight_queries: vec![],
        }
    }

    #[test]
    fn test_partition_by_risk() {
        let d = diff(vec![
            change("a", RiskLevel::Safe, "CREATE TABLE IF NOT EXISTS a ();"),
            change("b", RiskLevel::Caution, "ALTER TABLE t ALTER COLUMN b SET NOT NULL;"),
            change("c", RiskLevel::Destructive, "-- Manual migration required"),
            change("d", RiskLevel::Safe, "ALTER TABLE t ENABLE ROW LEVEL SECURITY;"),
        ]);
        let artifacts = generate_patch(&d);

        assert_eq!(
            artifacts.patch_sql_safe,
            "CREATE TABLE IF NOT EXISTS a ();\nALTER TABLE t ENABLE ROW LEVEL SECURITY;"
        );
        assert_eq!(
            artifacts.manual_sql,
            "ALTER TABLE t ALTER COLUMN b SET NOT NULL;"
        );
    }

    #[test]
    fn test_manual_steps_order_and_blocks() {
        let d = diff(vec![
            change("x", RiskLevel::Destructive, "-- Manual migration required"),
            change("y", RiskLevel::Caution, "ALTER TABLE t ADD CONSTRAINT y CHECK (true);"),
        ]);
        let steps = generate_patch(&d).manual_steps;

        let caution_at = steps.find("## CAUTION changes").unwrap();
        let destructive_at = steps.find("## DESTRUCTIVE changes").unwrap();
        assert!(caution_at < destructive_at);
        assert!(steps.contains("```sql\nALTER TABLE t ADD CONSTRAINT y CHECK (true);\n```"));
        assert!(steps.contains("No SQL is generated for this change"));
        assert!(steps.contains("### 1. title y"));
        assert!(steps.contains("### 2. title x"));
    }

    #[test]
    fn test_empty_diff_report() {
        let report = render_report(&SchemaDiff::default());
        assert!(report.contains("No drift detected."));
        assert!(generate_patch(&SchemaDiff::default()).manual_steps.is_empty());
    }
}
