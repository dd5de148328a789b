//! Statement gating rules.
//!
//! The privileged procedures on every tenant database enforce these
//! rules server-side. They are repeated here so a bad batch fails fast
//! before it is sent.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};

/// The exact phrase that unlocks destructive execution.
pub const DESTRUCTIVE_CONFIRMATION_PHRASE: &str = "ALLOW DESTRUCTIVE CHANGES";

static SAFE_ALLOW_LIST: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?is)^\s*CREATE\s+TABLE\s+IF\s+NOT\s+EXISTS\b",
        r"(?is)^\s*ALTER\s+TABLE\b.*\bADD\s+COLUMN\s+IF\s+NOT\s+EXISTS\b",
        r"(?is)^\s*CREATE\s+(UNIQUE\s+)?INDEX\s+(CONCURRENTLY\s+)?IF\s+NOT\s+EXISTS\b",
        r"(?is)^\s*ALTER\s+TABLE\b.*\bENABLE\s+ROW\s+LEVEL\s+SECURITY\b",
        r"(?is)^\s*CREATE\s+POLICY\b",
        r"(?is)^\s*ALTER\s+TABLE\b.*\bADD\s+CONSTRAINT\b",
        r"(?is)^\s*CREATE\s+EXTENSION\s+IF\s+NOT\s+EXISTS\b",
        r"(?is)^\s*CREATE\s+OR\s+REPLACE\s+VIEW\b",
    ])
    .expect("allow-list patterns are valid")
});

static SAFE_DENY_LIST: LazyLock<[(Regex, &'static str); 3]> = LazyLock::new(|| {
    [
        (
            Regex::new(r"(?is)\bDROP\b").expect("valid pattern"),
            "DROP",
        ),
        (
            Regex::new(r"(?is)\bRENAME\b").expect("valid pattern"),
            "RENAME",
        ),
        (
            Regex::new(r"(?is)\bALTER\s+COLUMN\b.*\bTYPE\b").expect("valid pattern"),
            "ALTER COLUMN ... TYPE",
        ),
    ]
});

static SELECT_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*SELECT\b").expect("valid pattern"));

/// Why a statement or query was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardViolation {
    /// Safe mode: the statement matches no allow-list entry.
    #[error("statement is not on the safe-mode allow-list")]
    NotAllowListed,

    /// Safe mode: the statement contains a forbidden keyword.
    #[error("statement contains forbidden keyword {0} in safe mode")]
    ForbiddenKeyword(&'static str),

    /// Preflight: the query is not a single SELECT.
    #[error("preflight queries must be a single SELECT without ';'")]
    NotSelect,

    /// Destructive mode without the exact confirmation phrase.
    #[error("destructive execution requires the exact phrase \"{DESTRUCTIVE_CONFIRMATION_PHRASE}\"")]
    MissingConfirmation,
}

impl GuardViolation {
    /// SQLSTATE the server raises for the same refusal.
    #[must_use]
    pub const fn sqlstate(&self) -> &'static str {
        match self {
            Self::NotAllowListed | Self::ForbiddenKeyword(_) | Self::NotSelect => "42501",
            Self::MissingConfirmation => "22023",
        }
    }
}

/// Removes trailing whitespace and `;` terminators. The procedures run
/// each entry as a single statement.
#[must_use]
pub fn strip_terminator(statement: &str) -> &str {
    statement.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Checks one statement against the safe-mode rules.
///
/// # Errors
///
/// Returns the violation when the statement would be refused.
pub fn check_safe_statement(statement: &str) -> Result<(), GuardViolation> {
    if !SAFE_ALLOW_LIST.is_match(statement) {
        return Err(GuardViolation::NotAllowListed);
    }
    for (pattern, keyword) in SAFE_DENY_LIST.iter() {
        if pattern.is_match(statement) {
            return Err(GuardViolation::ForbiddenKeyword(keyword));
        }
    }
    Ok(())
}

/// Checks one statement for the requested mode. In destructive mode no
/// keyword restriction applies.
///
/// # Errors
///
/// Returns the violation when the statement would be refused.
pub fn check_statement(statement: &str, allow_destructive: bool) -> Result<(), GuardViolation> {
    if allow_destructive {
        Ok(())
    } else {
        check_safe_statement(statement)
    }
}

/// Checks that destructive mode carries the exact confirmation phrase.
///
/// # Errors
///
/// Returns [`GuardViolation::MissingConfirmation`] otherwise.
pub fn check_confirmation(
    allow_destructive: bool,
    confirmation_phrase: Option<&str>,
) -> Result<(), GuardViolation> {
    if allow_destructive && confirmation_phrase != Some(DESTRUCTIVE_CONFIRMATION_PHRASE) {
        return Err(GuardViolation::MissingConfirmation);
    }
    Ok(())
}

/// Checks that a preflight query is a single SELECT.
///
/// # Errors
///
/// Returns [`GuardViolation::NotSelect`] otherwise.
pub fn check_select(query: &str) -> Result<(), GuardViolation> {
    if query.contains(';') || !SELECT_ONLY.is_match(query) {
        return Err(GuardViolation::NotSelect);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_accepts_generated_shapes() {
        for stmt in [
            "CREATE TABLE IF NOT EXISTS public.\"t\" (id uuid)",
            "ALTER TABLE public.\"t\" ADD COLUMN IF NOT EXISTS \"notes\" text",
            "create unique index if not exists \"i\" ON public.t (a)",
            "CREATE INDEX IF NOT EXISTS i ON t (a)",
            "ALTER TABLE public.\"t\" ENABLE ROW LEVEL SECURITY",
            "CREATE POLICY \"p\" ON public.\"t\" FOR ALL TO authenticated USING (true)",
            "ALTER TABLE public.t ADD CONSTRAINT c CHECK (a > 0)",
            "CREATE EXTENSION IF NOT EXISTS \"pgcrypto\"",
            "CREATE OR REPLACE VIEW v AS SELECT 1",
        ] {
            assert_eq!(check_safe_statement(stmt), Ok(()), "{stmt}");
        }
    }

    #[test]
    fn test_allow_list_rejects_other_statements() {
        assert_eq!(
            check_safe_statement("ALTER TABLE t ALTER COLUMN a SET NOT NULL"),
            Err(GuardViolation::NotAllowListed)
        );
        assert_eq!(
            check_safe_statement("CREATE TABLE t (a int)"),
            Err(GuardViolation::NotAllowListed)
        );
        assert_eq!(
            check_safe_statement("DELETE FROM t"),
            Err(GuardViolation::NotAllowListed)
        );
    }

    #[test]
    fn test_deny_list_wins_over_allow_list() {
        assert_eq!(
            check_safe_statement("CREATE OR REPLACE VIEW v AS SELECT 1; DROP TABLE t"),
            Err(GuardViolation::ForbiddenKeyword("DROP"))
        );
        assert_eq!(
            check_safe_statement("ALTER TABLE t ADD CONSTRAINT c CHECK (true), RENAME TO u"),
            Err(GuardViolation::ForbiddenKeyword("RENAME"))
        );
        assert_eq!(
            check_safe_statement(
                "ALTER TABLE t ADD COLUMN IF NOT EXISTS b int, ALTER COLUMN a TYPE bigint"
            ),
            Err(GuardViolation::ForbiddenKeyword("ALTER COLUMN ... TYPE"))
        );
    }

    #[test]
    fn test_deny_list_uses_word_boundaries() {
        assert_eq!(
            check_safe_statement("ALTER TABLE t ADD COLUMN IF NOT EXISTS dropoff_at timestamptz"),
            Ok(())
        );
    }

    #[test]
    fn test_destructive_mode_skips_keyword_rules() {
        assert_eq!(check_statement("DROP TABLE t", true), Ok(()));
        assert!(check_statement("DROP TABLE t", false).is_err());
    }

    #[test]
    fn test_confirmation_phrase_must_match_exactly() {
        assert_eq!(check_confirmation(false, None), Ok(()));
        assert_eq!(
            check_confirmation(true, Some("ALLOW DESTRUCTIVE CHANGES")),
            Ok(())
        );
        assert_eq!(
            check_confirmation(true, Some("allow destructive changes")),
            Err(GuardViolation::MissingConfirmation)
        );
        assert_eq!(
            check_confirmation(true, None),
            Err(GuardViolation::MissingConfirmation)
        );
    }

    #[test]
    fn test_strip_terminator() {
        assert_eq!(strip_terminator("  CREATE POLICY p ON t;  \n"), "CREATE POLICY p ON t");
        assert_eq!(strip_terminator("SELECT 1 ; ;"), "SELECT 1");
        assert_eq!(strip_terminator("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_select_only() {
        assert_eq!(check_select("SELECT count(*) FROM t"), Ok(()));
        assert_eq!(check_select("  select 1"), Ok(()));
        assert_eq!(check_select("SELECT 1; SELECT 2"), Err(GuardViolation::NotSelect));
        assert_eq!(check_select("DELETE FROM t"), Err(GuardViolation::NotSelect));
        assert_eq!(check_select("WITH x AS (SELECT 1) SELECT * FROM x"), Err(GuardViolation::NotSelect));
    }
}
