//! The schema the SSOT script says every tenant should have.
//!
//! Built by [`parse_ssot`](crate::ssot::parse_ssot). Column types and
//! defaults are kept as the SQL text found in the script.

use serde::{Deserialize, Serialize};

/// Prefix of the canonical policy name every table is expected to carry.
pub const CANONICAL_POLICY_PREFIX: &str = "Allow full access to authenticated users on";

/// Longest identifier PostgreSQL stores, in bytes. Longer names are cut
/// down to this length by the server.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Returns `name` as PostgreSQL stores it: at most
/// [`MAX_IDENTIFIER_BYTES`] bytes, cut on a character boundary.
#[must_use]
pub fn truncate_identifier(name: &str) -> &str {
    if name.len() <= MAX_IDENTIFIER_BYTES {
        return name;
    }
    let mut end = MAX_IDENTIFIER_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Returns the canonical expected policy name for `table`, truncated the
/// way the server truncates it.
#[must_use]
pub fn canonical_policy_name(table: &str) -> String {
    let full = format!("{CANONICAL_POLICY_PREFIX} {table}");
    truncate_identifier(&full).to_string()
}

/// An expected column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// SQL type as written in the SSOT.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column may hold NULL.
    pub nullable: bool,
    /// Default expression, if any.
    pub default: Option<String>,
}

impl Column {
    /// Creates a nullable column without default.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default: None,
        }
    }

    /// Marks the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the default expression.
    #[must_use]
    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    /// Renders the column as a definition usable in `ADD COLUMN`.
    #[must_use]
    pub fn definition_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type);
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// An expected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name (in schema `public`).
    pub name: String,
    /// Idempotent `CREATE TABLE IF NOT EXISTS` statement.
    pub create_sql: String,
    /// Columns in declaration order.
    pub columns: Vec<Column>,
    /// Policy names the table must carry.
    pub expected_policies: Vec<String>,
    /// Whether row level security must be enabled.
    pub expects_rls_enabled: bool,
}

impl Table {
    /// Creates a table expectation with the canonical policy and RLS
    /// expectation. `create_sql` is rendered from the columns.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        let name = name.into();
        let body: Vec<String> = columns.iter().map(Column::definition_sql).collect();
        Self {
            create_sql: render_create_table(&name, &body),
            expected_policies: vec![canonical_policy_name(&name)],
            expects_rls_enabled: true,
            name,
            columns,
        }
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// An expected index, created outside any `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Whether this is a UNIQUE index.
    pub unique: bool,
    /// The SSOT statement that creates it.
    pub sql: String,
}

/// An expected constraint, added with `ALTER TABLE ... ADD CONSTRAINT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Constrained table.
    pub table: String,
    /// Constraint name.
    pub name: String,
    /// Constraint body, e.g. `FOREIGN KEY (a) REFERENCES b(id)`.
    pub definition: String,
    /// The SSOT statement that adds it.
    pub sql: String,
}

impl Constraint {
    /// Returns true if the definition declares a foreign key.
    #[must_use]
    pub fn is_foreign_key(&self) -> bool {
        let upper = self.definition.to_ascii_uppercase();
        upper
            .split_whitespace()
            .collect::<Vec<_>>()
            .windows(2)
            .any(|w| w[0] == "FOREIGN" && w[1].starts_with("KEY"))
    }
}

/// An expected extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    /// Extension name.
    pub name: String,
    /// The SSOT statement that creates it.
    pub sql: String,
}

/// An expected view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// View name.
    pub name: String,
    /// The SSOT `CREATE OR REPLACE VIEW` statement.
    pub sql: String,
}

/// Everything the SSOT script declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaExpectation {
    /// Tables in first-seen order.
    pub tables: Vec<Table>,
    /// Standalone indexes.
    pub indexes: Vec<Index>,
    /// Standalone constraints.
    pub constraints: Vec<Constraint>,
    /// Required extensions.
    #[serde(default)]
    pub extensions: Vec<Extension>,
    /// Views.
    #[serde(default)]
    pub views: Vec<View>,
}

impl SchemaExpectation {
    /// Creates an empty expectation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a table.
    #[must_use]
    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a constraint.
    #[must_use]
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Looks up a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Double-quotes an identifier, escaping embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Returns `public."<table>"`.
#[must_use]
pub fn qualified(table: &str) -> String {
    format!("public.{}", quote_ident(table))
}

/// Renders `CREATE TABLE IF NOT EXISTS public."<name>" (...);` from body
/// items (column definitions and table constraints).
#[must_use]
pub fn render_create_table(name: &str, body: &[String]) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n);",
        qualified(name),
        body.join(",\n  ")
    )
}
