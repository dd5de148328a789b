//! Restricted recursive-descent parser for the SSOT setup script.
//!
//! The script is split into top-level statements and each statement is
//! matched against a fixed whitelist:
//!
//! - `CREATE TABLE [IF NOT EXISTS] [public.]<name> (...)`
//! - `ALTER TABLE [IF EXISTS] [ONLY] [public.]<name> <action>, ...` where
//!   an action is `ADD COLUMN [IF NOT EXISTS] <def>`,
//!   `ADD CONSTRAINT <name> <def>` or `ENABLE ROW LEVEL SECURITY`
//! - `CREATE [UNIQUE] INDEX [CONCURRENTLY] [IF NOT EXISTS] <name> ON ...`
//! - `CREATE EXTENSION [IF NOT EXISTS] <name> ...`
//! - `CREATE [OR REPLACE] VIEW <name> ...`, always stored as
//!   `CREATE OR REPLACE VIEW` so it can be re-run
//!
//! Everything else (functions, grants, policies, data) is skipped.

use std::collections::HashMap;

use tracing::trace;

use super::error::{ParseError, Span};
use super::lexer::{Token, TokenKind, tokenize};
use crate::expectation::{
    Column, Constraint, Extension, Index, SchemaExpectation, Table, View, canonical_policy_name,
    qualified, quote_ident, render_create_table,
};

/// Words that end a column's type and start its constraint list.
const COLUMN_BOUNDARY_KEYWORDS: &[&str] = &[
    "NOT",
    "NULL",
    "DEFAULT",
    "PRIMARY",
    "UNIQUE",
    "CHECK",
    "REFERENCES",
    "CONSTRAINT",
    "GENERATED",
    "COLLATE",
];

/// Words that open a table-level constraint inside `CREATE TABLE (...)`.
const TABLE_CONSTRAINT_KEYWORDS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "FOREIGN",
    "UNIQUE",
    "CHECK",
    "EXCLUDE",
    "LIKE",
];

/// Parses SSOT DDL text into a [`SchemaExpectation`].
///
/// # Errors
///
/// Returns [`ParseError`] when the input is empty, cannot be tokenized,
/// has unbalanced parentheses, contains a malformed whitelisted
/// statement, or declares no tables.
pub fn parse_ssot(input: &str) -> Result<SchemaExpectation, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::new(
            "SSOT script is empty",
            Span::new(0, input.len()),
        ));
    }

    let mut builder = ExpectationBuilder::default();
    for statement in split_statements(&tokens)? {
        let mut parser = StatementParser::new(input, statement);
        parser.parse_into(&mut builder)?;
    }

    if builder.tables.is_empty() {
        return Err(ParseError::new(
            "SSOT script declares no tables",
            Span::new(0, input.len()),
        ));
    }

    Ok(builder.finish())
}

/// Splits tokens into top-level statements on `;`, checking that
/// parentheses balance.
fn split_statements(tokens: &[Token]) -> Result<Vec<&[Token]>, ParseError> {
    let mut statements = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LeftParen => depth += 1,
            TokenKind::RightParen => {
                if depth == 0 {
                    return Err(ParseError::new("Unbalanced ')'", token.span));
                }
                depth -= 1;
            }
            TokenKind::Semicolon if depth == 0 => {
                if i > start {
                    statements.push(&tokens[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth > 0 {
        let span = tokens[start].span.merge(tokens[tokens.len() - 1].span);
        return Err(ParseError::new("Unclosed '('", span));
    }
    if start < tokens.len() {
        statements.push(&tokens[start..]);
    }
    Ok(statements)
}

/// Splits a token run on commas at parenthesis depth zero.
fn split_top_level_commas(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LeftParen => depth += 1,
            TokenKind::RightParen => depth = depth.saturating_sub(1),
            TokenKind::Comma if depth == 0 => {
                parts.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn is_any_keyword(token: &Token, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| token.is_keyword(kw))
}

/// Returns the source text covered by a token run, whitespace-collapsed.
fn source_text(src: &str, tokens: &[Token]) -> String {
    match (tokens.first(), tokens.last()) {
        (Some(first), Some(last)) => src[first.span.start..last.span.end]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

fn span_of(tokens: &[Token]) -> Span {
    match (tokens.first(), tokens.last()) {
        (Some(first), Some(last)) => first.span.merge(last.span),
        _ => Span::default(),
    }
}

// ================================================================
// Column definitions
// ================================================================

/// Parses `<name> <type> [constraints...]`.
fn parse_column(src: &str, tokens: &[Token]) -> Result<Column, ParseError> {
    let name = tokens
        .first()
        .and_then(Token::identifier)
        .ok_or_else(|| ParseError::new("Expected column name", span_of(tokens)))?;

    // Positions of depth-zero boundary keywords after the name.
    let mut depth = 0usize;
    let mut boundaries = Vec::new();
    for (i, token) in tokens.iter().enumerate().skip(1) {
        match token.kind {
            TokenKind::LeftParen => depth += 1,
            TokenKind::RightParen => depth = depth.saturating_sub(1),
            _ if depth == 0 && is_any_keyword(token, COLUMN_BOUNDARY_KEYWORDS) => {
                boundaries.push(i);
            }
            _ => {}
        }
    }

    let type_end = boundaries.first().copied().unwrap_or(tokens.len());
    let data_type = source_text(src, &tokens[1..type_end]);
    if data_type.is_empty() {
        return Err(ParseError::new(
            format!("Column '{name}' has no type"),
            span_of(tokens),
        ));
    }

    let nullable = !boundaries.windows(2).any(|w| {
        w[1] == w[0] + 1 && tokens[w[0]].is_keyword("NOT") && tokens[w[1]].is_keyword("NULL")
    });

    let default = match boundaries.iter().position(|&i| tokens[i].is_keyword("DEFAULT")) {
        Some(at) => {
            let start = boundaries[at] + 1;
            // The first token after DEFAULT always belongs to the value
            // (covers `DEFAULT NULL`).
            let end = boundaries
                .iter()
                .copied()
                .find(|&b| b > start)
                .unwrap_or(tokens.len());
            if start >= tokens.len() {
                return Err(ParseError::unexpected_eof(
                    "default expression",
                    tokens[boundaries[at]].span,
                ));
            }
            Some(source_text(src, &tokens[start..end]))
        }
        None => None,
    };

    Ok(Column {
        name,
        data_type,
        nullable,
        default,
    })
}

// ================================================================
// Accumulated state
// ================================================================

#[derive(Debug)]
struct TableEntry {
    name: String,
    body: Vec<String>,
    columns: Vec<Column>,
}

impl TableEntry {
    const fn new(name: String) -> Self {
        Self {
            name,
            body: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Adds a column unless one with the same name was already parsed.
    fn merge_column(&mut self, column: Column, definition: String) {
        if self.columns.iter().any(|c| c.name == column.name) {
            trace!(table = %self.name, column = %column.name, "column already declared, keeping first");
            return;
        }
        self.columns.push(column);
        self.body.push(definition);
    }
}

#[derive(Debug, Default)]
struct ExpectationBuilder {
    tables: Vec<TableEntry>,
    table_index: HashMap<String, usize>,
    indexes: Vec<Index>,
    constraints: Vec<Constraint>,
    extensions: Vec<Extension>,
    views: Vec<View>,
}

impl ExpectationBuilder {
    fn table_mut(&mut self, name: &str) -> &mut TableEntry {
        let tables = &mut self.tables;
        let idx = *self
            .table_index
            .entry(name.to_string())
            .or_insert_with(|| {
                tables.push(TableEntry::new(name.to_string()));
                tables.len() - 1
            });
        &mut self.tables[idx]
    }

    fn finish(self) -> SchemaExpectation {
        let tables = self
            .tables
            .into_iter()
            .map(|entry| Table {
                create_sql: render_create_table(&entry.name, &entry.body),
                expected_policies: vec![canonical_policy_name(&entry.name)],
                expects_rls_enabled: true,
                name: entry.name,
                columns: entry.columns,
            })
            .collect();

        SchemaExpectation {
            tables,
            indexes: self.indexes,
            constraints: self.constraints,
            extensions: self.extensions,
            views: self.views,
        }
    }
}

// ================================================================
// Statement parser
// ================================================================

struct StatementParser<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> StatementParser<'a> {
    const fn new(src: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            src,
            tokens,
            pos: 0,
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consumes a keyword sequence only if every word matches.
    fn eat_keywords(&mut self, keywords: &[&str]) -> bool {
        let matches = keywords.iter().enumerate().all(|(i, kw)| {
            self.tokens
                .get(self.pos + i)
                .is_some_and(|t| t.is_keyword(kw))
        });
        if matches {
            self.pos += keywords.len();
        }
        matches
    }

    fn statement_span(&self) -> Span {
        span_of(self.tokens)
    }

    fn current_span(&self) -> Span {
        self.peek()
            .map_or_else(|| self.statement_span(), |t| t.span)
    }

    fn statement_text(&self) -> String {
        source_text(self.src, self.tokens)
    }

    /// Reads `[schema.]name`. Returns `Ok(None)` for objects outside
    /// the `public` schema.
    fn qualified_name(&mut self, what: &str) -> Result<Option<String>, ParseError> {
        let first = self
            .peek()
            .and_then(Token::identifier)
            .ok_or_else(|| ParseError::new(format!("Expected {what} name"), self.current_span()))?;
        self.pos += 1;

        if self.peek().is_some_and(|t| t.kind == TokenKind::Dot) {
            self.pos += 1;
            let second = self.peek().and_then(Token::identifier).ok_or_else(|| {
                ParseError::new(format!("Expected {what} name after '.'"), self.current_span())
            })?;
            self.pos += 1;
            if first != "public" {
                return Ok(None);
            }
            return Ok(Some(second));
        }
        Ok(Some(first))
    }

    /// Returns the tokens up to the matching `)` of the `(` at the
    /// current position and moves past it.
    fn parenthesized(&mut self, context: &str) -> Result<&'a [Token], ParseError> {
        match self.peek() {
            Some(t) if t.kind == TokenKind::LeftParen => {}
            _ => {
                return Err(ParseError::new(
                    format!("Expected '(' after {context}"),
                    self.current_span(),
                ));
            }
        }
        let open = self.pos;
        let mut depth = 0usize;
        for (i, token) in self.tokens.iter().enumerate().skip(open) {
            match token.kind {
                TokenKind::LeftParen => depth += 1,
                TokenKind::RightParen => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos = i + 1;
                        return Ok(&self.tokens[open + 1..i]);
                    }
                }
                _ => {}
            }
        }
        Err(ParseError::new("Unclosed '('", self.statement_span()))
    }

    fn skip(&self, reason: &str) {
        trace!(statement = %self.statement_text(), reason, "skipping SSOT statement");
    }

    fn parse_into(&mut self, builder: &mut ExpectationBuilder) -> Result<(), ParseError> {
        if self.eat_keyword("CREATE") {
            if self.eat_keyword("TABLE") {
                return self.parse_create_table(builder);
            }
            if self.peek_keyword("UNIQUE") || self.peek_keyword("INDEX") {
                return self.parse_create_index(builder);
            }
            if self.eat_keyword("EXTENSION") {
                return self.parse_create_extension(builder);
            }
            if self.eat_keyword("VIEW") || self.eat_keywords(&["OR", "REPLACE", "VIEW"]) {
                return self.parse_create_view(builder);
            }
        } else if self.eat_keywords(&["ALTER", "TABLE"]) {
            return self.parse_alter_table(builder);
        }
        self.skip("not a recognized statement");
        Ok(())
    }

    fn parse_create_table(&mut self, builder: &mut ExpectationBuilder) -> Result<(), ParseError> {
        self.eat_keywords(&["IF", "NOT", "EXISTS"]);
        let Some(name) = self.qualified_name("table")? else {
            self.skip("table outside public schema");
            return Ok(());
        };
        let body = self.parenthesized("CREATE TABLE name")?;

        let entry = builder.table_mut(&name);
        if body.is_empty() {
            return Ok(());
        }
        for item in split_top_level_commas(body) {
            if item.is_empty() {
                return Err(ParseError::new(
                    format!("Empty entry in column list of '{name}'"),
                    span_of(body),
                ));
            }
            let text = source_text(self.src, item);
            if is_any_keyword(&item[0], TABLE_CONSTRAINT_KEYWORDS) {
                entry.body.push(text);
                continue;
            }
            let column = parse_column(self.src, item)?;
            entry.merge_column(column, text);
        }
        Ok(())
    }

    fn parse_alter_table(&mut self, builder: &mut ExpectationBuilder) -> Result<(), ParseError> {
        self.eat_keywords(&["IF", "EXISTS"]);
        self.eat_keyword("ONLY");
        let Some(table) = self.qualified_name("table")? else {
            self.skip("table outside public schema");
            return Ok(());
        };

        let rest = &self.tokens[self.pos..];
        for action in split_top_level_commas(rest) {
            let mut sub = StatementParser::new(self.src, action);
            if sub.eat_keywords(&["ADD", "COLUMN"]) {
                sub.eat_keywords(&["IF", "NOT", "EXISTS"]);
                let def = &action[sub.pos..];
                if def.is_empty() {
                    return Err(ParseError::unexpected_eof(
                        "column definition",
                        span_of(action),
                    ));
                }
                let column = parse_column(self.src, def)?;
                let text = source_text(self.src, def);
                builder.table_mut(&table).merge_column(column, text);
            } else if sub.eat_keywords(&["ADD", "CONSTRAINT"]) {
                let name = sub.peek().and_then(Token::identifier).ok_or_else(|| {
                    ParseError::new("Expected constraint name", sub.current_span())
                })?;
                let def = &action[sub.pos + 1..];
                if def.is_empty() {
                    return Err(ParseError::unexpected_eof(
                        "constraint definition",
                        span_of(action),
                    ));
                }
                let definition = source_text(self.src, def);
                builder.constraints.push(Constraint {
                    sql: format!(
                        "ALTER TABLE {} ADD CONSTRAINT {} {};",
                        qualified(&table),
                        quote_ident(&name),
                        definition
                    ),
                    table: table.clone(),
                    name,
                    definition,
                });
            } else if sub.eat_keywords(&["ENABLE", "ROW", "LEVEL", "SECURITY"]) {
                // Every table already expects RLS.
                trace!(table = %table, "RLS enabled in SSOT");
            } else {
                sub.skip("unsupported ALTER TABLE action");
            }
        }
        Ok(())
    }

    fn parse_create_index(&mut self, builder: &mut ExpectationBuilder) -> Result<(), ParseError> {
        let unique = self.eat_keyword("UNIQUE");
        if !self.eat_keyword("INDEX") {
            self.skip("UNIQUE without INDEX");
            return Ok(());
        }
        self.eat_keyword("CONCURRENTLY");
        self.eat_keywords(&["IF", "NOT", "EXISTS"]);
        if self.peek_keyword("ON") {
            self.skip("unnamed index");
            return Ok(());
        }
        let Some(name) = self.qualified_name("index")? else {
            self.skip("index outside public schema");
            return Ok(());
        };

        let on_at = self.pos;
        if !self.eat_keyword("ON") {
            return Err(ParseError::new(
                format!("Expected ON after index name '{name}'"),
                self.current_span(),
            ));
        }
        self.eat_keyword("ONLY");
        let Some(table) = self.qualified_name("table")? else {
            self.skip("index on table outside public schema");
            return Ok(());
        };
        let tail = source_text(self.src, &self.tokens[on_at..]);

        builder.indexes.push(Index {
            sql: format!(
                "CREATE {}INDEX IF NOT EXISTS {} {};",
                if unique { "UNIQUE " } else { "" },
                quote_ident(&name),
                tail
            ),
            name,
            table,
            unique,
        });
        Ok(())
    }

    fn parse_create_extension(
        &mut self,
        builder: &mut ExpectationBuilder,
    ) -> Result<(), ParseError> {
        self.eat_keywords(&["IF", "NOT", "EXISTS"]);
        let name = self
            .peek()
            .and_then(Token::identifier)
            .ok_or_else(|| ParseError::new("Expected extension name", self.current_span()))?;
        self.pos += 1;
        let tail = source_text(self.src, &self.tokens[self.pos..]);
        let sql = if tail.is_empty() {
            format!("CREATE EXTENSION IF NOT EXISTS {};", quote_ident(&name))
        } else {
            format!("CREATE EXTENSION IF NOT EXISTS {} {};", quote_ident(&name), tail)
        };
        builder.extensions.push(Extension { name, sql });
        Ok(())
    }

    fn parse_create_view(&mut self, builder: &mut ExpectationBuilder) -> Result<(), ParseError> {
        let name_at = self.pos;
        let Some(name) = self.qualified_name("view")? else {
            self.skip("view outside public schema");
            return Ok(());
        };
        if !self.tokens[self.pos..].iter().any(|t| t.is_keyword("AS")) {
            return Err(ParseError::new(
                format!("Expected AS in view '{name}'"),
                self.statement_span(),
            ));
        }
        let sql = format!(
            "CREATE OR REPLACE VIEW {};",
            source_text(self.src, &self.tokens[name_at..])
        );
        builder.views.push(View { name, sql });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(def: &str) -> Column {
        let tokens = tokenize(def).unwrap();
        parse_column(def, &tokens).unwrap()
    }

    #[test]
    fn test_column_nullable_with_default() {
        let col = column("status text DEFAULT 'active'::text");
        assert_eq!(col.name, "status");
        assert_eq!(col.data_type, "text");
        assert!(col.nullable);
        assert_eq!(col.default.as_deref(), Some("'active'::text"));
    }

    #[test]
    fn test_column_not_null_after_default() {
        let col = column("created_at timestamp with time zone DEFAULT now() NOT NULL");
        assert_eq!(col.data_type, "timestamp with time zone");
        assert!(!col.nullable);
        assert_eq!(col.default.as_deref(), Some("now()"));
    }

    #[test]
    fn test_column_type_with_parens() {
        let col = column("price numeric(10, 2) NOT NULL CHECK (price >= 0)");
        assert_eq!(col.data_type, "numeric(10, 2)");
        assert!(!col.nullable);
        assert_eq!(col.default, None);
    }

    #[test]
    fn test_column_default_null() {
        let col = column("notes text DEFAULT NULL");
        assert_eq!(col.default.as_deref(), Some("NULL"));
        assert!(col.nullable);
    }

    #[test]
    fn test_column_quoted_name_keeps_case() {
        let col = column(r#""firstName" varchar(100) NOT NULL"#);
        assert_eq!(col.name, "firstName");
        assert_eq!(col.data_type, "varchar(100)");
    }

    #[test]
    fn test_column_without_type_errors() {
        let tokens = tokenize("id NOT NULL").unwrap();
        let err = parse_column("id NOT NULL", &tokens).unwrap_err();
        assert!(err.message.contains("has no type"));
    }

    #[test]
    fn test_split_statements_unbalanced() {
        let tokens = tokenize("CREATE TABLE t (a int;").unwrap();
        assert!(split_statements(&tokens).is_err());

        let tokens = tokenize("SELECT 1);").unwrap();
        let err = split_statements(&tokens).unwrap_err();
        assert!(err.message.contains("Unbalanced"));
    }

    #[test]
    fn test_split_top_level_commas_respects_parens() {
        let tokens = tokenize("a numeric(10,2), b int, CHECK (a > 0 AND b IN (1,2))").unwrap();
        assert_eq!(split_top_level_commas(&tokens).len(), 3);
    }
}
