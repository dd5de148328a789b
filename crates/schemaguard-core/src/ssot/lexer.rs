//! Tokenizer for the SSOT DDL subset.
//!
//! Produces just enough structure for the statement parser: words,
//! quoted identifiers, literals, parentheses and separators. Anything
//! else is a [`TokenKind::Symbol`]. Function bodies written as
//! PostgreSQL dollar-quoted strings are consumed as a single token so
//! their semicolons never split statements.

use super::error::{ParseError, Span};

/// The kind of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword, as written.
    Word(String),
    /// Double-quoted identifier with `""` escapes resolved.
    QuotedIdent(String),
    /// Single-quoted string literal (contents only).
    String(String),
    /// Dollar-quoted string (`$$...$$` or `$tag$...$tag$`).
    DollarString,
    /// Numeric literal.
    Number,
    /// `(`
    LeftParen,
    /// `)`
    RightParen,
    /// `,`
    Comma,
    /// `;`
    Semicolon,
    /// `.`
    Dot,
    /// Any other operator or punctuation (`::`, `=`, `$1`, ...).
    Symbol,
}

/// A token with its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// The token kind.
    pub kind: TokenKind,
    /// The location in the source.
    pub span: Span,
}

impl Token {
    /// Creates a new token.
    #[must_use]
    pub const fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Returns true if this is an unquoted word equal to `keyword`,
    /// ignoring ASCII case.
    #[must_use]
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    /// Returns the identifier this token names, folding unquoted words
    /// to lower case the way PostgreSQL does.
    #[must_use]
    pub fn identifier(&self) -> Option<String> {
        match &self.kind {
            TokenKind::Word(w) => Some(w.to_lowercase()),
            TokenKind::QuotedIdent(q) => Some(q.clone()),
            _ => None,
        }
    }
}

/// A lexer over SSOT source text.
pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    start: usize,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer for the given input.
    #[must_use]
    pub const fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            start: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.input[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    const fn make_span(&self) -> Span {
        Span::new(self.start, self.pos)
    }

    const fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.make_span())
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::new(message, self.make_span())
    }

    /// Skips whitespace and comments. Block comments nest, as in
    /// PostgreSQL.
    fn skip_whitespace_and_comments(&mut self) -> Result<(), ParseError> {
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.advance();
            }

            if self.peek() == Some('-') && self.peek_next() == Some('-') {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.advance();
                }
                continue;
            }

            if self.peek() == Some('/') && self.peek_next() == Some('*') {
                self.start = self.pos;
                self.advance();
                self.advance();
                let mut depth = 1usize;
                while depth > 0 {
                    match self.advance() {
                        Some('*') if self.peek() == Some('/') => {
                            self.advance();
                            depth -= 1;
                        }
                        Some('/') if self.peek() == Some('*') => {
                            self.advance();
                            depth += 1;
                        }
                        Some(_) => {}
                        None => return Err(self.error("Unterminated block comment")),
                    }
                }
                continue;
            }

            return Ok(());
        }
    }

    fn scan_word(&mut self) -> Token {
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.advance();
        }
        let text = &self.input[self.start..self.pos];
        self.make_token(TokenKind::Word(text.to_string()))
    }

    fn scan_quoted_identifier(&mut self) -> Result<Token, ParseError> {
        let mut value = String::new();
        loop {
            match self.advance() {
                Some('"') if self.peek() == Some('"') => {
                    self.advance();
                    value.push('"');
                }
                Some('"') => break,
                Some(c) => value.push(c),
                None => return Err(self.error("Unterminated quoted identifier")),
            }
        }
        Ok(self.make_token(TokenKind::QuotedIdent(value)))
    }

    fn scan_string(&mut self, backslash_escapes: bool) -> Result<Token, ParseError> {
        let mut value = String::new();
        loop {
            match self.advance() {
                Some('\\') if backslash_escapes => {
                    if let Some(c) = self.advance() {
                        value.push(c);
                    }
                }
                Some('\'') if self.peek() == Some('\'') => {
                    self.advance();
                    value.push('\'');
                }
                Some('\'') => break,
                Some(c) => value.push(c),
                None => return Err(self.error("Unterminated string literal")),
            }
        }
        Ok(self.make_token(TokenKind::String(value)))
    }

    /// Scans `$tag$ ... $tag$`. Returns `None` when the `$` does not
    /// open a dollar quote (e.g. a positional parameter `$1`).
    fn scan_dollar_string(&mut self) -> Result<Option<Token>, ParseError> {
        let rest = &self.input[self.pos..];
        let tag_len = rest
            .char_indices()
            .find(|&(i, c)| {
                !(c.is_alphabetic() || c == '_' || (i > 0 && c.is_ascii_digit()))
            })
            .map_or(rest.len(), |(i, _)| i);
        if !rest[tag_len..].starts_with('$') {
            return Ok(None);
        }
        let delimiter = format!("${}$", &rest[..tag_len]);
        let body_start = self.pos + tag_len + 1;
        match self.input[body_start..].find(&delimiter) {
            Some(offset) => {
                self.pos = body_start + offset + delimiter.len();
                Ok(Some(self.make_token(TokenKind::DollarString)))
            }
            None => {
                self.pos = self.input.len();
                Err(self.error("Unterminated dollar-quoted string"))
            }
        }
    }

    fn scan_number(&mut self) -> Token {
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == '_')
        {
            self.advance();
        }
        self.make_token(TokenKind::Number)
    }

    /// Scans the next token, or `None` at end of input.
    ///
    /// # Errors
    ///
    /// Returns an error for unterminated comments, literals or quoted
    /// identifiers.
    pub fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        self.skip_whitespace_and_comments()?;
        self.start = self.pos;

        let Some(c) = self.advance() else {
            return Ok(None);
        };

        let token = match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            ',' => self.make_token(TokenKind::Comma),
            ';' => self.make_token(TokenKind::Semicolon),
            '.' => self.make_token(TokenKind::Dot),
            '"' => self.scan_quoted_identifier()?,
            '\'' => self.scan_string(false)?,
            'e' | 'E' if self.peek() == Some('\'') => {
                self.advance();
                self.scan_string(true)?
            }
            '$' => match self.scan_dollar_string()? {
                Some(token) => token,
                None => {
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.advance();
                    }
                    self.make_token(TokenKind::Symbol)
                }
            },
            c if c.is_ascii_digit() => self.scan_number(),
            c if c.is_alphabetic() || c == '_' => self.scan_word(),
            ':' if self.peek() == Some(':') => {
                self.advance();
                self.make_token(TokenKind::Symbol)
            }
            _ => self.make_token(TokenKind::Symbol),
        };
        Ok(Some(token))
    }
}

/// Tokenizes the whole input.
///
/// # Errors
///
/// Returns the first error [`Lexer::next_token`] reports.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_words_and_punctuation() {
        assert_eq!(
            kinds("CREATE TABLE public.t (a int);"),
            vec![
                TokenKind::Word("CREATE".into()),
                TokenKind::Word("TABLE".into()),
                TokenKind::Word("public".into()),
                TokenKind::Dot,
                TokenKind::Word("t".into()),
                TokenKind::LeftParen,
                TokenKind::Word("a".into()),
                TokenKind::Word("int".into()),
                TokenKind::RightParen,
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        let toks = kinds("-- header\n/* block /* nested */ */ x");
        assert_eq!(toks, vec![TokenKind::Word("x".into())]);
    }

    #[test]
    fn test_quoted_identifier_escape() {
        let toks = kinds(r#""Weird""Name""#);
        assert_eq!(toks, vec![TokenKind::QuotedIdent("Weird\"Name".into())]);
    }

    #[test]
    fn test_string_literal_escape() {
        let toks = kinds("'it''s'");
        assert_eq!(toks, vec![TokenKind::String("it's".into())]);
    }

    #[test]
    fn test_dollar_quoted_body_hides_semicolons() {
        let toks = kinds("AS $fn$ BEGIN RETURN 1; END; $fn$;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Word("AS".into()),
                TokenKind::DollarString,
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_positional_parameter_is_symbol() {
        let toks = kinds("$1");
        assert_eq!(toks, vec![TokenKind::Symbol]);
    }

    #[test]
    fn test_cast_operator() {
        let toks = kinds("'a'::text");
        assert_eq!(
            toks,
            vec![
                TokenKind::String("a".into()),
                TokenKind::Symbol,
                TokenKind::Word("text".into()),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        let err = tokenize("SELECT 'oops").unwrap_err();
        assert!(err.message.contains("Unterminated string"));
    }

    #[test]
    fn test_unterminated_dollar_string_errors() {
        let err = tokenize("$$ never closed").unwrap_err();
        assert!(err.message.contains("dollar-quoted"));
    }

    #[test]
    fn test_identifier_folding() {
        let toks = tokenize(r#"Students "Students""#).unwrap();
        assert_eq!(toks[0].identifier().as_deref(), Some("students"));
        assert_eq!(toks[1].identifier().as_deref(), Some("Students"));
    }
}
