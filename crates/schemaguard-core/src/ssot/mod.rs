//! SSOT (source of truth) DDL parsing.
//!
//! Only the statement shapes produced by the canonical setup script are
//! understood; see [`parser`] for the whitelist.

mod error;
pub mod lexer;
pub mod parser;

pub use error::{ParseError, Span};
pub use parser::parse_ssot;
