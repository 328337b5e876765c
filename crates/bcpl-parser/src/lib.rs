//! Lexer and parser for BCPL.
//!
//! The lexer is built on logos; the parser is a hand-written recursive
//! descent producing the `bcpl-ast` tree. Both fail fast with positioned
//! errors — semantic recovery happens later, in the analyzer.

pub mod lexer;
pub mod parser;

pub use lexer::{lex, LexError, Token};
pub use parser::{parse_program, ParseError};

/// Convenience entry point: source text straight to a `Program`.
pub fn parse_source(source: &str) -> Result<bcpl_ast::Program, ParseError> {
    let tokens = lex(source).map_err(|e| ParseError {
        message: e.to_string(),
        offset: e.offset,
    })?;
    parse_program(&tokens)
}
