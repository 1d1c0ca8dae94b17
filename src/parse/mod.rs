//! Template parsing: lexer, AST and recursive-descent parser.

mod lexer;
pub mod node;
mod parser;

use std::collections::BTreeMap;

pub use lexer::{Item, ItemKind, LexError, Lexer};
pub use node::Tree;
pub use parser::{ParseError, Parser};

use crate::error::{CompileError, ErrorFormat};

/// Parses a template source into its named trees, rendering failures with
/// source context.
pub fn parse(name: &str, source: &str) -> Result<BTreeMap<String, Tree>, CompileError> {
    let parser = Parser::new(source).map_err(|e| format_parse_error(name, source, e))?;
    parser
        .parse(name)
        .map_err(|e| format_parse_error(name, source, e))
}

fn format_parse_error(name: &str, source: &str, e: ParseError) -> CompileError {
    CompileError::Parse(
        ErrorFormat::new(&e.message, source, e.position)
            .filename(name)
            .format(),
    )
}
