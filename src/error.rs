//! Compile-time error taxonomy and source-context rendering.
//!
//! Parse errors are rendered rustc-style with a `--> file:line:column`
//! header and a caret line pointing into the offending template source.

use std::fmt::Write as _;

use thiserror::Error;

/// Errors raised while compiling a configuration into a source file.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A template reads the dot but no data shape was declared for it.
    #[error("template {template:?}: no data configuration declared (add an entry or a \"*\" default)")]
    MissingData { template: String },

    /// The declared data value cannot be turned into a data qualifier.
    #[error("template {template:?}: bad data selector: {detail}")]
    BadDataSelector { template: String, detail: String },

    /// A dynamically dispatched helper uses a type that is not public.
    #[error("helper {helper:?}: parameter or result type {ty:?} is not public")]
    UnexportedHelperType { helper: String, ty: String },

    /// A pipeline references a helper absent from the catalog.
    #[error("template {template:?}: unknown helper {name:?}")]
    UnknownHelper { template: String, name: String },

    /// Template source failed to lex or parse. The message already carries
    /// the rendered source context.
    #[error("{0}")]
    Parse(String),

    /// The simplifier rejected the tree.
    #[error("template {template:?}: {detail}")]
    Annotation { template: String, detail: String },

    /// The emitter hit a node or expression it has no translation for.
    #[error("template {template:?}: cannot emit {node} node: {detail}")]
    Emission {
        template: String,
        node: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CompileError {
    pub(crate) fn emission(
        template: impl Into<String>,
        node: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        CompileError::Emission {
            template: template.into(),
            node,
            detail: detail.into(),
        }
    }
}

/// A 1-indexed line/column pair resolved from a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
}

impl SourceLocation {
    /// Resolves a byte offset into line and column numbers.
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source[..offset];
        let line = before.bytes().filter(|&b| b == b'\n').count() + 1;
        let line_start = before.rfind('\n').map(|p| p + 1).unwrap_or(0);
        let column = source[line_start..offset].chars().count() + 1;
        SourceLocation { line, column }
    }
}

/// Configuration for formatting an error with source context.
pub struct ErrorFormat<'a> {
    message: &'a str,
    source: &'a str,
    position: usize,
    filename: &'a str,
    annotation: Option<String>,
}

impl<'a> ErrorFormat<'a> {
    pub fn new(message: &'a str, source: &'a str, position: usize) -> Self {
        Self {
            message,
            source,
            position,
            filename: "template",
            annotation: None,
        }
    }

    pub fn filename(mut self, filename: &'a str) -> Self {
        self.filename = filename;
        self
    }

    pub fn annotation(mut self, ann: String) -> Self {
        self.annotation = Some(ann);
        self
    }

    /// Formats the error with the offending line and a caret underneath.
    pub fn format(&self) -> String {
        let loc = SourceLocation::from_offset(self.source, self.position);

        let mut msg = format!("error: {}\n", self.message);
        let _ = writeln!(msg, " --> {}:{}:{}", self.filename, loc.line, loc.column);

        let lines: Vec<&str> = self.source.lines().collect();
        if loc.line > 0 && loc.line <= lines.len() {
            let content = lines[loc.line - 1].replace('\t', "    ");
            let width = loc.line.to_string().len();
            let _ = writeln!(msg, "{:>width$} | {}", loc.line, content, width = width);
            let annotation = self.annotation.as_deref().unwrap_or("");
            let _ = writeln!(
                msg,
                "{:>width$} | {:>col$}^ {}",
                "",
                "",
                annotation,
                width = width,
                col = loc.column.saturating_sub(1)
            );
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_from_offset() {
        let src = "ab\ncd\nef";
        assert_eq!(
            SourceLocation::from_offset(src, 0),
            SourceLocation { line: 1, column: 1 }
        );
        assert_eq!(
            SourceLocation::from_offset(src, 4),
            SourceLocation { line: 2, column: 2 }
        );
        assert_eq!(
            SourceLocation::from_offset(src, 6),
            SourceLocation { line: 3, column: 1 }
        );
    }

    #[test]
    fn test_error_format_basic() {
        let formatted = ErrorFormat::new("unexpected token", "{{if}}", 4)
            .filename("t.tpl")
            .annotation("expected: pipeline".to_string())
            .format();

        assert!(formatted.contains("error: unexpected token"));
        assert!(formatted.contains("--> t.tpl:1:5"));
        assert!(formatted.contains("{{if}}"));
        assert!(formatted.contains("^ expected: pipeline"));
    }
}
