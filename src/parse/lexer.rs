//! Lexer for `{{...}}` template sources.
//!
//! The lexer alternates between two modes: plain text scanning (everything
//! up to the next left delimiter is one text item) and action scanning
//! (tokens inside the delimiters). Trim markers (`{{-` and `-}}`) and
//! comments (`{{/* ... */}}`) are resolved here so the parser never sees
//! them.

/// A token produced by the lexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub kind: ItemKind,
    /// The token text. For `Str` items this is the decoded value.
    pub text: String,
    /// Byte offset where the token starts.
    pub pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Text,
    LeftDelim,
    RightDelim,
    Ident,
    /// One `.ident` step of a field path.
    Field,
    /// A `$name` reference (or a bare `$`).
    Variable,
    Number,
    Str,
    Pipe,
    Declare,
    Comma,
    LParen,
    RParen,
    Dot,
    Eof,
}

/// A lexing failure with its byte position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Text,
    Action,
}

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    mode: Mode,
    /// Pending left-trim of the next emitted text chunk.
    trim_next_text: bool,
    items: Vec<Item>,
}

const LEFT_DELIM: &str = "{{";
const RIGHT_DELIM: &str = "}}";

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            mode: Mode::Text,
            trim_next_text: false,
            items: Vec::new(),
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    fn emit(&mut self, kind: ItemKind, text: impl Into<String>, pos: usize) {
        self.items.push(Item {
            kind,
            text: text.into(),
            pos,
        });
    }

    fn err(&self, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            position: self.pos,
        }
    }

    /// Tokenizes the entire input.
    pub fn tokenize(mut self) -> Result<Vec<Item>, LexError> {
        while self.pos < self.input.len() {
            match self.mode {
                Mode::Text => self.lex_text()?,
                Mode::Action => self.lex_action()?,
            }
        }
        if self.mode == Mode::Action {
            return Err(self.err("unclosed action"));
        }
        let end = self.input.len();
        self.emit(ItemKind::Eof, "", end);
        Ok(self.items)
    }

    fn lex_text(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        let rest = self.remaining();
        let (chunk, next_is_delim) = match rest.find(LEFT_DELIM) {
            Some(idx) => (&rest[..idx], true),
            None => (rest, false),
        };
        let mut text = chunk;
        self.advance(chunk.len());

        // `{{-` followed by whitespace trims the text run before it.
        let left_trim = next_is_delim && {
            let rest = self.remaining();
            rest.starts_with("{{-")
                && rest[3..].chars().next().is_some_and(|c| c.is_whitespace())
        };
        if left_trim {
            text = text.trim_end();
        }
        if self.trim_next_text {
            text = text.trim_start();
            self.trim_next_text = false;
        }
        if !text.is_empty() {
            self.emit(ItemKind::Text, text, start);
        }

        if next_is_delim {
            let delim_pos = self.pos;
            self.advance(LEFT_DELIM.len());
            if left_trim {
                self.advance(1); // the trim marker
            }
            let ws = self
                .remaining()
                .len()
                .saturating_sub(self.remaining().trim_start().len());
            if self.remaining()[ws..].starts_with("/*") {
                self.advance(ws);
                return self.lex_comment();
            }
            self.emit(ItemKind::LeftDelim, LEFT_DELIM, delim_pos);
            self.mode = Mode::Action;
        }
        Ok(())
    }

    fn lex_comment(&mut self) -> Result<(), LexError> {
        let rest = self.remaining();
        let Some(end) = rest.find("*/") else {
            return Err(self.err("unclosed comment"));
        };
        self.advance(end + 2);
        if self.remaining().starts_with(" -}}") {
            self.advance(4);
            self.trim_next_text = true;
        } else if self.remaining().starts_with(RIGHT_DELIM) {
            self.advance(RIGHT_DELIM.len());
        } else {
            return Err(self.err("comment must be closed by delimiter"));
        }
        Ok(())
    }

    fn lex_action(&mut self) -> Result<(), LexError> {
        // Skip whitespace between tokens.
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance(c.len_utf8());
            } else {
                break;
            }
        }
        let start = self.pos;
        let rest = self.remaining();

        if rest.starts_with("-}}") {
            self.advance(3);
            self.emit(ItemKind::RightDelim, RIGHT_DELIM, start);
            self.mode = Mode::Text;
            self.trim_next_text = true;
            return Ok(());
        }
        if rest.starts_with(RIGHT_DELIM) {
            self.advance(RIGHT_DELIM.len());
            self.emit(ItemKind::RightDelim, RIGHT_DELIM, start);
            self.mode = Mode::Text;
            return Ok(());
        }
        if rest.starts_with(":=") {
            self.advance(2);
            self.emit(ItemKind::Declare, ":=", start);
            return Ok(());
        }

        let Some(c) = self.peek() else {
            return Err(self.err("unclosed action"));
        };
        match c {
            '|' => {
                self.advance(1);
                self.emit(ItemKind::Pipe, "|", start);
            }
            ',' => {
                self.advance(1);
                self.emit(ItemKind::Comma, ",", start);
            }
            '(' => {
                self.advance(1);
                self.emit(ItemKind::LParen, "(", start);
            }
            ')' => {
                self.advance(1);
                self.emit(ItemKind::RParen, ")", start);
            }
            '"' => self.lex_quoted_string(start)?,
            '`' => self.lex_raw_string(start)?,
            '$' => {
                self.advance(1);
                let name = self.consume_ident();
                self.emit(ItemKind::Variable, format!("${name}"), start);
            }
            '.' => {
                self.advance(1);
                if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
                    let name = self.consume_ident();
                    self.emit(ItemKind::Field, name, start);
                } else {
                    self.emit(ItemKind::Dot, ".", start);
                }
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => self.lex_number(start)?,
            c if c.is_alphabetic() || c == '_' => {
                let ident = self.consume_ident();
                self.emit(ItemKind::Ident, ident, start);
            }
            other => return Err(self.err(format!("unexpected character {other:?} in action"))),
        }
        Ok(())
    }

    fn consume_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.advance(c.len_utf8());
            } else {
                break;
            }
        }
        self.input[start..self.pos].to_string()
    }

    fn lex_number(&mut self, start: usize) -> Result<(), LexError> {
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.advance(1);
        }
        let mut saw_digit = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {
                    saw_digit = true;
                    self.advance(1);
                }
                '.' | 'x' | 'X' | 'a'..='f' | 'A'..='F' | '+' | '-' if saw_digit => {
                    // Part of a float exponent or hex literal; signs only
                    // directly after an exponent marker.
                    if (c == '+' || c == '-')
                        && !matches!(
                            self.input[..self.pos].chars().last(),
                            Some('e') | Some('E')
                        )
                    {
                        break;
                    }
                    self.advance(1);
                }
                _ => break,
            }
        }
        if !saw_digit {
            return Err(self.err("malformed number"));
        }
        if self.peek() == Some('i') {
            return Err(self.err("imaginary literals are not supported"));
        }
        let text = &self.input[start..self.pos];
        self.emit(ItemKind::Number, text, start);
        Ok(())
    }

    fn lex_quoted_string(&mut self, start: usize) -> Result<(), LexError> {
        self.advance(1); // opening quote
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.err("unterminated string"));
            };
            match c {
                '"' => {
                    self.advance(1);
                    break;
                }
                '\\' => {
                    self.advance(1);
                    let Some(esc) = self.peek() else {
                        return Err(self.err("unterminated string"));
                    };
                    let decoded = match esc {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '"' => '"',
                        '0' => '\0',
                        other => {
                            return Err(self.err(format!("unknown escape \\{other}")));
                        }
                    };
                    value.push(decoded);
                    self.advance(esc.len_utf8());
                }
                '\n' => return Err(self.err("newline in string")),
                other => {
                    value.push(other);
                    self.advance(other.len_utf8());
                }
            }
        }
        self.emit(ItemKind::Str, value, start);
        Ok(())
    }

    fn lex_raw_string(&mut self, start: usize) -> Result<(), LexError> {
        self.advance(1);
        let rest = self.remaining();
        let Some(end) = rest.find('`') else {
            return Err(self.err("unterminated raw string"));
        };
        let value = rest[..end].to_string();
        self.advance(end + 1);
        self.emit(ItemKind::Str, value, start);
        Ok(())
    }
}
