//! Recursive-descent parser building [`Tree`]s from the lexed item stream.
//!
//! `{{define}}` and `{{block}}` bodies are hoisted into their own trees;
//! the returned map holds the main tree under the given name plus one tree
//! per defined sub-template.

use std::collections::BTreeMap;

use super::lexer::{Item, ItemKind, Lexer};
use super::node::{
    ActionNode, Arg, BranchNode, Command, ListNode, Node, NumberLit, Pipe, TemplateNode,
    TextNode, Tree, Variable,
};

/// A parse failure with its byte position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl From<super::lexer::LexError> for ParseError {
    fn from(e: super::lexer::LexError) -> Self {
        ParseError::new(e.message, e.position)
    }
}

/// What ended a list of nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Eof,
    End,
    Else,
    ElseIf,
}

pub struct Parser {
    items: Vec<Item>,
    pos: usize,
    trees: BTreeMap<String, Tree>,
    /// Depth of open branch constructs; `define` is only legal at depth 0.
    depth: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Parser, ParseError> {
        let items = Lexer::new(source).tokenize()?;
        Ok(Parser {
            items,
            pos: 0,
            trees: BTreeMap::new(),
            depth: 0,
        })
    }

    /// Parses the whole source into named trees.
    pub fn parse(mut self, name: &str) -> Result<BTreeMap<String, Tree>, ParseError> {
        let (root, stop) = self.parse_list()?;
        match stop {
            StopReason::Eof => {}
            _ => {
                return Err(ParseError::new(
                    "unexpected {{end}} or {{else}} outside a branch",
                    self.current().pos,
                ));
            }
        }
        self.trees.insert(
            name.to_string(),
            Tree {
                name: name.to_string(),
                root,
            },
        );
        Ok(self.trees)
    }

    fn current(&self) -> &Item {
        &self.items[self.pos.min(self.items.len() - 1)]
    }

    fn bump(&mut self) -> Item {
        let item = self.current().clone();
        if self.pos < self.items.len() - 1 {
            self.pos += 1;
        }
        item
    }

    fn at(&self, kind: ItemKind) -> bool {
        self.current().kind == kind
    }

    fn expect(&mut self, kind: ItemKind, what: &str) -> Result<Item, ParseError> {
        if self.at(kind) {
            Ok(self.bump())
        } else {
            Err(ParseError::new(
                format!("expected {what}, found {:?}", self.current().text),
                self.current().pos,
            ))
        }
    }

    /// Parses nodes until EOF or a branch terminator.
    fn parse_list(&mut self) -> Result<(ListNode, StopReason), ParseError> {
        let mut list = ListNode::default();
        loop {
            match self.current().kind {
                ItemKind::Eof => return Ok((list, StopReason::Eof)),
                ItemKind::Text => {
                    let item = self.bump();
                    list.nodes.push(Node::Text(TextNode {
                        text: item.text,
                        pos: item.pos,
                    }));
                }
                ItemKind::LeftDelim => {
                    let delim = self.bump();
                    match self.parse_directive(delim.pos)? {
                        Directive::Node(node) => list.nodes.push(node),
                        Directive::Skip => {}
                        Directive::End => return Ok((list, StopReason::End)),
                        Directive::Else => return Ok((list, StopReason::Else)),
                        Directive::ElseIf => return Ok((list, StopReason::ElseIf)),
                    }
                }
                _ => {
                    return Err(ParseError::new(
                        format!("unexpected token {:?}", self.current().text),
                        self.current().pos,
                    ));
                }
            }
        }
    }

    fn parse_directive(&mut self, pos: usize) -> Result<Directive, ParseError> {
        if self.at(ItemKind::Ident) {
            match self.current().text.as_str() {
                "if" => {
                    self.bump();
                    return Ok(Directive::Node(self.parse_branch(pos, BranchKind::If)?));
                }
                "with" => {
                    self.bump();
                    return Ok(Directive::Node(self.parse_branch(pos, BranchKind::With)?));
                }
                "range" => {
                    self.bump();
                    return Ok(Directive::Node(self.parse_branch(pos, BranchKind::Range)?));
                }
                "template" => {
                    self.bump();
                    return Ok(Directive::Node(self.parse_template(pos)?));
                }
                "define" => {
                    self.bump();
                    self.parse_define(pos)?;
                    return Ok(Directive::Skip);
                }
                "block" => {
                    self.bump();
                    return Ok(Directive::Node(self.parse_block(pos)?));
                }
                "end" => {
                    self.bump();
                    self.expect(ItemKind::RightDelim, "}}")?;
                    return Ok(Directive::End);
                }
                "else" => {
                    self.bump();
                    if self.at(ItemKind::Ident) && self.current().text == "if" {
                        // The `{{else if}}` chain: the caller re-enters
                        // branch parsing with the `if` keyword pending.
                        self.bump();
                        return Ok(Directive::ElseIf);
                    }
                    self.expect(ItemKind::RightDelim, "}}")?;
                    return Ok(Directive::Else);
                }
                _ => {}
            }
        }
        // A plain action.
        let pipe = self.parse_pipeline(true)?;
        self.expect(ItemKind::RightDelim, "}}")?;
        Ok(Directive::Node(Node::Action(ActionNode { pipe, pos })))
    }

    fn parse_branch(&mut self, pos: usize, kind: BranchKind) -> Result<Node, ParseError> {
        let pipe = self.parse_pipeline(true)?;
        self.expect(ItemKind::RightDelim, "}}")?;

        self.depth += 1;
        let (list, stop) = self.parse_list()?;
        let else_list = match stop {
            StopReason::End => None,
            StopReason::Else => {
                let (else_list, stop) = self.parse_list()?;
                if stop != StopReason::End {
                    self.depth -= 1;
                    return Err(ParseError::new("unterminated else branch", pos));
                }
                Some(else_list)
            }
            StopReason::ElseIf => {
                // Desugar `{{else if ...}}` into an else list holding a
                // nested if, which consumes the shared `{{end}}`.
                let nested = self.parse_branch(self.current().pos, BranchKind::If)?;
                Some(ListNode {
                    nodes: vec![nested],
                })
            }
            StopReason::Eof => {
                self.depth -= 1;
                return Err(ParseError::new("unterminated branch, missing {{end}}", pos));
            }
        };
        self.depth -= 1;

        let branch = BranchNode {
            pipe,
            list,
            else_list,
            pos,
        };
        Ok(match kind {
            BranchKind::If => Node::If(branch),
            BranchKind::With => Node::With(branch),
            BranchKind::Range => Node::Range(branch),
        })
    }

    fn parse_template(&mut self, pos: usize) -> Result<Node, ParseError> {
        let name = self.expect(ItemKind::Str, "template name string")?;
        let pipe = if self.at(ItemKind::RightDelim) {
            None
        } else {
            Some(self.parse_pipeline(false)?)
        };
        self.expect(ItemKind::RightDelim, "}}")?;
        Ok(Node::Template(TemplateNode {
            name: name.text,
            pipe,
            pos,
        }))
    }

    fn parse_define(&mut self, pos: usize) -> Result<(), ParseError> {
        if self.depth > 0 {
            return Err(ParseError::new("define is only allowed at top level", pos));
        }
        let name = self.expect(ItemKind::Str, "define name string")?;
        self.expect(ItemKind::RightDelim, "}}")?;
        self.depth += 1;
        let (root, stop) = self.parse_list()?;
        self.depth -= 1;
        if stop != StopReason::End {
            return Err(ParseError::new("unterminated define, missing {{end}}", pos));
        }
        self.trees.insert(
            name.text.clone(),
            Tree {
                name: name.text,
                root,
            },
        );
        Ok(())
    }

    /// `{{block "name" pipeline}}` is a define plus an invocation.
    fn parse_block(&mut self, pos: usize) -> Result<Node, ParseError> {
        if self.depth > 0 {
            return Err(ParseError::new("block is only allowed at top level", pos));
        }
        let name = self.expect(ItemKind::Str, "block name string")?;
        let pipe = if self.at(ItemKind::RightDelim) {
            None
        } else {
            Some(self.parse_pipeline(false)?)
        };
        self.expect(ItemKind::RightDelim, "}}")?;
        self.depth += 1;
        let (root, stop) = self.parse_list()?;
        self.depth -= 1;
        if stop != StopReason::End {
            return Err(ParseError::new("unterminated block, missing {{end}}", pos));
        }
        self.trees.insert(
            name.text.clone(),
            Tree {
                name: name.text.clone(),
                root,
            },
        );
        Ok(Node::Template(TemplateNode {
            name: name.text,
            pipe,
            pos,
        }))
    }

    /// Parses a pipeline, optionally accepting leading declarations.
    fn parse_pipeline(&mut self, allow_decl: bool) -> Result<Pipe, ParseError> {
        let pos = self.current().pos;
        let mut decl = Vec::new();

        if allow_decl && self.at(ItemKind::Variable) {
            // Lookahead for `$a := ` or `$a, $b := `.
            let save = self.pos;
            let mut vars = vec![Variable::new(&self.bump().text)];
            while self.at(ItemKind::Comma) {
                self.bump();
                let var = self.expect(ItemKind::Variable, "variable")?;
                vars.push(Variable::new(&var.text));
            }
            if self.at(ItemKind::Declare) {
                self.bump();
                decl = vars;
            } else {
                self.pos = save;
            }
        }

        let mut cmds = vec![self.parse_command()?];
        while self.at(ItemKind::Pipe) {
            self.bump();
            cmds.push(self.parse_command()?);
        }
        Ok(Pipe { decl, cmds, pos })
    }

    fn parse_command(&mut self) -> Result<Command, ParseError> {
        let pos = self.current().pos;
        let mut args = Vec::new();
        loop {
            match self.current().kind {
                ItemKind::RightDelim | ItemKind::Pipe | ItemKind::RParen => break,
                ItemKind::Eof => {
                    return Err(ParseError::new("unclosed action", self.current().pos));
                }
                _ => args.push(self.parse_operand()?),
            }
        }
        if args.is_empty() {
            return Err(ParseError::new("empty command", pos));
        }
        // A lone parenthesized single-command pipeline is the command.
        if args.len() == 1 {
            if let Arg::Pipe(pipe) = &args[0] {
                if pipe.decl.is_empty() && pipe.cmds.len() == 1 {
                    return Ok(pipe.cmds[0].clone());
                }
            }
        }
        Ok(Command { args, pos })
    }

    fn parse_operand(&mut self) -> Result<Arg, ParseError> {
        let item = self.bump();
        match item.kind {
            ItemKind::Ident => Ok(match item.text.as_str() {
                "true" => Arg::Bool(true),
                "false" => Arg::Bool(false),
                "nil" => Arg::Nil,
                _ => Arg::Ident(item.text),
            }),
            ItemKind::Field => {
                let mut path = vec![item.text];
                while self.at(ItemKind::Field) {
                    path.push(self.bump().text);
                }
                Ok(Arg::Field(path))
            }
            ItemKind::Variable => {
                let mut ident = vec![item.text];
                while self.at(ItemKind::Field) {
                    ident.push(self.bump().text);
                }
                Ok(Arg::Variable(Variable { ident }))
            }
            ItemKind::Dot => Ok(Arg::Dot),
            ItemKind::Str => Ok(Arg::Str(item.text)),
            ItemKind::Number => {
                let is_float = item.text.contains(['.', 'e', 'E'])
                    && !item.text.starts_with("0x")
                    && !item.text.starts_with("0X");
                Ok(Arg::Number(NumberLit {
                    text: item.text,
                    is_float,
                }))
            }
            ItemKind::LParen => {
                let pipe = self.parse_pipeline(false)?;
                self.expect(ItemKind::RParen, ")")?;
                Ok(Arg::Pipe(pipe))
            }
            _ => Err(ParseError::new(
                format!("unexpected token {:?} in operand position", item.text),
                item.pos,
            )),
        }
    }
}

enum Directive {
    Node(Node),
    /// A directive that contributes no node (a hoisted `define`).
    Skip,
    End,
    Else,
    ElseIf,
}

#[derive(Clone, Copy)]
enum BranchKind {
    If,
    With,
    Range,
}
