//! Scope-typed checking of lowered trees.
//!
//! Builds the scope tree the emitter replays: one scope per `with`/`range`
//! body and else branch, each recording its dot type and declared variable
//! types. Helper references are validated against the closed catalog here,
//! so the emitter never meets an unknown name.

use rustc_hash::FxHashMap;

use crate::compile::calls::builtin_result_ty;
use crate::error::CompileError;
use crate::funcs::Funcs;
use crate::parse::node::{Arg, Command, ListNode, Node, Pipe, Tree};
use crate::reflect::{FnSig, Ty, TypeEnv};

/// One scope of the typed scope tree.
#[derive(Debug, Clone, Default)]
pub(crate) struct Scope {
    pub dot: Option<Ty>,
    pub vars: FxHashMap<String, Ty>,
    pub children: Vec<Scope>,
}

/// Read access to the active scope chain.
pub(crate) trait ScopeView {
    fn dot_ty(&self) -> Option<&Ty>;
    fn var_ty(&self, name: &str) -> Option<&Ty>;
}

pub(crate) struct StackView<'a>(pub &'a [Scope]);

impl ScopeView for StackView<'_> {
    fn dot_ty(&self) -> Option<&Ty> {
        self.0.last().and_then(|s| s.dot.as_ref())
    }

    fn var_ty(&self, name: &str) -> Option<&Ty> {
        self.0.iter().rev().find_map(|s| s.vars.get(name))
    }
}

pub(crate) struct ChainView<'a>(pub Vec<&'a Scope>);

impl ScopeView for ChainView<'_> {
    fn dot_ty(&self) -> Option<&Ty> {
        self.0.last().and_then(|s| s.dot.as_ref())
    }

    fn var_ty(&self, name: &str) -> Option<&Ty> {
        self.0.iter().rev().find_map(|s| s.vars.get(name))
    }
}

/// Builds the scope tree for a lowered template tree.
pub(crate) fn build(
    tree: &Tree,
    data_ty: Option<Ty>,
    env: &TypeEnv,
    funcs: &Funcs,
) -> Result<Scope, CompileError> {
    let checker = Checker {
        env,
        funcs,
        template: &tree.name,
    };
    let mut stack = vec![Scope {
        dot: data_ty,
        vars: FxHashMap::default(),
        children: Vec::new(),
    }];
    checker.check_list(&tree.root, &mut stack)?;
    Ok(stack.pop().expect("root scope"))
}

struct Checker<'a> {
    env: &'a TypeEnv,
    funcs: &'a Funcs,
    template: &'a str,
}

impl Checker<'_> {
    fn annot(&self, detail: impl Into<String>) -> CompileError {
        CompileError::Annotation {
            template: self.template.to_string(),
            detail: detail.into(),
        }
    }

    fn check_list(&self, list: &ListNode, stack: &mut Vec<Scope>) -> Result<(), CompileError> {
        for node in &list.nodes {
            self.check_node(node, stack)?;
        }
        Ok(())
    }

    fn check_node(&self, node: &Node, stack: &mut Vec<Scope>) -> Result<(), CompileError> {
        match node {
            Node::Text(_) => Ok(()),

            Node::Action(action) => self.check_action(&action.pipe, stack),

            Node::If(branch) => {
                let cmd = self.only_cmd(&branch.pipe)?;
                self.cmd_ty(cmd, stack)?;
                self.check_list(&branch.list, stack)?;
                if let Some(else_list) = &branch.else_list {
                    self.check_list(else_list, stack)?;
                }
                Ok(())
            }

            Node::With(branch) => {
                let cmd = self.only_cmd(&branch.pipe)?;
                let (ty, _) = self.cmd_ty(cmd, stack)?;
                let mut vars = FxHashMap::default();
                for var in &branch.pipe.decl {
                    vars.insert(var.name().to_string(), ty.clone());
                }
                self.check_child(&branch.list, Some(ty), vars, stack)?;
                if let Some(else_list) = &branch.else_list {
                    let outer_dot = StackView(stack).dot_ty().cloned();
                    self.check_child(else_list, outer_dot, FxHashMap::default(), stack)?;
                }
                Ok(())
            }

            Node::Range(branch) => {
                let cmd = self.only_cmd(&branch.pipe)?;
                let (subject, _) = self.cmd_ty(cmd, stack)?;
                let (key_ty, value_ty) = self.range_element_types(&subject)?;
                let mut vars = FxHashMap::default();
                match branch.pipe.decl.as_slice() {
                    [] => {}
                    [value] => {
                        vars.insert(value.name().to_string(), value_ty.clone());
                    }
                    [key, value] => {
                        vars.insert(key.name().to_string(), key_ty);
                        vars.insert(value.name().to_string(), value_ty.clone());
                    }
                    more => {
                        return Err(
                            self.annot(format!("range declares {} variables", more.len()))
                        );
                    }
                }
                self.check_child(&branch.list, Some(value_ty), vars, stack)?;
                if let Some(else_list) = &branch.else_list {
                    let outer_dot = StackView(stack).dot_ty().cloned();
                    self.check_child(else_list, outer_dot, FxHashMap::default(), stack)?;
                }
                Ok(())
            }

            Node::Template(tpl) => {
                if let Some(pipe) = &tpl.pipe {
                    let cmd = self.only_cmd(pipe)?;
                    if !matches!(cmd.head(), Arg::Nil) {
                        self.cmd_ty(cmd, stack)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn check_child(
        &self,
        list: &ListNode,
        dot: Option<Ty>,
        vars: FxHashMap<String, Ty>,
        stack: &mut Vec<Scope>,
    ) -> Result<(), CompileError> {
        stack.push(Scope {
            dot,
            vars,
            children: Vec::new(),
        });
        let result = self.check_list(list, stack);
        let child = stack.pop().expect("child scope");
        stack.last_mut().expect("parent scope").children.push(child);
        result
    }

    fn check_action(&self, pipe: &Pipe, stack: &mut Vec<Scope>) -> Result<(), CompileError> {
        let cmd = self.only_cmd(pipe)?;
        let (ty, extra) = self.cmd_ty(cmd, stack)?;
        match pipe.decl.len() {
            0 => Ok(()),
            1 => {
                stack
                    .last_mut()
                    .expect("scope")
                    .vars
                    .insert(pipe.decl[0].name().to_string(), ty);
                Ok(())
            }
            n => {
                let mut outs = vec![ty];
                outs.extend(extra.into_iter().filter(|t| !matches!(t, Ty::Error)));
                if outs.len() != n {
                    return Err(self.annot(format!(
                        "cannot assign {} results to {} variables",
                        outs.len(),
                        n
                    )));
                }
                let scope = stack.last_mut().expect("scope");
                for (var, ty) in pipe.decl.iter().zip(outs) {
                    scope.vars.insert(var.name().to_string(), ty);
                }
                Ok(())
            }
        }
    }

    fn only_cmd<'p>(&self, pipe: &'p Pipe) -> Result<&'p Command, CompileError> {
        pipe.only_cmd()
            .ok_or_else(|| self.annot("pipeline was not reduced to a single command"))
    }

    fn range_element_types(&self, subject: &Ty) -> Result<(Ty, Ty), CompileError> {
        let mut ty = subject;
        while let Ty::Ref(inner) = ty {
            ty = inner;
        }
        match ty {
            Ty::Slice(elem) | Ty::Array(elem, _) => Ok((Ty::Usize, (**elem).clone())),
            Ty::Map(k, v) => Ok(((**k).clone(), (**v).clone())),
            other => Err(self.annot(format!(
                "cannot range over value of kind {:?}",
                self.env.kind(other)
            ))),
        }
    }

    fn cmd_ty(&self, cmd: &Command, stack: &[Scope]) -> Result<(Ty, Vec<Ty>), CompileError> {
        type_of_cmd(cmd, &StackView(stack), self.env, self.funcs, self.template)
    }
}

fn annot(template: &str, detail: impl Into<String>) -> CompileError {
    CompileError::Annotation {
        template: template.to_string(),
        detail: detail.into(),
    }
}

fn sig_outs(sig: &FnSig, template: &str, name: &str) -> Result<(Ty, Vec<Ty>), CompileError> {
    match sig.outs.split_first() {
        Some((Ty::Error, _)) | None => Err(annot(
            template,
            format!("helper {name:?} produces no value"),
        )),
        Some((first, rest)) => Ok((first.clone(), rest.to_vec())),
    }
}

/// The value type (plus extra results) a command produces.
pub(crate) fn type_of_cmd(
    cmd: &Command,
    view: &dyn ScopeView,
    env: &TypeEnv,
    funcs: &Funcs,
    template: &str,
) -> Result<(Ty, Vec<Ty>), CompileError> {
    match cmd.head() {
        Arg::Field(path) => {
            let dot = view
                .dot_ty()
                .ok_or_else(|| CompileError::MissingData {
                    template: template.to_string(),
                })?
                .clone();
            if env.is_method_path(path, &dot) {
                let sig = env
                    .reflect_path(path, &dot)
                    .map_err(|e| annot(template, e.to_string()))?;
                sig_outs(&sig, template, path.last().expect("path"))
            } else {
                let ty = env
                    .walk_path(path, &dot)
                    .map_err(|e| annot(template, e.to_string()))?;
                Ok((ty, vec![]))
            }
        }

        Arg::Variable(var) => {
            let base = view
                .var_ty(var.name())
                .ok_or_else(|| annot(template, format!("undefined variable ${}", var.name())))?
                .clone();
            if var.path().is_empty() {
                Ok((base, vec![]))
            } else if env.is_method_path(var.path(), &base) {
                let sig = env
                    .reflect_path(var.path(), &base)
                    .map_err(|e| annot(template, e.to_string()))?;
                sig_outs(&sig, template, var.path().last().expect("path"))
            } else {
                let ty = env
                    .walk_path(var.path(), &base)
                    .map_err(|e| annot(template, e.to_string()))?;
                Ok((ty, vec![]))
            }
        }

        Arg::Number(n) => Ok((if n.is_float { Ty::F64 } else { Ty::Isize }, vec![])),
        Arg::Str(_) => Ok((Ty::Str, vec![])),
        Arg::Bool(_) => Ok((Ty::Bool, vec![])),

        Arg::Dot => {
            let dot = view.dot_ty().ok_or_else(|| CompileError::MissingData {
                template: template.to_string(),
            })?;
            Ok((dot.clone(), vec![]))
        }

        Arg::Ident(name) => {
            let mut arg_tys = Vec::with_capacity(cmd.args.len() - 1);
            for arg in &cmd.args[1..] {
                arg_tys.push(type_of_arg(arg, view, env, template)?);
            }
            if let Some(result) = builtin_result_ty(name, &arg_tys, env) {
                let ty = result.map_err(|detail| annot(template, detail))?;
                return Ok((ty, vec![]));
            }
            let sig = funcs.get(name).ok_or_else(|| CompileError::UnknownHelper {
                template: template.to_string(),
                name: name.clone(),
            })?;
            sig_outs(sig, template, name)
        }

        Arg::Nil => Err(annot(template, "nil is only valid as a template argument")),
        Arg::Pipe(_) => Err(annot(template, "nested pipeline was not hoisted")),
    }
}

/// The type of a leaf argument.
pub(crate) fn type_of_arg(
    arg: &Arg,
    view: &dyn ScopeView,
    env: &TypeEnv,
    template: &str,
) -> Result<Ty, CompileError> {
    match arg {
        Arg::Field(path) => {
            let dot = view
                .dot_ty()
                .ok_or_else(|| CompileError::MissingData {
                    template: template.to_string(),
                })?
                .clone();
            env.walk_path(path, &dot)
                .map_err(|e| annot(template, e.to_string()))
        }
        Arg::Variable(var) => {
            let base = view
                .var_ty(var.name())
                .ok_or_else(|| annot(template, format!("undefined variable ${}", var.name())))?
                .clone();
            if var.path().is_empty() {
                Ok(base)
            } else {
                env.walk_path(var.path(), &base)
                    .map_err(|e| annot(template, e.to_string()))
            }
        }
        Arg::Dot => view
            .dot_ty()
            .cloned()
            .ok_or_else(|| CompileError::MissingData {
                template: template.to_string(),
            }),
        Arg::Number(n) => Ok(if n.is_float { Ty::F64 } else { Ty::Isize }),
        Arg::Str(_) => Ok(Ty::Str),
        Arg::Bool(_) => Ok(Ty::Bool),
        Arg::Ident(name) => Err(annot(
            template,
            format!("helper {name:?} cannot appear in argument position"),
        )),
        Arg::Nil => Err(annot(template, "nil is only valid as a template argument")),
        Arg::Pipe(_) => Err(annot(template, "nested pipeline was not hoisted")),
    }
}

