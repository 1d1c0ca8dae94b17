//! The tree simplifier and type annotator.
//!
//! `transform_tree` rewrites a parsed tree into the shape the emitter
//! consumes — every pipeline a single command, every intermediate value a
//! declared temporary — and builds the scope-typed [`State`] the emitter
//! replays while walking the tree.
//!
//! Pass order: `unshadow` (names unique along every path), `rename` (user
//! variables prefixed `tpl_`), `lower` (temporary hoisting), `typecheck`
//! (scope tree construction and helper validation).

mod lower;
mod typecheck;
mod unshadow;

pub(crate) use typecheck::{type_of_arg, type_of_cmd, ChainView, Scope};

use crate::error::CompileError;
use crate::funcs::Funcs;
use crate::parse::node::{Arg, Command, ListNode, Node, Pipe, Tree};
use crate::reflect::{Ty, TypeEnv};

/// A simplified tree plus its replayable scope state.
#[derive(Debug)]
pub struct Transformed {
    pub tree: Tree,
    pub state: State,
}

/// Simplifies `tree` against the declared data type and helper catalog.
pub fn transform_tree(
    tree: Tree,
    data_ty: Option<Ty>,
    env: &TypeEnv,
    funcs: &Funcs,
) -> Result<Transformed, CompileError> {
    let tree = unshadow::unshadow(tree);
    let tree = unshadow::rename_vars(tree);
    let tree = lower::lower(tree);
    let root = typecheck::build(&tree, data_ty, env, funcs)?;
    Ok(Transformed {
        tree,
        state: State::new(env.clone(), funcs.clone(), root),
    })
}

/// The scope-typed state the emitter drives with `enter`/`leave` while it
/// replays the tree in the same traversal order the typechecker used.
#[derive(Debug)]
pub struct State {
    env: TypeEnv,
    funcs: Funcs,
    root: Scope,
    /// Child indices of the active scope chain.
    path: Vec<usize>,
    /// Per active scope, the next child to enter.
    next_child: Vec<usize>,
}

impl State {
    pub(crate) fn new(env: TypeEnv, funcs: Funcs, root: Scope) -> State {
        State {
            env,
            funcs,
            root,
            path: Vec::new(),
            next_child: vec![0],
        }
    }

    pub fn env(&self) -> &TypeEnv {
        &self.env
    }

    pub fn funcs(&self) -> &Funcs {
        &self.funcs
    }

    /// Descends into the next child scope.
    pub fn enter(&mut self) {
        let next = self.next_child.last_mut().expect("active scope");
        let idx = *next;
        *next += 1;
        self.path.push(idx);
        self.next_child.push(0);
    }

    /// Returns to the parent scope.
    pub fn leave(&mut self) {
        self.path.pop();
        self.next_child.pop();
    }

    fn chain(&self) -> ChainView<'_> {
        let mut chain = vec![&self.root];
        let mut current = &self.root;
        for &idx in &self.path {
            current = &current.children[idx];
            chain.push(current);
        }
        ChainView(chain)
    }

    /// The current binding of the dot, if the template has one.
    pub fn dot(&self) -> Option<Ty> {
        self.chain().0.last().and_then(|s| s.dot.clone())
    }

    /// The type of a declared template variable.
    pub fn get_var(&self, name: &str) -> Option<Ty> {
        let chain = self.chain();
        chain.0.iter().rev().find_map(|s| s.vars.get(name)).cloned()
    }

    /// The value type (plus extra results) of a command in the current
    /// scope.
    pub fn type_of_cmd(
        &self,
        cmd: &Command,
        template: &str,
    ) -> Result<(Ty, Vec<Ty>), CompileError> {
        type_of_cmd(cmd, &self.chain(), &self.env, &self.funcs, template)
    }

    /// The type of a leaf argument in the current scope.
    pub fn type_of_arg(&self, arg: &Arg, template: &str) -> Result<Ty, CompileError> {
        type_of_arg(arg, &self.chain(), &self.env, template)
    }
}

/// Does this tree read the dot anywhere?
pub fn is_using_dot(tree: &Tree) -> bool {
    fn pipe_uses_dot(pipe: &Pipe) -> bool {
        pipe.cmds.iter().any(|cmd| {
            cmd.args.iter().any(|arg| match arg {
                Arg::Dot | Arg::Field(_) => true,
                Arg::Pipe(inner) => pipe_uses_dot(inner),
                _ => false,
            })
        })
    }
    fn list_uses_dot(list: &ListNode) -> bool {
        list.nodes.iter().any(|node| match node {
            Node::Text(_) => false,
            Node::Action(a) => pipe_uses_dot(&a.pipe),
            Node::If(b) | Node::With(b) | Node::Range(b) => {
                pipe_uses_dot(&b.pipe)
                    || list_uses_dot(&b.list)
                    || b.else_list.as_ref().is_some_and(list_uses_dot)
            }
            Node::Template(t) => t.pipe.as_ref().is_some_and(pipe_uses_dot),
        })
    }
    list_uses_dot(&tree.root)
}

/// Does this tree produce any byte output anywhere?
pub fn prints_anything(tree: &Tree) -> bool {
    fn list_prints(list: &ListNode) -> bool {
        list.nodes.iter().any(|node| match node {
            Node::Text(t) => !t.text.is_empty(),
            Node::Action(a) => a.pipe.decl.is_empty(),
            Node::If(b) | Node::With(b) | Node::Range(b) => {
                list_prints(&b.list) || b.else_list.as_ref().is_some_and(list_prints)
            }
            Node::Template(_) => true,
        })
    }
    list_prints(&tree.root)
}

/// Does this tree dispatch to sub-templates?
pub fn uses_templater(tree: &Tree) -> bool {
    fn list_uses(list: &ListNode) -> bool {
        list.nodes.iter().any(|node| match node {
            Node::Template(_) => true,
            Node::If(b) | Node::With(b) | Node::Range(b) => {
                list_uses(&b.list) || b.else_list.as_ref().is_some_and(list_uses)
            }
            _ => false,
        })
    }
    list_uses(&tree.root)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::parse;
    use crate::reflect::{FieldDef, FnSig, MethodDef, TypeBody, TypeDef};

    fn sample_env() -> (TypeEnv, Ty) {
        let mut env = TypeEnv::new();
        let data = env.register(TypeDef {
            name: "TemplateData".to_string(),
            module: "demo::data".to_string(),
            public: true,
            body: TypeBody::Struct {
                fields: vec![
                    FieldDef {
                        name: "some_string".to_string(),
                        ty: Ty::Str,
                    },
                    FieldDef {
                        name: "some_int".to_string(),
                        ty: Ty::Isize,
                    },
                    FieldDef {
                        name: "some_byte_slice".to_string(),
                        ty: Ty::Slice(Box::new(Ty::U8)),
                    },
                ],
                methods: vec![MethodDef {
                    name: "method_hello".to_string(),
                    sig: FnSig::new(vec![], vec![Ty::Str]),
                }],
            },
        });
        (env, data)
    }

    fn transformed(src: &str) -> Transformed {
        let (env, data) = sample_env();
        let trees = parse::parse("t", src).unwrap();
        transform_tree(trees["t"].clone(), Some(data), &env, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn test_temp_types_recorded() {
        let tr = transformed("{{.some_int}}");
        assert_eq!(tr.state.get_var("var0"), Some(Ty::Isize));
    }

    #[test]
    fn test_method_path_type() {
        let tr = transformed("{{.method_hello}}");
        assert_eq!(tr.state.get_var("var0"), Some(Ty::Str));
    }

    #[test]
    fn test_range_scope_replay() {
        let tr = transformed("{{range $i, $v := .some_byte_slice}}{{.}}{{end}}");
        let mut state = tr.state;
        // Root scope has the hoisted subject, not the loop variables.
        assert_eq!(
            state.get_var("var0"),
            Some(Ty::Slice(Box::new(Ty::U8)))
        );
        assert_eq!(state.get_var("tpl_v"), None);
        state.enter();
        assert_eq!(state.get_var("tpl_i"), Some(Ty::Usize));
        assert_eq!(state.get_var("tpl_v"), Some(Ty::U8));
        assert_eq!(state.dot(), Some(Ty::U8));
        state.leave();
        assert_eq!(state.get_var("tpl_v"), None);
    }

    #[test]
    fn test_with_else_scope_has_outer_dot() {
        let (env, data) = sample_env();
        let trees = parse::parse(
            "t",
            "{{with .some_string}}{{.}}{{else}}{{.some_int}}{{end}}",
        )
        .unwrap();
        let tr =
            transform_tree(trees["t"].clone(), Some(data.clone()), &env, &BTreeMap::new())
                .unwrap();
        let mut state = tr.state;
        state.enter();
        assert_eq!(state.dot(), Some(Ty::Str));
        state.leave();
        state.enter();
        assert_eq!(state.dot(), Some(data));
        state.leave();
    }

    #[test]
    fn test_unknown_helper_rejected() {
        let (env, data) = sample_env();
        let trees = parse::parse("t", "{{mystery .some_string}}").unwrap();
        let err = transform_tree(trees["t"].clone(), Some(data), &env, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownHelper { name, .. } if name == "mystery"));
    }

    #[test]
    fn test_missing_data_detected() {
        let (env, _) = sample_env();
        let trees = parse::parse("t", "{{.some_string}}").unwrap();
        let err =
            transform_tree(trees["t"].clone(), None, &env, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CompileError::MissingData { .. }));
    }

    #[test]
    fn test_queries() {
        let trees = parse::parse("t", "plain").unwrap();
        let tree = &trees["t"];
        assert!(!is_using_dot(tree));
        assert!(prints_anything(tree));
        assert!(!uses_templater(tree));

        let trees = parse::parse("t", "{{$y := 1}}").unwrap();
        assert!(!prints_anything(&trees["t"]));

        let trees = parse::parse("t", r#"{{template "x"}}"#).unwrap();
        assert!(uses_templater(&trees["t"]));

        let trees = parse::parse("t", "{{.f}}").unwrap();
        assert!(is_using_dot(&trees["t"]));
    }
}
