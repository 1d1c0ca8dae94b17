//! Pipeline lowering.
//!
//! Rewrites every pipe into a single command, hoisting intermediate
//! results into `$var<n>` temporaries:
//!
//! - `|`-chains become one declaration per stage, the piped value appended
//!   as the final argument of the next stage;
//! - parenthesized sub-pipelines in argument position hoist depth-first;
//! - print actions hoist their command unless it is a bare variable or the
//!   dot, so conversions always apply to a named local;
//! - `if` conditions hoist unless literal or variable; `with` and `range`
//!   subjects hoist unless variable;
//! - template-invocation arguments are translated inline and stay as they
//!   are.

use crate::parse::node::{
    ActionNode, Arg, BranchNode, ListNode, Node, Pipe, Tree, Variable,
};

pub fn lower(mut tree: Tree) -> Tree {
    let mut lowerer = Lowerer { counter: 0 };
    tree.root = lowerer.lower_list(std::mem::take(&mut tree.root));
    tree
}

struct Lowerer {
    counter: usize,
}

impl Lowerer {
    fn lower_list(&mut self, list: ListNode) -> ListNode {
        let mut out = Vec::with_capacity(list.nodes.len());
        for node in list.nodes {
            self.lower_node(node, &mut out);
        }
        ListNode { nodes: out }
    }

    fn lower_node(&mut self, node: Node, out: &mut Vec<Node>) {
        match node {
            Node::Text(text) => out.push(Node::Text(text)),

            Node::Action(action) => {
                let pos = action.pos;
                let decl = action.pipe.decl.clone();
                let cmd = self.lower_pipe(action.pipe, out);
                if decl.is_empty() {
                    // Print position: leave bare variables, the dot, and
                    // escaper calls (they write directly); hoist everything
                    // else into a temporary.
                    let keep = cmd.is_bare_var()
                        || cmd.is_dot()
                        || matches!(cmd.head(), Arg::Ident(name)
                            if crate::compile::calls::ESCAPERS.contains(&name.as_str()));
                    let cmd = if keep {
                        cmd
                    } else {
                        let var = self.hoist(cmd, pos, out);
                        bare_var_cmd(&var, pos)
                    };
                    out.push(Node::Action(ActionNode {
                        pipe: single_cmd_pipe(vec![], cmd, pos),
                        pos,
                    }));
                } else {
                    out.push(Node::Action(ActionNode {
                        pipe: single_cmd_pipe(decl, cmd, pos),
                        pos,
                    }));
                }
            }

            Node::If(branch) => {
                let lowered = self.lower_branch(branch, CondStyle::If, out);
                out.push(Node::If(lowered));
            }
            Node::With(branch) => {
                let lowered = self.lower_branch(branch, CondStyle::Subject, out);
                out.push(Node::With(lowered));
            }
            Node::Range(branch) => {
                let lowered = self.lower_branch(branch, CondStyle::Subject, out);
                out.push(Node::Range(lowered));
            }

            Node::Template(tpl) => out.push(Node::Template(tpl)),
        }
    }

    fn lower_branch(
        &mut self,
        branch: BranchNode,
        style: CondStyle,
        out: &mut Vec<Node>,
    ) -> BranchNode {
        let pos = branch.pos;
        let decl = branch.pipe.decl.clone();
        let cmd = self.lower_pipe(branch.pipe, out);

        let cmd = if !decl.is_empty() {
            // Declarations keep their right-hand side in place (`with $x :=
            // ...` initializes inside the conditional, `range` binds loop
            // variables).
            cmd
        } else {
            let keep = match style {
                CondStyle::If => cmd.is_bare_var() || cmd.is_literal(),
                CondStyle::Subject => cmd.is_bare_var(),
            };
            if keep {
                cmd
            } else {
                let var = self.hoist(cmd, pos, out);
                bare_var_cmd(&var, pos)
            }
        };

        BranchNode {
            pipe: single_cmd_pipe(decl, cmd, pos),
            list: self.lower_list(branch.list),
            else_list: branch.else_list.map(|l| self.lower_list(l)),
            pos,
        }
    }

    /// Reduces a pipe to one command, appending hoisted stages to `out`.
    fn lower_pipe(&mut self, pipe: Pipe, out: &mut Vec<Node>) -> crate::parse::node::Command {
        let pos = pipe.pos;
        let mut cmds = pipe.cmds;
        for cmd in &mut cmds {
            self.flatten_args(cmd, out);
        }
        let mut iter = cmds.into_iter();
        let mut current = iter.next().expect("parser rejects empty pipes");
        for mut next in iter {
            let var = self.hoist(current, pos, out);
            next.args.push(Arg::Variable(Variable::new(&format!("${var}"))));
            current = next;
        }
        current
    }

    /// Hoists parenthesized argument pipelines into temporaries.
    fn flatten_args(&mut self, cmd: &mut crate::parse::node::Command, out: &mut Vec<Node>) {
        let pos = cmd.pos;
        for arg in &mut cmd.args {
            if let Arg::Pipe(pipe) = arg {
                let inner = self.lower_pipe(std::mem::replace(pipe, empty_pipe(pos)), out);
                let var = self.hoist(inner, pos, out);
                *arg = Arg::Variable(Variable::new(&format!("${var}")));
            }
        }
    }

    /// Emits `$var<n> := <cmd>` and returns the temporary's name.
    fn hoist(
        &mut self,
        cmd: crate::parse::node::Command,
        pos: usize,
        out: &mut Vec<Node>,
    ) -> String {
        let name = format!("var{}", self.counter);
        self.counter += 1;
        out.push(Node::Action(ActionNode {
            pipe: single_cmd_pipe(
                vec![Variable::new(&format!("${name}"))],
                cmd,
                pos,
            ),
            pos,
        }));
        name
    }
}

enum CondStyle {
    /// `if` keeps literals in place.
    If,
    /// `with`/`range` subjects must end up variable-shaped.
    Subject,
}

fn single_cmd_pipe(
    decl: Vec<Variable>,
    cmd: crate::parse::node::Command,
    pos: usize,
) -> Pipe {
    Pipe {
        decl,
        cmds: vec![cmd],
        pos,
    }
}

fn bare_var_cmd(name: &str, pos: usize) -> crate::parse::node::Command {
    crate::parse::node::Command {
        args: vec![Arg::Variable(Variable::new(&format!("${name}")))],
        pos,
    }
}

fn empty_pipe(pos: usize) -> Pipe {
    Pipe {
        decl: vec![],
        cmds: vec![],
        pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use crate::parse::node::Command;

    fn lowered(src: &str) -> Tree {
        let trees = parse::parse("t", src).unwrap();
        lower(trees["t"].clone())
    }

    fn as_decl(node: &Node) -> (&str, &Command) {
        match node {
            Node::Action(a) if !a.pipe.decl.is_empty() => {
                (a.pipe.decl[0].name(), &a.pipe.cmds[0])
            }
            other => panic!("expected declaration, got {other:?}"),
        }
    }

    #[test]
    fn test_field_print_hoisted() {
        let tree = lowered("{{.some_int}}");
        assert_eq!(tree.root.nodes.len(), 2);
        let (name, cmd) = as_decl(&tree.root.nodes[0]);
        assert_eq!(name, "var0");
        assert_eq!(cmd.args, vec![Arg::Field(vec!["some_int".to_string()])]);
        match &tree.root.nodes[1] {
            Node::Action(a) => assert!(a.pipe.cmds[0].is_bare_var()),
            other => panic!("expected print, got {other:?}"),
        }
    }

    #[test]
    fn test_bare_var_print_untouched() {
        let tree = lowered("{{$y := 1}}{{$y}}");
        assert_eq!(tree.root.nodes.len(), 2);
    }

    #[test]
    fn test_dot_print_untouched() {
        let tree = lowered("{{.}}");
        assert_eq!(tree.root.nodes.len(), 1);
    }

    #[test]
    fn test_pipe_chain_split() {
        let tree = lowered("{{.x | up}}");
        // $var0 := .x ; $var1 := up $var0 ; print $var1
        assert_eq!(tree.root.nodes.len(), 3);
        let (name, cmd) = as_decl(&tree.root.nodes[1]);
        assert_eq!(name, "var1");
        assert_eq!(cmd.args.len(), 2);
        assert_eq!(cmd.args[0], Arg::Ident("up".to_string()));
        match &cmd.args[1] {
            Arg::Variable(v) => assert_eq!(v.name(), "var0"),
            other => panic!("expected variable, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_call_hoisted() {
        let tree = lowered("{{if ne 0 (len .items)}}x{{end}}");
        // $var0 := len .items ; $var1 := ne 0 $var0 ; if $var1
        let (name, cmd) = as_decl(&tree.root.nodes[0]);
        assert_eq!(name, "var0");
        assert_eq!(cmd.args[0], Arg::Ident("len".to_string()));
        let (name, _) = as_decl(&tree.root.nodes[1]);
        assert_eq!(name, "var1");
        match &tree.root.nodes[2] {
            Node::If(branch) => assert!(branch.pipe.cmds[0].is_bare_var()),
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn test_literal_if_kept_inline() {
        let tree = lowered("{{if true}}x{{end}}");
        assert_eq!(tree.root.nodes.len(), 1);
    }

    #[test]
    fn test_range_subject_hoisted() {
        let tree = lowered("{{range .items}}x{{end}}");
        let (name, _) = as_decl(&tree.root.nodes[0]);
        assert_eq!(name, "var0");
        match &tree.root.nodes[1] {
            Node::Range(branch) => assert!(branch.pipe.cmds[0].is_bare_var()),
            other => panic!("expected range, got {other:?}"),
        }
    }

    #[test]
    fn test_with_dot_hoisted() {
        let tree = lowered("{{with .}}x{{end}}");
        let (name, cmd) = as_decl(&tree.root.nodes[0]);
        assert_eq!(name, "var0");
        assert!(cmd.is_dot());
    }

    #[test]
    fn test_template_arg_untouched() {
        let tree = lowered(r#"{{template "rr" (up "rr")}}"#);
        assert_eq!(tree.root.nodes.len(), 1);
        match &tree.root.nodes[0] {
            Node::Template(t) => {
                let cmd = &t.pipe.as_ref().unwrap().cmds[0];
                assert_eq!(cmd.args[0], Arg::Ident("up".to_string()));
            }
            other => panic!("expected template, got {other:?}"),
        }
    }

    #[test]
    fn test_temporaries_inside_branch_body() {
        let tree = lowered("{{if .cond}}{{.inner}}{{end}}");
        // Outer hoist before the if, inner hoist inside the body.
        let (outer, _) = as_decl(&tree.root.nodes[0]);
        assert_eq!(outer, "var0");
        match &tree.root.nodes[1] {
            Node::If(branch) => {
                let (inner, _) = as_decl(&branch.list.nodes[0]);
                assert_eq!(inner, "var1");
            }
            other => panic!("expected if, got {other:?}"),
        }
    }
}
