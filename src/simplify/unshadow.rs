//! Variable hygiene passes.
//!
//! `unshadow` renames any declaration that would shadow or redeclare a
//! visible variable (`$v` becomes `$v_shadow`, `$v_shadow0`, ...), so every
//! name is declared exactly once per scope region. `rename` then prefixes
//! every user variable with `tpl_`, keeping user names clear of the
//! temporaries, iterators and error names the compiler allocates later.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::parse::node::{Arg, BranchNode, ListNode, Node, Pipe, Tree, Variable};

/// Scoped rename table: original name → active replacement.
struct Renamer {
    scopes: Vec<FxHashMap<String, String>>,
    taken: FxHashSet<String>,
}

impl Renamer {
    fn new() -> Self {
        Renamer {
            scopes: vec![FxHashMap::default()],
            taken: FxHashSet::default(),
        }
    }

    fn push(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    fn pop(&mut self) {
        self.scopes.pop();
    }

    fn lookup(&self, name: &str) -> Option<&String> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    /// Registers a declaration, yielding the (possibly suffixed) name.
    fn declare(&mut self, name: &str) -> String {
        let fresh = if !self.taken.contains(name) {
            name.to_string()
        } else {
            let base = format!("{name}_shadow");
            if !self.taken.contains(&base) {
                base
            } else {
                let mut n = 0usize;
                loop {
                    let candidate = format!("{base}{n}");
                    if !self.taken.contains(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        self.taken.insert(fresh.clone());
        self.scopes
            .last_mut()
            .unwrap()
            .insert(name.to_string(), fresh.clone());
        fresh
    }
}

/// Renames shadowing declarations so names are unique along every path.
pub fn unshadow(mut tree: Tree) -> Tree {
    let mut renamer = Renamer::new();
    unshadow_list(&mut tree.root, &mut renamer);
    tree
}

fn unshadow_list(list: &mut ListNode, r: &mut Renamer) {
    for node in &mut list.nodes {
        match node {
            Node::Text(_) => {}
            Node::Action(action) => unshadow_pipe(&mut action.pipe, r),
            Node::If(branch) => {
                unshadow_pipe(&mut branch.pipe, r);
                unshadow_list(&mut branch.list, r);
                if let Some(else_list) = &mut branch.else_list {
                    unshadow_list(else_list, r);
                }
            }
            Node::With(branch) | Node::Range(branch) => unshadow_branch(branch, r),
            Node::Template(tpl) => {
                if let Some(pipe) = &mut tpl.pipe {
                    unshadow_uses(pipe, r);
                }
            }
        }
    }
}

fn unshadow_branch(branch: &mut BranchNode, r: &mut Renamer) {
    // The subject is evaluated in the enclosing scope; declarations bind
    // inside the body.
    unshadow_uses(&mut branch.pipe, r);
    r.push();
    for var in &mut branch.pipe.decl {
        var.ident[0] = format!("${}", r.declare(var.name()));
    }
    unshadow_list(&mut branch.list, r);
    r.pop();
    if let Some(else_list) = &mut branch.else_list {
        r.push();
        unshadow_list(else_list, r);
        r.pop();
    }
}

fn unshadow_pipe(pipe: &mut Pipe, r: &mut Renamer) {
    unshadow_uses(pipe, r);
    for var in &mut pipe.decl {
        var.ident[0] = format!("${}", r.declare(var.name()));
    }
}

/// Rewrites variable references (not declarations) through the table.
fn unshadow_uses(pipe: &mut Pipe, r: &mut Renamer) {
    for cmd in &mut pipe.cmds {
        for arg in &mut cmd.args {
            rewrite_arg(arg, r);
        }
    }
}

fn rewrite_arg(arg: &mut Arg, r: &mut Renamer) {
    match arg {
        Arg::Variable(var) => rewrite_var(var, r),
        Arg::Pipe(pipe) => {
            unshadow_uses(pipe, r);
        }
        _ => {}
    }
}

fn rewrite_var(var: &mut Variable, r: &mut Renamer) {
    if let Some(active) = r.lookup(var.name()) {
        var.ident[0] = format!("${active}");
    }
}

/// Prefixes every user variable with `tpl_`, snake-cased.
pub fn rename_vars(mut tree: Tree) -> Tree {
    rename_list(&mut tree.root);
    tree
}

fn rename_list(list: &mut ListNode) {
    for node in &mut list.nodes {
        match node {
            Node::Text(_) => {}
            Node::Action(action) => rename_pipe(&mut action.pipe),
            Node::If(branch) | Node::With(branch) | Node::Range(branch) => {
                rename_pipe(&mut branch.pipe);
                rename_list(&mut branch.list);
                if let Some(else_list) = &mut branch.else_list {
                    rename_list(else_list);
                }
            }
            Node::Template(tpl) => {
                if let Some(pipe) = &mut tpl.pipe {
                    rename_pipe(pipe);
                }
            }
        }
    }
}

fn rename_pipe(pipe: &mut Pipe) {
    for var in &mut pipe.decl {
        var.ident[0] = format!("${}", user_var_name(var.name()));
    }
    for cmd in &mut pipe.cmds {
        for arg in &mut cmd.args {
            match arg {
                Arg::Variable(var) => {
                    var.ident[0] = format!("${}", user_var_name(var.name()));
                }
                Arg::Pipe(pipe) => rename_pipe(pipe),
                _ => {}
            }
        }
    }
}

/// `y` → `tpl_y`, `someVar` → `tpl_some_var`.
pub fn user_var_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    out.push_str("tpl_");
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn decl_names(tree: &Tree) -> Vec<String> {
        fn walk(list: &ListNode, out: &mut Vec<String>) {
            for node in &list.nodes {
                match node {
                    Node::Action(a) => {
                        for v in &a.pipe.decl {
                            out.push(v.name().to_string());
                        }
                    }
                    Node::If(b) | Node::With(b) | Node::Range(b) => {
                        for v in &b.pipe.decl {
                            out.push(v.name().to_string());
                        }
                        walk(&b.list, out);
                        if let Some(e) = &b.else_list {
                            walk(e, out);
                        }
                    }
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&tree.root, &mut out);
        out
    }

    #[test]
    fn test_nested_shadowing_renamed() {
        let trees = parse::parse(
            "t",
            "{{range $i, $v := .list}}{{range $i, $v := .list}}{{end}}{{end}}",
        )
        .unwrap();
        let tree = unshadow(trees["t"].clone());
        assert_eq!(
            decl_names(&tree),
            vec!["i", "v", "i_shadow", "v_shadow"]
        );
    }

    #[test]
    fn test_shadowed_use_rewritten() {
        let trees = parse::parse(
            "t",
            "{{range $v := .list}}{{range $v := .list}}{{$v}}{{end}}{{end}}",
        )
        .unwrap();
        let tree = unshadow(trees["t"].clone());
        // The inner print must reference the renamed inner variable.
        let Node::Range(outer) = &tree.root.nodes[0] else {
            panic!("expected range");
        };
        let Node::Range(inner) = &outer.list.nodes[0] else {
            panic!("expected inner range");
        };
        let Node::Action(print) = &inner.list.nodes[0] else {
            panic!("expected action");
        };
        match &print.pipe.cmds[0].args[0] {
            Arg::Variable(v) => assert_eq!(v.name(), "v_shadow"),
            other => panic!("expected variable, got {other:?}"),
        }
    }

    #[test]
    fn test_sequential_redeclaration_renamed() {
        let trees = parse::parse("t", "{{$y := 1}}{{$y := 2}}").unwrap();
        let tree = unshadow(trees["t"].clone());
        assert_eq!(decl_names(&tree), vec!["y", "y_shadow"]);
    }

    #[test]
    fn test_rename_prefixes_user_vars() {
        let trees = parse::parse("t", "{{$someVar := 1}}{{$someVar}}").unwrap();
        let tree = rename_vars(trees["t"].clone());
        assert_eq!(decl_names(&tree), vec!["tpl_some_var"]);
        let Node::Action(print) = &tree.root.nodes[1] else {
            panic!("expected action");
        };
        match &print.pipe.cmds[0].args[0] {
            Arg::Variable(v) => assert_eq!(v.name(), "tpl_some_var"),
            other => panic!("expected variable, got {other:?}"),
        }
    }
}
