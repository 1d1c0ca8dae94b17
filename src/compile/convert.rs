//! Per-node translation of annotated trees into `syn` statements.
//!
//! The converter replays a simplified tree against its scope-typed state,
//! appending statements through a stack of emission scopes. Each scope
//! records the identifier currently bound to the dot and collects the
//! statements of one block.

use quote::format_ident;
use syn::parse_quote;

use crate::config::DataConfiguration;
use crate::error::CompileError;
use crate::funcs::PublicIdent;
use crate::parse::node::{
    ActionNode, Arg, BranchNode, Command, ListNode, Node, TemplateNode, TextNode, Tree,
    Variable,
};
use crate::reflect::{FnSig, Kind, Ty, TypeBody};
use crate::simplify::{self, State};

use super::program::CompiledTemplatesProgram;

/// The emission scope stack: current dot binding plus statement sink.
pub(crate) struct Scopes {
    stack: Vec<EmitScope>,
}

struct EmitScope {
    dot: String,
    stmts: Vec<syn::Stmt>,
}

impl Scopes {
    fn new() -> Scopes {
        Scopes { stack: Vec::new() }
    }

    pub(crate) fn enter(&mut self, dot: impl Into<String>) {
        self.stack.push(EmitScope {
            dot: dot.into(),
            stmts: Vec::new(),
        });
    }

    pub(crate) fn leave(&mut self) -> Vec<syn::Stmt> {
        self.stack.pop().expect("emission scope underflow").stmts
    }

    pub(crate) fn dot(&self) -> String {
        self.stack.last().expect("emission scope").dot.clone()
    }

    pub(crate) fn push(&mut self, stmt: syn::Stmt) {
        self.stack.last_mut().expect("emission scope").stmts.push(stmt);
    }
}

pub(crate) struct Converter<'p> {
    pub(crate) template: String,
    pub(crate) state: State,
    pub(crate) scopes: Scopes,
    pub(crate) program: &'p mut CompiledTemplatesProgram,
    pub(crate) public_idents: &'p [PublicIdent],
    pub(crate) html_mode: bool,
    err_vars: i64,
    iter_vars: i64,
    /// One-shot flag the call specializer sets when the rewritten call
    /// already writes to `w`, so the print wrap is skipped.
    pub(crate) skip_print: bool,
    pub(crate) used_t: bool,
    pub(crate) used_w: bool,
}

/// Converts one annotated tree into its compiled function.
pub(crate) fn convert_tpl_tree(
    fn_name: &str,
    tree: &Tree,
    data_cfg: Option<&DataConfiguration>,
    state: State,
    public_idents: &[PublicIdent],
    html_mode: bool,
    program: &mut CompiledTemplatesProgram,
) -> Result<syn::ItemFn, CompileError> {
    let mut conv = Converter {
        template: tree.name.clone(),
        state,
        scopes: Scopes::new(),
        program,
        public_idents,
        html_mode,
        err_vars: -1,
        iter_vars: -1,
        skip_print: false,
        used_t: false,
        used_w: false,
    };

    conv.scopes.enter("data");
    let uses_dot = simplify::is_using_dot(tree);
    if uses_dot {
        let cfg = data_cfg.ok_or_else(|| CompileError::MissingData {
            template: tree.name.clone(),
        })?;
        let prelude = conv.make_prelude(cfg)?;
        conv.scopes.push(prelude);
    }
    conv.convert_list(&tree.root)?;
    let mut stmts = conv.scopes.leave();
    stmts.push(syn::Stmt::Expr(parse_quote!(Ok(())), None));

    let templater_alias = conv.program.add_import("tplc::registry::Templater");
    let render_error_alias = conv.program.add_import("tplc::registry::RenderError");
    let write_alias = conv.program.add_import("std::io::Write");
    let any_alias = conv.program.add_import("std::any::Any");

    let fn_ident = format_ident!("{}", fn_name);
    let t_ident = format_ident!("{}", if conv.used_t { "t" } else { "_t" });
    let w_ident = format_ident!("{}", if conv.used_w { "w" } else { "_w" });
    let indata_ident = format_ident!("{}", if uses_dot { "indata" } else { "_indata" });
    let templater_ident = format_ident!("{}", templater_alias);
    let render_error_ident = format_ident!("{}", render_error_alias);
    let write_ident = format_ident!("{}", write_alias);
    let any_ident = format_ident!("{}", any_alias);

    Ok(parse_quote! {
        fn #fn_ident(
            #t_ident: &dyn #templater_ident,
            #w_ident: &mut dyn #write_ident,
            #indata_ident: &dyn #any_ident,
        ) -> Result<(), #render_error_ident> {
            #(#stmts)*
        }
    })
}

impl Converter<'_> {
    pub(crate) fn emission(&self, node: &'static str, detail: impl Into<String>) -> CompileError {
        CompileError::emission(self.template.clone(), node, detail)
    }

    /// `err`, `err1`, `err2`, ...
    fn fresh_error_name(&mut self) -> String {
        self.err_vars += 1;
        if self.err_vars == 0 {
            "err".to_string()
        } else {
            format!("err{}", self.err_vars)
        }
    }

    /// `iterable`, `iterable1`, ...
    fn fresh_iterator_name(&mut self) -> String {
        self.iter_vars += 1;
        if self.iter_vars == 0 {
            "iterable".to_string()
        } else {
            format!("iterable{}", self.iter_vars)
        }
    }

    /// Renders a type for emitted bindings, registering imports on the way.
    pub(crate) fn render_ty(&mut self, ty: &Ty) -> Result<syn::Type, CompileError> {
        let state = &self.state;
        let program = &mut *self.program;
        let rendered = state.env().render(ty, &mut |m| program.add_import(m));
        syn::parse_str(&rendered).map_err(|e| {
            CompileError::emission(
                self.template.clone(),
                "type",
                format!("rendered type {rendered:?} does not parse: {e}"),
            )
        })
    }

    fn render_fn_type(&mut self, sig: &FnSig) -> Result<syn::Type, CompileError> {
        let state = &self.state;
        let program = &mut *self.program;
        let rendered = state.env().render_fn_type(sig, &mut |m| program.add_import(m));
        syn::parse_str(&rendered).map_err(|e| {
            CompileError::emission(
                self.template.clone(),
                "command",
                format!("rendered helper type {rendered:?} does not parse: {e}"),
            )
        })
    }

    pub(crate) fn kind_of(&self, ty: &Ty) -> Kind {
        self.state.env().kind(ty)
    }

    fn make_prelude(&mut self, cfg: &DataConfiguration) -> Result<syn::Stmt, CompileError> {
        let ty = self.render_ty(&cfg.ty)?;
        Ok(parse_quote! {
            let data: #ty = match indata.downcast_ref::<#ty>() {
                Some(d) => d.clone(),
                None => Default::default(),
            };
        })
    }

    fn convert_list(&mut self, list: &ListNode) -> Result<(), CompileError> {
        for node in &list.nodes {
            self.convert_node(node)?;
        }
        Ok(())
    }

    fn convert_node(&mut self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Text(text) => self.convert_text(text),
            Node::Action(action) => self.convert_action(action),
            Node::If(branch) => self.convert_if(branch),
            Node::With(branch) => self.convert_with(branch),
            Node::Range(branch) => self.convert_range(branch),
            Node::Template(tpl) => self.convert_template(tpl),
        }
    }

    fn convert_text(&mut self, text: &TextNode) -> Result<(), CompileError> {
        if text.text.is_empty() {
            return Ok(());
        }
        let name = self.program.intern_literal(&text.text);
        let ident = format_ident!("{}", name);
        self.push_write_check(parse_quote!(w.write_all(#ident)));
        Ok(())
    }

    fn only_cmd<'a>(
        &self,
        pipe: &'a crate::parse::node::Pipe,
        node: &'static str,
    ) -> Result<&'a Command, CompileError> {
        pipe.only_cmd()
            .ok_or_else(|| self.emission(node, "pipeline was not reduced to a single command"))
    }

    fn convert_action(&mut self, action: &ActionNode) -> Result<(), CompileError> {
        let pipe = &action.pipe;
        let cmd = self.only_cmd(pipe, "action")?;
        match pipe.decl.len() {
            0 => self.convert_print(cmd),
            1 => self.convert_decl(&pipe.decl[0], cmd),
            _ => self.convert_multi_decl(&pipe.decl, cmd),
        }
    }

    fn convert_print(&mut self, cmd: &Command) -> Result<(), CompileError> {
        let (ty, _) = self.state.type_of_cmd(cmd, &self.template)?;

        if cmd.args.len() > 1 {
            if let Some(spec) = self.specialize_command(cmd, true)? {
                if self.skip_print {
                    self.skip_print = false;
                    self.push_write_check(spec.expr);
                    return Ok(());
                }
                return self.finish_print(spec.expr, &spec.ty);
            }
        }
        let expr = self.command_value_expr(cmd)?;
        self.finish_print(expr, &ty)
    }

    fn finish_print(&mut self, expr: syn::Expr, ty: &Ty) -> Result<(), CompileError> {
        if self.html_mode && matches!(self.kind_of(ty).strip_ref(), Kind::Str) {
            let escape = format_ident!("{}", self.program.add_import("tplc::escape"));
            self.push_write_check(parse_quote!(#escape::html_escape(w, #expr.as_bytes())));
            return Ok(());
        }
        self.make_io_write(expr, ty)
    }

    fn make_io_write(&mut self, expr: syn::Expr, ty: &Ty) -> Result<(), CompileError> {
        let kind = self.kind_of(ty);
        let call: syn::Expr = match kind.strip_ref() {
            Kind::Str => parse_quote!(w.write_all(#expr.as_bytes())),
            Kind::I8 | Kind::I16 | Kind::I32 => {
                parse_quote!(w.write_all(i64::from(#expr).to_string().as_bytes()))
            }
            Kind::I64 | Kind::Isize => {
                parse_quote!(w.write_all(#expr.to_string().as_bytes()))
            }
            Kind::U8 | Kind::U16 | Kind::U32 => {
                parse_quote!(w.write_all(u64::from(#expr).to_string().as_bytes()))
            }
            Kind::U64 | Kind::Usize => {
                parse_quote!(w.write_all(#expr.to_string().as_bytes()))
            }
            Kind::F32 | Kind::F64 => {
                parse_quote!(w.write_all(#expr.to_string().as_bytes()))
            }
            Kind::Bool => {
                parse_quote!(w.write_all((if #expr { "true" } else { "false" }).as_bytes()))
            }
            Kind::Slice(elem) if **elem == Kind::U8 => parse_quote!(w.write_all(&#expr)),
            Kind::Slice(_) | Kind::Array(_) | Kind::Struct | Kind::Opaque => {
                parse_quote!(write!(w, "{:?}", #expr))
            }
            other => {
                return Err(self.emission(
                    "print",
                    format!("no output conversion for value of kind {other:?}"),
                ));
            }
        };
        self.push_write_check(call);
        Ok(())
    }

    fn convert_decl(&mut self, decl: &Variable, cmd: &Command) -> Result<(), CompileError> {
        let (ty, extra) = self.state.type_of_cmd(cmd, &self.template)?;
        let name = format_ident!("{}", decl.name());

        if !extra.is_empty() {
            if extra != [Ty::Error] {
                return Err(self.emission(
                    "action",
                    "a call with extra results must end in exactly one error",
                ));
            }
            let expr = self.command_call_value(cmd)?;
            let err = format_ident!("{}", self.fresh_error_name());
            self.scopes.push(parse_quote! {
                let #name = match #expr {
                    Ok(v) => v,
                    Err(#err) => return Err(#err.into()),
                };
            });
            return Ok(());
        }

        let rhs = self.decl_rhs_expr(cmd)?;
        let ty_tokens = self.render_ty(&ty)?;
        self.scopes.push(parse_quote! {
            let #name: #ty_tokens = #rhs;
        });
        Ok(())
    }

    fn convert_multi_decl(
        &mut self,
        decls: &[Variable],
        cmd: &Command,
    ) -> Result<(), CompileError> {
        let expr = self.command_call_value(cmd)?;
        let names: Vec<syn::Ident> = decls
            .iter()
            .map(|d| format_ident!("{}", d.name()))
            .collect();
        self.scopes.push(parse_quote! {
            let (#(#names),*) = #expr;
        });
        Ok(())
    }

    fn convert_if(&mut self, branch: &BranchNode) -> Result<(), CompileError> {
        if !branch.pipe.decl.is_empty() {
            return Err(self.emission("if", "conditions cannot declare variables"));
        }
        let cmd = self.only_cmd(&branch.pipe, "if")?;
        let (ty, _) = self.state.type_of_cmd(cmd, &self.template)?;
        let test = self.command_value_expr(cmd)?;
        let cond = self.make_truth_test(test, &ty, "if")?;

        self.scopes.enter(self.scopes.dot());
        self.convert_list(&branch.list)?;
        let body = self.scopes.leave();

        let stmt: syn::Stmt = match &branch.else_list {
            Some(else_list) => {
                self.scopes.enter(self.scopes.dot());
                self.convert_list(else_list)?;
                let else_body = self.scopes.leave();
                parse_quote! {
                    if #cond {
                        #(#body)*
                    } else {
                        #(#else_body)*
                    }
                }
            }
            None => parse_quote! {
                if #cond {
                    #(#body)*
                }
            },
        };
        self.scopes.push(stmt);
        Ok(())
    }

    fn convert_with(&mut self, branch: &BranchNode) -> Result<(), CompileError> {
        let cmd = self.only_cmd(&branch.pipe, "with")?;

        let (dot_name, init, cond) = if branch.pipe.decl.is_empty() {
            let Arg::Variable(var) = cmd.head() else {
                return Err(self.emission("with", "subject was not reduced to a variable"));
            };
            if !var.path().is_empty() {
                return Err(self.emission("with", "subject was not reduced to a variable"));
            }
            let (ty, _) = self.state.type_of_cmd(cmd, &self.template)?;
            let name = var.name().to_string();
            let ident = format_ident!("{}", name);
            let cond = self.make_truth_test(parse_quote!(#ident), &ty, "with")?;
            (name, None, cond)
        } else {
            let (ty, extra) = self.state.type_of_cmd(cmd, &self.template)?;
            if !extra.is_empty() {
                return Err(self.emission("with", "subject cannot produce extra results"));
            }
            let name = branch.pipe.decl[0].name().to_string();
            let ident = format_ident!("{}", name);
            let rhs = self.decl_rhs_expr(cmd)?;
            let ty_tokens = self.render_ty(&ty)?;
            let init: syn::Stmt = parse_quote! {
                let #ident: #ty_tokens = #rhs;
            };
            let cond = self.make_truth_test(parse_quote!(#ident), &ty, "with")?;
            (name, Some(init), cond)
        };

        self.state.enter();
        self.scopes.enter(dot_name);
        self.convert_list(&branch.list)?;
        let body = self.scopes.leave();
        self.state.leave();

        let else_body = match &branch.else_list {
            Some(else_list) => {
                self.state.enter();
                self.scopes.enter(self.scopes.dot());
                self.convert_list(else_list)?;
                let stmts = self.scopes.leave();
                self.state.leave();
                Some(stmts)
            }
            None => None,
        };

        let if_stmt: syn::Stmt = match else_body {
            Some(else_body) => parse_quote! {
                if #cond {
                    #(#body)*
                } else {
                    #(#else_body)*
                }
            },
            None => parse_quote! {
                if #cond {
                    #(#body)*
                }
            },
        };
        // The extra block scopes the binding introduced by a declaration
        // and mirrors the interpreter's with-scope.
        let stmt: syn::Stmt = match init {
            Some(init) => parse_quote! {
                {
                    #init
                    #if_stmt
                }
            },
            None => parse_quote! {
                {
                    #if_stmt
                }
            },
        };
        self.scopes.push(stmt);
        Ok(())
    }

    fn convert_range(&mut self, branch: &BranchNode) -> Result<(), CompileError> {
        let cmd = self.only_cmd(&branch.pipe, "range")?;
        let Arg::Variable(subject) = cmd.head() else {
            return Err(self.emission("range", "subject was not reduced to a variable"));
        };
        if !subject.path().is_empty() {
            return Err(self.emission("range", "subject was not reduced to a variable"));
        }
        let (subject_ty, _) = self.state.type_of_cmd(cmd, &self.template)?;
        let subject_ident = format_ident!("{}", subject.name());

        let mut peeled = &subject_ty;
        while let Ty::Ref(inner) = peeled {
            peeled = inner;
        }
        let over_map = matches!(peeled, Ty::Map(_, _));
        if !over_map && !matches!(peeled, Ty::Slice(_) | Ty::Array(_, _)) {
            return Err(self.emission(
                "range",
                format!("cannot range over value of kind {:?}", self.kind_of(peeled)),
            ));
        }

        let (key_name, value_name) = match branch.pipe.decl.as_slice() {
            [] => (None, self.fresh_iterator_name()),
            [value] => (None, value.name().to_string()),
            [key, value] => (Some(key.name().to_string()), value.name().to_string()),
            more => {
                return Err(
                    self.emission("range", format!("declares {} variables", more.len()))
                );
            }
        };
        let value_ident = format_ident!("{}", value_name);

        self.state.enter();
        self.scopes.enter(value_name.clone());
        self.convert_list(&branch.list)?;
        let body = self.scopes.leave();
        self.state.leave();

        let loop_stmt: syn::Stmt = match (&key_name, over_map) {
            (None, false) => parse_quote! {
                for #value_ident in #subject_ident.clone() {
                    #(#body)*
                }
            },
            (None, true) => parse_quote! {
                for (_, #value_ident) in #subject_ident.clone() {
                    #(#body)*
                }
            },
            (Some(key), false) => {
                let key_ident = format_ident!("{}", key);
                parse_quote! {
                    for (#key_ident, #value_ident) in #subject_ident.clone().into_iter().enumerate() {
                        #(#body)*
                    }
                }
            }
            (Some(key), true) => {
                let key_ident = format_ident!("{}", key);
                parse_quote! {
                    for (#key_ident, #value_ident) in #subject_ident.clone() {
                        #(#body)*
                    }
                }
            }
        };
        self.scopes.push(loop_stmt);

        if let Some(else_list) = &branch.else_list {
            self.state.enter();
            self.scopes.enter(self.scopes.dot());
            self.convert_list(else_list)?;
            let else_body = self.scopes.leave();
            self.state.leave();
            self.scopes.push(parse_quote! {
                if #subject_ident.is_empty() {
                    #(#else_body)*
                }
            });
        }
        Ok(())
    }

    fn convert_template(&mut self, tpl: &TemplateNode) -> Result<(), CompileError> {
        self.used_t = true;
        self.used_w = true;
        let name = &tpl.name;
        let arg: syn::Expr = match &tpl.pipe {
            None => parse_quote!(&()),
            Some(pipe) => {
                let cmd = self.only_cmd(pipe, "template")?;
                if matches!(cmd.head(), Arg::Nil) {
                    parse_quote!(&())
                } else {
                    let value = self.template_arg_expr(cmd)?;
                    parse_quote!(&#value)
                }
            }
        };
        let err = format_ident!("{}", self.fresh_error_name());
        self.scopes.push(parse_quote! {
            if let Err(#err) = t.execute_template(w, #name, #arg) {
                return Err(#err);
            }
        });
        Ok(())
    }

    /// The argument of a template invocation, translated inline.
    fn template_arg_expr(&mut self, cmd: &Command) -> Result<syn::Expr, CompileError> {
        if cmd.args.len() == 1 {
            match cmd.head() {
                Arg::Number(n) => {
                    let lit: syn::Expr = syn::parse_str(&n.text).map_err(|e| {
                        self.emission("template", format!("bad number literal: {e}"))
                    })?;
                    let ty: syn::Type = if n.is_float {
                        parse_quote!(f64)
                    } else {
                        parse_quote!(isize)
                    };
                    return Ok(parse_quote!((#lit as #ty)));
                }
                Arg::Str(_) | Arg::Bool(_) => return self.arg_value_expr(cmd.head()),
                _ => return self.arg_plain_expr(cmd.head()),
            }
        }
        if let Some(spec) = self.specialize_command(cmd, false)? {
            return Ok(spec.expr);
        }
        self.command_call_value(cmd)
    }

    /// A command in value position with no call involved falls back to the
    /// plain expression; calls route through the generic call builder.
    fn command_value_expr(&mut self, cmd: &Command) -> Result<syn::Expr, CompileError> {
        if cmd.args.len() == 1 && !matches!(cmd.head(), Arg::Ident(_)) {
            self.arg_plain_expr(cmd.head())
        } else {
            self.command_call_value(cmd)
        }
    }

    /// The right-hand side of a typed declaration: field, variable and dot
    /// sources are cloned, literals converted, calls taken as-is.
    fn decl_rhs_expr(&mut self, cmd: &Command) -> Result<syn::Expr, CompileError> {
        if cmd.args.len() == 1 {
            match cmd.head() {
                Arg::Field(_) | Arg::Variable(_) | Arg::Dot => {
                    let (expr, is_method) = self.place_expr(cmd.head())?;
                    return Ok(if is_method {
                        expr
                    } else {
                        parse_quote!(#expr.clone())
                    });
                }
                Arg::Ident(_) => return self.command_call_value(cmd),
                _ => return self.arg_value_expr(cmd.head()),
            }
        }
        if let Some(spec) = self.specialize_command(cmd, false)? {
            return Ok(spec.expr);
        }
        self.command_call_value(cmd)
    }

    /// Builds the call for a multi-argument (or identifier-headed) command
    /// without consulting the specializer.
    fn command_call_value(&mut self, cmd: &Command) -> Result<syn::Expr, CompileError> {
        match cmd.head() {
            Arg::Ident(name) => {
                let name = name.clone();
                self.ident_call_expr(&name, &cmd.args[1..])
            }
            Arg::Field(path) => {
                let path = path.clone();
                let dot = self.state.dot().ok_or_else(|| CompileError::MissingData {
                    template: self.template.clone(),
                })?;
                self.method_call_expr(&self.scopes.dot(), &path, &dot, &cmd.args[1..])
            }
            Arg::Variable(var) => {
                let var = var.clone();
                let base =
                    self.state
                        .get_var(var.name())
                        .ok_or_else(|| {
                            self.emission(
                                "command",
                                format!("undefined variable ${}", var.name()),
                            )
                        })?;
                if var.path().is_empty() {
                    return Err(self.emission("command", "a variable is not callable"));
                }
                self.method_call_expr(&var.name().to_string(), var.path(), &base, &cmd.args[1..])
            }
            other => Err(self.emission(
                "command",
                format!("head expression {other:?} is not callable"),
            )),
        }
    }

    fn method_call_expr(
        &mut self,
        root: &str,
        path: &[String],
        root_ty: &Ty,
        args: &[Arg],
    ) -> Result<syn::Expr, CompileError> {
        if !self.state.env().is_method_path(path, root_ty) {
            return Err(self.emission(
                "command",
                format!("path {} does not end in a method", path.join(".")),
            ));
        }
        let (last, init) = path.split_last().expect("non-empty method path");
        let mut recv = root.to_string();
        for seg in init {
            recv.push('.');
            recv.push_str(seg);
        }
        let recv_expr: syn::Expr = syn::parse_str(&recv)
            .map_err(|e| self.emission("command", format!("bad receiver path: {e}")))?;
        let method = format_ident!("{}", last);
        let mut arg_exprs = Vec::with_capacity(args.len());
        for arg in args {
            arg_exprs.push(self.arg_value_expr(arg)?);
        }
        Ok(parse_quote!(#recv_expr.#method(#(#arg_exprs),*)))
    }

    fn ident_call_expr(&mut self, name: &str, args: &[Arg]) -> Result<syn::Expr, CompileError> {
        let mut arg_exprs = Vec::with_capacity(args.len());
        for arg in args {
            arg_exprs.push(self.arg_value_expr(arg)?);
        }

        if let Some(public) = self.public_idents.iter().find(|p| p.func_name == name) {
            let public = public.clone();
            let alias = self.program.add_import(&public.pkg_path);
            let base = public.pkg_path.rsplit("::").next().unwrap_or(&public.pkg_path);
            let selector = public
                .selector
                .replacen(&format!("{base}::"), &format!("{alias}::"), 1);
            let target: syn::Expr = syn::parse_str(&selector).map_err(|e| {
                self.emission("command", format!("bad public selector {selector:?}: {e}"))
            })?;
            return Ok(parse_quote!(#target(#(#arg_exprs),*)));
        }

        let sig = self
            .state
            .funcs()
            .get(name)
            .cloned()
            .ok_or_else(|| CompileError::UnknownHelper {
                template: self.template.clone(),
                name: name.to_string(),
            })?;
        self.check_exported(name, &sig)?;

        let fixed = if sig.variadic {
            sig.ins.len() - 1
        } else {
            sig.ins.len()
        };
        if arg_exprs.len() < fixed || (!sig.variadic && arg_exprs.len() != fixed) {
            return Err(self.emission(
                "command",
                format!(
                    "helper {name:?} takes {} arguments, got {}",
                    sig.ins.len(),
                    arg_exprs.len()
                ),
            ));
        }
        let mut call_args: Vec<syn::Expr> = arg_exprs.drain(..fixed).collect();
        if sig.variadic {
            let rest = arg_exprs;
            call_args.push(parse_quote!(vec![#(#rest),*]));
        }

        let fn_ty = self.render_fn_type(&sig)?;
        let expect_msg = format!("helper {name} has an unexpected signature");
        self.used_t = true;
        Ok(parse_quote! {
            (t.get_funcs()[#name]
                .downcast_ref::<#fn_ty>()
                .expect(#expect_msg))(#(#call_args),*)
        })
    }

    /// Dynamic dispatch re-types a helper at the call site; every struct
    /// (or reference-to-struct) it mentions must be publicly visible.
    fn check_exported(&self, name: &str, sig: &FnSig) -> Result<(), CompileError> {
        for ty in sig.ins.iter().chain(sig.outs.iter()) {
            let mut ty = ty;
            while let Ty::Ref(inner) = ty {
                ty = inner;
            }
            if let Ty::Named(q) = ty {
                if let Some(def) = self.state.env().get(q) {
                    let is_struct = matches!(def.body, TypeBody::Struct { .. });
                    if is_struct && !def.public {
                        return Err(CompileError::UnexportedHelperType {
                            helper: name.to_string(),
                            ty: q.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// A place expression for a field/variable/dot path; the flag reports
    /// whether the trailing segment is a method call.
    fn place_expr(&mut self, arg: &Arg) -> Result<(syn::Expr, bool), CompileError> {
        match arg {
            Arg::Dot => {
                let dot = self.scopes.dot();
                let ident = format_ident!("{}", dot);
                Ok((parse_quote!(#ident), false))
            }
            Arg::Field(path) => {
                let dot_ty = self.state.dot().ok_or_else(|| CompileError::MissingData {
                    template: self.template.clone(),
                })?;
                self.path_place(&self.scopes.dot(), path, &dot_ty)
            }
            Arg::Variable(var) => {
                if var.path().is_empty() {
                    let ident = format_ident!("{}", var.name());
                    return Ok((parse_quote!(#ident), false));
                }
                let base = self.state.get_var(var.name()).ok_or_else(|| {
                    self.emission("command", format!("undefined variable ${}", var.name()))
                })?;
                self.path_place(&var.name().to_string(), var.path(), &base)
            }
            other => Err(self.emission(
                "command",
                format!("expression {other:?} is not a place"),
            )),
        }
    }

    fn path_place(
        &mut self,
        root: &str,
        path: &[String],
        root_ty: &Ty,
    ) -> Result<(syn::Expr, bool), CompileError> {
        let is_method = self.state.env().is_method_path(path, root_ty);
        let mut code = root.to_string();
        for seg in path {
            code.push('.');
            code.push_str(seg);
        }
        if is_method {
            code.push_str("()");
        }
        let expr: syn::Expr = syn::parse_str(&code)
            .map_err(|e| self.emission("command", format!("bad path expression: {e}")))?;
        Ok((expr, is_method))
    }

    /// An argument in owning position: paths cloned, string literals
    /// converted to owned values.
    pub(crate) fn arg_value_expr(&mut self, arg: &Arg) -> Result<syn::Expr, CompileError> {
        match arg {
            Arg::Field(_) | Arg::Variable(_) | Arg::Dot => {
                let (expr, is_method) = self.place_expr(arg)?;
                Ok(if is_method {
                    expr
                } else {
                    parse_quote!(#expr.clone())
                })
            }
            Arg::Str(s) => Ok(parse_quote!(#s.to_string())),
            Arg::Number(n) => syn::parse_str(&n.text)
                .map_err(|e| self.emission("command", format!("bad number literal: {e}"))),
            Arg::Bool(b) => Ok(parse_quote!(#b)),
            other => Err(self.emission(
                "command",
                format!("expression {other:?} cannot be an argument"),
            )),
        }
    }

    /// An argument in borrowing position: no clones, bare string literals.
    pub(crate) fn arg_plain_expr(&mut self, arg: &Arg) -> Result<syn::Expr, CompileError> {
        match arg {
            Arg::Field(_) | Arg::Variable(_) | Arg::Dot => {
                Ok(self.place_expr(arg)?.0)
            }
            Arg::Str(s) => Ok(parse_quote!(#s)),
            Arg::Number(n) => syn::parse_str(&n.text)
                .map_err(|e| self.emission("command", format!("bad number literal: {e}"))),
            Arg::Bool(b) => Ok(parse_quote!(#b)),
            other => Err(self.emission(
                "command",
                format!("expression {other:?} cannot be an argument"),
            )),
        }
    }

    /// The truth test of a conditional, by kind.
    pub(crate) fn make_truth_test(
        &mut self,
        expr: syn::Expr,
        ty: &Ty,
        node: &'static str,
    ) -> Result<syn::Expr, CompileError> {
        let kind = self.kind_of(ty);
        Ok(match kind.strip_ref() {
            Kind::Bool => expr,
            // A struct value is always truthy, matching the interpreter.
            Kind::Struct => parse_quote!(true),
            Kind::Str => parse_quote!(!#expr.is_empty()),
            k if k.is_float() => parse_quote!(#expr != 0.0),
            k if k.is_numeric() => parse_quote!(#expr != 0),
            Kind::Slice(_) | Kind::Array(_) | Kind::Map => parse_quote!(!#expr.is_empty()),
            other => {
                return Err(self.emission(
                    node,
                    format!("no truth test for value of kind {other:?}"),
                ));
            }
        })
    }

    /// Appends a write call wrapped in its error check.
    fn push_write_check(&mut self, call: syn::Expr) {
        self.used_w = true;
        let err = format_ident!("{}", self.fresh_error_name());
        self.scopes.push(parse_quote! {
            if let Err(#err) = #call {
                return Err(#err.into());
            }
        });
    }
}
