//! The shared symbol environment and program assembler.
//!
//! One [`CompiledTemplatesProgram`] exists per compilation unit. It owns
//! the reserved identifier set, the alias-renamed import registry, the
//! content-deduplicated literal byte blocks, and the emitted functions,
//! and renders the final source file with `prettyplease`.

use proc_macro2::Span;
use quote::format_ident;
use syn::parse::Parser as _;

use crate::error::CompileError;

struct Import {
    path: String,
    alias: String,
    base: String,
}

struct Builtin {
    content: String,
    name: String,
}

/// An emitted template function and its registry name.
pub(crate) struct EmittedFn {
    pub registry_name: String,
    pub fn_name: String,
    pub item: syn::ItemFn,
}

/// A `(parent, child)` sub-template association, with the loop indices
/// isolating its init block.
pub(crate) struct Association {
    pub template_index: usize,
    pub sub_index: usize,
    pub parent: String,
    pub child: String,
}

pub(crate) struct CompiledTemplatesProgram {
    idents: Vec<String>,
    imports: Vec<Import>,
    builtins: Vec<Builtin>,
    funcs: Vec<EmittedFn>,
}

impl CompiledTemplatesProgram {
    pub fn new(registry_variable: &str) -> Self {
        let mut program = CompiledTemplatesProgram {
            idents: Vec::new(),
            imports: Vec::new(),
            builtins: Vec::new(),
            funcs: Vec::new(),
        };
        for name in ["t", "w", "indata", "data", "registry"] {
            program.reserve_ident(name);
        }
        program.reserve_ident(registry_variable);
        program
    }

    pub fn has_ident(&self, name: &str) -> bool {
        self.idents.iter().any(|i| i == name)
    }

    /// Reserves a name in the output. Double reservation is a bug in the
    /// emitter.
    pub fn reserve_ident(&mut self, name: &str) {
        debug_assert!(!self.has_ident(name), "identifier {name:?} reserved twice");
        self.idents.push(name.to_string());
    }

    /// Returns `base` if free, else `fn0<base>`, `fn1<base>`, ...; the
    /// result is reserved.
    pub fn fresh_function_name(&mut self, base: &str) -> String {
        let name = if !self.has_ident(base) {
            base.to_string()
        } else {
            let mut n = 0usize;
            loop {
                let candidate = format!("fn{n}{base}");
                if !self.has_ident(&candidate) {
                    break candidate;
                }
                n += 1;
            }
        };
        self.reserve_ident(&name);
        name
    }

    /// Idempotent import registration; returns the alias the path is
    /// usable under. Aliases colliding with reserved names are renamed
    /// `alias<base>`, `alias<base>1`, ...
    pub fn add_import(&mut self, path: &str) -> String {
        if let Some(import) = self.imports.iter().find(|i| i.path == path) {
            return import.alias.clone();
        }
        let base = path.rsplit("::").next().unwrap_or(path).to_string();
        let alias = if !self.has_ident(&base) {
            base.clone()
        } else {
            let candidate = format!("alias{base}");
            if !self.has_ident(&candidate) {
                candidate
            } else {
                let mut n = 1usize;
                loop {
                    let candidate = format!("alias{base}{n}");
                    if !self.has_ident(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        self.reserve_ident(&alias);
        self.imports.push(Import {
            path: path.to_string(),
            alias: alias.clone(),
            base,
        });
        alias
    }

    /// Interns a literal text block; identical contents share one name.
    pub fn intern_literal(&mut self, content: &str) -> String {
        if let Some(b) = self.builtins.iter().find(|b| b.content == content) {
            return b.name.clone();
        }
        let name = format!("BUILTIN{}", self.builtins.len());
        self.reserve_ident(&name);
        self.builtins.push(Builtin {
            content: content.to_string(),
            name: name.clone(),
        });
        name
    }

    pub fn push_func(&mut self, func: EmittedFn) {
        self.funcs.push(func);
    }

    pub(crate) fn funcs(&self) -> &[EmittedFn] {
        &self.funcs
    }

    /// Renders the final source: header, imports, literal blocks, the
    /// registry static with its init closure, then the functions.
    pub fn assemble(
        &mut self,
        module_name: &str,
        registry_variable: &str,
        funcs_provider: Option<&str>,
        associations: &[Association],
    ) -> Result<String, CompileError> {
        let registry_alias = self.add_import("tplc::registry::Registry");
        let lazy_alias = self.add_import("std::sync::LazyLock");

        let provider_call: Option<syn::Expr> = match funcs_provider {
            Some(path) => Some(self.provider_expr(path)?),
            None => None,
        };

        let mut items: Vec<syn::Item> = Vec::new();
        for import in &self.imports {
            let code = if import.alias == import.base {
                format!("use {};", import.path)
            } else {
                format!("use {} as {};", import.path, import.alias)
            };
            let item: syn::ItemUse = syn::parse_str(&code)
                .unwrap_or_else(|e| panic!("constructed import {code:?} must parse: {e}"));
            items.push(syn::Item::Use(item));
        }

        for builtin in &self.builtins {
            let ident = format_ident!("{}", builtin.name);
            let lit = syn::LitByteStr::new(builtin.content.as_bytes(), Span::call_site());
            items.push(syn::parse_quote! {
                static #ident: &[u8] = #lit;
            });
        }

        let registry_ident = format_ident!("{}", registry_alias);
        let lazy_ident = format_ident!("{}", lazy_alias);
        let var_ident = format_ident!("{}", registry_variable);

        let mut init_stmts: Vec<syn::Stmt> = Vec::new();
        let new_expr: syn::Expr = match provider_call {
            Some(call) => syn::parse_quote!(#registry_ident::new().with_funcs(#call)),
            None => syn::parse_quote!(#registry_ident::new()),
        };
        init_stmts.push(syn::parse_quote! {
            let mut registry = #new_expr;
        });
        for func in &self.funcs {
            let name = &func.registry_name;
            let fn_ident = format_ident!("{}", func.fn_name);
            init_stmts.push(syn::parse_quote! {
                registry.add(#name, #fn_ident);
            });
        }
        for assoc in associations {
            let x = format_ident!("tpl{}x{}", assoc.template_index, assoc.sub_index);
            let y = format_ident!("tpl{}y{}", assoc.template_index, assoc.sub_index);
            let parent = &assoc.parent;
            let child = &assoc.child;
            init_stmts.push(syn::parse_quote! {
                let mut #x = registry.must_get(#parent).clone();
            });
            init_stmts.push(syn::parse_quote! {
                let #y = registry.must_get(#child).clone();
            });
            init_stmts.push(syn::parse_quote! {
                #x = #x.compiled(#y);
            });
            init_stmts.push(syn::parse_quote! {
                registry.set(#parent, #x);
            });
        }

        items.push(syn::parse_quote! {
            pub static #var_ident: #lazy_ident<#registry_ident> = #lazy_ident::new(|| {
                #(#init_stmts)*
                registry
            });
        });

        for func in &self.funcs {
            items.push(syn::Item::Fn(func.item.clone()));
        }

        let doc = format!(" Compiled templates for `{module_name}`. DO NOT EDIT.");
        let header = format!(
            "#![doc = {doc:?}]\n\
             #![allow(clippy::all)]\n\
             #![allow(dead_code, unused_imports, unused_mut, unused_variables)]\n"
        );
        let attrs = syn::Attribute::parse_inner
            .parse_str(&header)
            .expect("constructed header attributes must parse");

        let file = syn::File {
            shebang: None,
            attrs,
            items,
        };
        Ok(prettyplease::unparse(&file))
    }

    fn provider_expr(&mut self, path: &str) -> Result<syn::Expr, CompileError> {
        let Some((module, func)) = path.rsplit_once("::") else {
            return Err(CompileError::BadDataSelector {
                template: String::new(),
                detail: format!("helper provider {path:?} is not a module-qualified path"),
            });
        };
        let alias = self.add_import(module);
        let code = format!("{alias}::{func}()");
        syn::parse_str(&code).map_err(|e| CompileError::BadDataSelector {
            template: String::new(),
            detail: format!("helper provider {path:?} does not form a call: {e}"),
        })
    }
}
