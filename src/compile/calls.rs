//! The call specializer.
//!
//! Rewrites calls to known helpers into optimized constructs instead of
//! the typed dynamic dispatch: direct escape-library calls (writing
//! straight to `w` in print position), native `len`/`index` expressions,
//! and comparison operators. Rules apply in order; a rule that does not
//! match declines and the generic call path takes over.
//!
//! Unlike the interpreting engine there is no reflective fallback for the
//! builtin names, so a builtin applied to an unsupported kind is a fatal
//! emission error rather than a decline.

use syn::parse_quote;

use crate::error::CompileError;
use crate::parse::node::{Arg, Command};
use crate::reflect::{Kind, Ty, TypeEnv};

use super::convert::Converter;

/// Escaper names handled by rule 1 (and kept inline in print position by
/// the simplifier for exactly that reason).
pub(crate) const ESCAPERS: [&str; 2] = ["html", "_html_template_htmlescaper"];

const COMPARISONS: [&str; 6] = ["eq", "ne", "lt", "le", "gt", "ge"];

/// A specialized rewrite: the expression and its result type. A rule that
/// already wrote to `w` additionally sets the converter's one-shot
/// skip-print flag.
pub(crate) struct Specialized {
    pub expr: syn::Expr,
    pub ty: Ty,
}

/// Result typing for the specializer-owned builtin names, used by the
/// typechecker. `None` means the name is not specializer-owned.
pub(crate) fn builtin_result_ty(
    name: &str,
    args: &[Ty],
    env: &TypeEnv,
) -> Option<Result<Ty, String>> {
    match name {
        "html" | "_html_template_htmlescaper" | "urlquery" => Some(if args.len() == 1 {
            Ok(Ty::Str)
        } else {
            Err(format!("helper {name:?} takes exactly one argument"))
        }),
        "len" => Some(if args.len() != 1 {
            Err("len takes exactly one argument".to_string())
        } else {
            match env.kind(&args[0]).strip_ref() {
                Kind::Str | Kind::Slice(_) | Kind::Array(_) => Ok(Ty::Usize),
                other => Err(format!("len of value of kind {other:?}")),
            }
        }),
        "index" => Some(if args.len() != 2 {
            Err("index takes a subject and a key".to_string())
        } else {
            let mut subject = &args[0];
            while let Ty::Ref(inner) = subject {
                subject = inner;
            }
            match subject {
                Ty::Map(_, value) => Ok((**value).clone()),
                Ty::Slice(elem) | Ty::Array(elem, _) => Ok((**elem).clone()),
                other => Err(format!("cannot index a value of kind {:?}", env.kind(other))),
            }
        }),
        name if COMPARISONS.contains(&name) => Some(match (name, args.len()) {
            ("eq", n) if n >= 2 => Ok(Ty::Bool),
            ("eq", _) => Err("eq takes at least two arguments".to_string()),
            (_, 2) => Ok(Ty::Bool),
            (other, n) => Err(format!("{other} takes exactly two arguments, got {n}")),
        }),
        "not" => Some(if args.len() == 1 {
            Ok(Ty::Bool)
        } else {
            Err("not takes exactly one argument".to_string())
        }),
        "and" | "or" => Some(if args.len() >= 2 {
            Ok(Ty::Bool)
        } else {
            Err(format!("{name} takes at least two arguments"))
        }),
        _ => None,
    }
}

/// True when a numeric literal argument may coerce to `kind` in emitted
/// code.
fn literal_coerces(arg: &Arg, kind: &Kind) -> bool {
    match arg {
        Arg::Number(n) if n.is_float => kind.is_float(),
        Arg::Number(_) => kind.is_signed() || kind.is_unsigned(),
        _ => false,
    }
}

impl Converter<'_> {
    /// Tries the specializer rules against a multi-argument identifier
    /// command. Returns `None` when no rule fires.
    pub(crate) fn specialize_command(
        &mut self,
        cmd: &Command,
        in_print: bool,
    ) -> Result<Option<Specialized>, CompileError> {
        let Arg::Ident(name) = cmd.head() else {
            return Ok(None);
        };
        let name = name.clone();
        let args = &cmd.args[1..];

        let mut arg_tys = Vec::with_capacity(args.len());
        for arg in args {
            arg_tys.push(self.state.type_of_arg(arg, &self.template)?);
        }

        // Rule 1: HTML escape writing straight to the writer.
        if ESCAPERS.contains(&name.as_str())
            && in_print
            && args.len() == 1
            && matches!(self.kind_of(&arg_tys[0]).strip_ref(), Kind::Str)
        {
            let arg = self.arg_plain_expr(&args[0])?;
            let escape = quote::format_ident!("{}", self.program.add_import("tplc::escape"));
            self.skip_print = true;
            self.used_w = true;
            return Ok(Some(Specialized {
                expr: parse_quote!(#escape::html_escape(w, #arg.as_bytes())),
                ty: Ty::Str,
            }));
        }

        // Rule 2: the closed optimized-call table.
        if ESCAPERS.contains(&name.as_str())
            && args.len() == 1
            && matches!(self.kind_of(&arg_tys[0]).strip_ref(), Kind::Str)
        {
            let arg = self.arg_plain_expr(&args[0])?;
            let escape = quote::format_ident!("{}", self.program.add_import("tplc::escape"));
            return Ok(Some(Specialized {
                expr: parse_quote!(#escape::escape_string(&#arg)),
                ty: Ty::Str,
            }));
        }
        if name == "urlquery"
            && args.len() == 1
            && matches!(self.kind_of(&arg_tys[0]).strip_ref(), Kind::Str)
        {
            let arg = self.arg_plain_expr(&args[0])?;
            let escape = quote::format_ident!("{}", self.program.add_import("tplc::escape"));
            return Ok(Some(Specialized {
                expr: parse_quote!(#escape::url_query_escape(&#arg)),
                ty: Ty::Str,
            }));
        }

        // Reaching this point with an escaper name means the arity or the
        // argument kind did not match; there is no fallback to decline to.
        if ESCAPERS.contains(&name.as_str()) || name == "urlquery" {
            return Err(self.emission(
                "command",
                format!("{name} expects one string argument"),
            ));
        }

        // Rule 3: native len.
        if name == "len" && args.len() == 1 {
            match self.kind_of(&arg_tys[0]).strip_ref() {
                Kind::Str | Kind::Slice(_) | Kind::Array(_) => {
                    let arg = self.arg_plain_expr(&args[0])?;
                    return Ok(Some(Specialized {
                        expr: parse_quote!(#arg.len()),
                        ty: Ty::Usize,
                    }));
                }
                other => {
                    return Err(self.emission(
                        "command",
                        format!("len of value of kind {other:?}"),
                    ));
                }
            }
        }

        // Rule 4: native index access.
        if name == "index" && args.len() == 2 {
            let mut subject_ty = &arg_tys[0];
            while let Ty::Ref(inner) = subject_ty {
                subject_ty = inner;
            }
            let subject = self.arg_plain_expr(&args[0])?;
            let key = self.arg_plain_expr(&args[1])?;
            match subject_ty.clone() {
                Ty::Map(_, value) => {
                    // String literals already borrow; owned keys need `&`.
                    let lookup: syn::Expr = match &args[1] {
                        Arg::Str(_) => key,
                        _ => parse_quote!(&#key),
                    };
                    return Ok(Some(Specialized {
                        expr: parse_quote!(#subject.get(#lookup).cloned().unwrap_or_default()),
                        ty: *value,
                    }));
                }
                Ty::Slice(elem) | Ty::Array(elem, _) => {
                    return Ok(Some(Specialized {
                        expr: parse_quote!(#subject[#key as usize].clone()),
                        ty: *elem,
                    }));
                }
                other => {
                    return Err(self.emission(
                        "command",
                        format!("cannot index a value of kind {:?}", self.kind_of(&other)),
                    ));
                }
            }
        }

        // Rule 5: comparison operators.
        if COMPARISONS.contains(&name.as_str()) {
            return self.specialize_comparison(&name, args, &arg_tys).map(Some);
        }

        // Rule 6: truthiness operators.
        if name == "not" && args.len() == 1 {
            let arg = self.arg_plain_expr(&args[0])?;
            let truth = self.make_truth_test(arg, &arg_tys[0], "command")?;
            return Ok(Some(Specialized {
                expr: parse_quote!(!(#truth)),
                ty: Ty::Bool,
            }));
        }
        if (name == "and" || name == "or") && args.len() >= 2 {
            for ty in &arg_tys {
                if !matches!(self.kind_of(ty).strip_ref(), Kind::Bool) {
                    return Err(self.emission(
                        "command",
                        format!("{name} arguments must be booleans"),
                    ));
                }
            }
            let mut exprs = Vec::with_capacity(args.len());
            for arg in args {
                exprs.push(self.arg_plain_expr(arg)?);
            }
            let mut chain = exprs[0].clone();
            for operand in &exprs[1..] {
                chain = if name == "and" {
                    parse_quote!(#chain && #operand)
                } else {
                    parse_quote!(#chain || #operand)
                };
            }
            return Ok(Some(Specialized {
                expr: chain,
                ty: Ty::Bool,
            }));
        }

        Ok(None)
    }

    fn specialize_comparison(
        &mut self,
        name: &str,
        args: &[Arg],
        arg_tys: &[Ty],
    ) -> Result<Specialized, CompileError> {
        if args.len() < 2 {
            return Err(self.emission(
                "command",
                format!("{name} takes at least two arguments"),
            ));
        }
        if name != "eq" && args.len() != 2 {
            return Err(self.emission(
                "command",
                format!("{name} takes exactly two arguments, got {}", args.len()),
            ));
        }

        let kinds: Vec<Kind> = arg_tys
            .iter()
            .map(|t| self.kind_of(t).strip_ref().clone())
            .collect();
        for (i, kind) in kinds.iter().enumerate().skip(1) {
            let matches = *kind == kinds[0]
                || literal_coerces(&args[i], &kinds[0])
                || literal_coerces(&args[0], kind);
            if !matches {
                return Err(self.emission(
                    "command",
                    format!(
                        "{name} arguments must share a kind, got {:?} and {:?}",
                        kinds[0], kind
                    ),
                ));
            }
        }

        let mut exprs = Vec::with_capacity(args.len());
        for arg in args {
            exprs.push(self.arg_plain_expr(arg)?);
        }

        let first = exprs[0].clone();
        let expr: syn::Expr = if name == "eq" {
            // `eq a b c` holds when `a` equals any of the others.
            let mut chain: syn::Expr = {
                let b = &exprs[1];
                parse_quote!(#first == #b)
            };
            for b in &exprs[2..] {
                chain = parse_quote!(#chain || #first == #b);
            }
            chain
        } else {
            let b = &exprs[1];
            match name {
                "ne" => parse_quote!(#first != #b),
                "lt" => parse_quote!(#first < #b),
                "le" => parse_quote!(#first <= #b),
                "gt" => parse_quote!(#first > #b),
                "ge" => parse_quote!(#first >= #b),
                _ => unreachable!("comparison name checked above"),
            }
        };
        Ok(Specialized {
            expr,
            ty: Ty::Bool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_result_len() {
        let env = TypeEnv::new();
        assert_eq!(
            builtin_result_ty("len", &[Ty::Slice(Box::new(Ty::U8))], &env),
            Some(Ok(Ty::Usize))
        );
        assert!(matches!(
            builtin_result_ty("len", &[Ty::Bool], &env),
            Some(Err(_))
        ));
        assert_eq!(builtin_result_ty("up", &[Ty::Str], &env), None);
    }

    #[test]
    fn test_builtin_result_index() {
        let env = TypeEnv::new();
        let map = Ty::Map(Box::new(Ty::Str), Box::new(Ty::Isize));
        assert_eq!(
            builtin_result_ty("index", &[map, Ty::Str], &env),
            Some(Ok(Ty::Isize))
        );
    }

    #[test]
    fn test_builtin_result_comparisons() {
        let env = TypeEnv::new();
        assert_eq!(
            builtin_result_ty("eq", &[Ty::Str, Ty::Str, Ty::Str], &env),
            Some(Ok(Ty::Bool))
        );
        assert!(matches!(
            builtin_result_ty("lt", &[Ty::Isize, Ty::Isize, Ty::Isize], &env),
            Some(Err(_))
        ));
    }

    #[test]
    fn test_literal_coerces() {
        use crate::parse::node::NumberLit;
        let int_lit = Arg::Number(NumberLit {
            text: "0".to_string(),
            is_float: false,
        });
        let float_lit = Arg::Number(NumberLit {
            text: "0.5".to_string(),
            is_float: true,
        });
        assert!(literal_coerces(&int_lit, &Kind::Usize));
        assert!(!literal_coerces(&int_lit, &Kind::F64));
        assert!(literal_coerces(&float_lit, &Kind::F32));
        assert!(!literal_coerces(&float_lit, &Kind::I64));
    }
}
