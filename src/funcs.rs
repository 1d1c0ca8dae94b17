//! Helper catalogs.
//!
//! A catalog maps a helper name to its callable signature. Two baseline
//! catalogs are always merged into a template set's catalog (the standard
//! builtins and the accessor set); HTML mode adds the escaper catalog. The
//! catalog is closed at compile time: a pipeline referencing a name outside
//! it is a fatal error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::reflect::{FnSig, Ty};

/// Name → signature. Ordered so catalog-driven output is deterministic.
pub type Funcs = BTreeMap<String, FnSig>;

/// Descriptor of a helper that is also callable as a package-qualified
/// symbol, permitting direct emission instead of dynamic dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdent {
    /// The helper name as referenced in templates.
    pub func_name: String,
    /// The qualified call target, rooted at the last segment of
    /// `pkg_path`, e.g. `helpers::up`.
    pub selector: String,
    /// The module path to import, e.g. `demo::helpers`.
    pub pkg_path: String,
}

/// The standard builtin catalog. Signatures here are representative; the
/// call specializer owns the real typing of these names.
pub fn builtins() -> Funcs {
    let mut funcs = Funcs::new();
    funcs.insert("len".into(), FnSig::new(vec![Ty::Str], vec![Ty::Usize]));
    for cmp in ["eq", "ne", "lt", "le", "gt", "ge"] {
        funcs.insert(
            cmp.into(),
            FnSig {
                ins: vec![Ty::Bool, Ty::Bool],
                outs: vec![Ty::Bool],
                variadic: cmp == "eq",
            },
        );
    }
    funcs.insert("not".into(), FnSig::new(vec![Ty::Bool], vec![Ty::Bool]));
    for junction in ["and", "or"] {
        funcs.insert(
            junction.into(),
            FnSig {
                ins: vec![Ty::Bool, Ty::Bool],
                outs: vec![Ty::Bool],
                variadic: true,
            },
        );
    }
    funcs.insert("html".into(), FnSig::new(vec![Ty::Str], vec![Ty::Str]));
    funcs.insert("urlquery".into(), FnSig::new(vec![Ty::Str], vec![Ty::Str]));
    funcs
}

/// The accessor catalog: compile-time specialized value access.
pub fn accessors() -> Funcs {
    let mut funcs = Funcs::new();
    funcs.insert(
        "index".into(),
        FnSig::new(vec![Ty::Str, Ty::Str], vec![Ty::Str]),
    );
    funcs
}

/// The escaper catalog added in HTML mode.
pub fn html_funcs() -> Funcs {
    let mut funcs = Funcs::new();
    funcs.insert(
        "_html_template_htmlescaper".into(),
        FnSig::new(vec![Ty::Str], vec![Ty::Str]),
    );
    funcs
}

/// The full catalog for one template set: baselines, then the HTML layer,
/// then user helpers (user entries win on collision).
pub fn with_baseline(user: &Funcs, html_mode: bool) -> Funcs {
    let mut funcs = builtins();
    funcs.extend(accessors());
    if html_mode {
        funcs.extend(html_funcs());
    }
    funcs.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    funcs
}
