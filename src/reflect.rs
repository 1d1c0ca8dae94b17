//! Declarative type model standing in for runtime reflection.
//!
//! The compiler never sees live values; the data shape a template renders
//! is declared as a [`Ty`] resolved through a [`TypeEnv`]. The emitter only
//! ever consumes [`Kind`] classifications, path walks and method
//! signatures; this module is the single place allowed to look at type
//! structure.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// A declared type. Named structs and opaque values resolve through the
/// [`TypeEnv`]; everything else is structural.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ty {
    Str,
    Bool,
    I8,
    I16,
    I32,
    I64,
    Isize,
    U8,
    U16,
    U32,
    U64,
    Usize,
    F32,
    F64,
    /// Trailing-error sentinel in helper signatures.
    Error,
    /// A struct or opaque type, keyed by qualified name in the env.
    Named(String),
    Slice(Box<Ty>),
    Array(Box<Ty>, usize),
    Map(Box<Ty>, Box<Ty>),
    Ref(Box<Ty>),
}

/// Emitter-facing classification of a [`Ty`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Str,
    Bool,
    I8,
    I16,
    I32,
    I64,
    Isize,
    U8,
    U16,
    U32,
    U64,
    Usize,
    F32,
    F64,
    Struct,
    /// The interface analog: printable, never traversable.
    Opaque,
    Map,
    Slice(Box<Kind>),
    Array(Box<Kind>),
    Ref(Box<Kind>),
    Error,
}

impl Kind {
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            Kind::I8 | Kind::I16 | Kind::I32 | Kind::I64 | Kind::Isize
        )
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Kind::U8 | Kind::U16 | Kind::U32 | Kind::U64 | Kind::Usize
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Kind::F32 | Kind::F64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_signed() || self.is_unsigned() || self.is_float()
    }

    /// The kind two comparison arguments must share, with `Ref` peeled.
    pub fn strip_ref(&self) -> &Kind {
        match self {
            Kind::Ref(inner) => inner.strip_ref(),
            other => other,
        }
    }
}

/// A field of a declared struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: Ty,
}

/// A method of a declared struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub sig: FnSig,
}

/// A callable signature: input arity and types, output arity and types,
/// variadic flag. A variadic callable takes its trailing parameter as a
/// `Vec` of the declared element type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnSig {
    pub ins: Vec<Ty>,
    pub outs: Vec<Ty>,
    #[serde(default)]
    pub variadic: bool,
}

impl FnSig {
    pub fn new(ins: Vec<Ty>, outs: Vec<Ty>) -> Self {
        FnSig {
            ins,
            outs,
            variadic: false,
        }
    }

    /// True when the trailing result is the error sentinel.
    pub fn fallible(&self) -> bool {
        matches!(self.outs.last(), Some(Ty::Error))
    }

    /// The value result of the call, `None` for a pure side-effect helper.
    pub fn value_out(&self) -> Option<&Ty> {
        match self.outs.first() {
            Some(Ty::Error) | None => None,
            Some(ty) => Some(ty),
        }
    }
}

/// Body of a declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeBody {
    Struct {
        fields: Vec<FieldDef>,
        #[serde(default)]
        methods: Vec<MethodDef>,
    },
    /// A type the compiler may print but never traverse. `rendered` is the
    /// Rust type emitted for bindings of this type.
    Opaque { rendered: String },
}

/// A declared type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Bare type name, e.g. `TemplateData`.
    pub name: String,
    /// Module path the type lives in, e.g. `demo::data`.
    pub module: String,
    /// Whether the type is publicly visible from the emitted file.
    #[serde(default = "default_true")]
    pub public: bool,
    pub body: TypeBody,
}

fn default_true() -> bool {
    true
}

impl TypeDef {
    pub fn qualified(&self) -> String {
        if self.module.is_empty() {
            self.name.clone()
        } else {
            format!("{}::{}", self.module, self.name)
        }
    }
}

/// Registry of declared types, keyed by qualified name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeEnv {
    types: FxHashMap<String, TypeDef>,
}

/// A failed path walk, turned into an emission error by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathError(pub String);

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: TypeDef) -> Ty {
        let key = def.qualified();
        self.types.insert(key.clone(), def);
        Ty::Named(key)
    }

    pub fn get(&self, qualified: &str) -> Option<&TypeDef> {
        self.types.get(qualified)
    }

    fn resolve<'a>(&'a self, ty: &'a Ty) -> Option<&'a TypeDef> {
        match ty {
            Ty::Named(q) => self.types.get(q),
            Ty::Ref(inner) => self.resolve(inner),
            _ => None,
        }
    }

    /// Kind classification of a type.
    pub fn kind(&self, ty: &Ty) -> Kind {
        match ty {
            Ty::Str => Kind::Str,
            Ty::Bool => Kind::Bool,
            Ty::I8 => Kind::I8,
            Ty::I16 => Kind::I16,
            Ty::I32 => Kind::I32,
            Ty::I64 => Kind::I64,
            Ty::Isize => Kind::Isize,
            Ty::U8 => Kind::U8,
            Ty::U16 => Kind::U16,
            Ty::U32 => Kind::U32,
            Ty::U64 => Kind::U64,
            Ty::Usize => Kind::Usize,
            Ty::F32 => Kind::F32,
            Ty::F64 => Kind::F64,
            Ty::Error => Kind::Error,
            Ty::Named(q) => match self.types.get(q).map(|d| &d.body) {
                Some(TypeBody::Struct { .. }) => Kind::Struct,
                Some(TypeBody::Opaque { .. }) | None => Kind::Opaque,
            },
            Ty::Slice(elem) => Kind::Slice(Box::new(self.kind(elem))),
            Ty::Array(elem, _) => Kind::Array(Box::new(self.kind(elem))),
            Ty::Map(_, _) => Kind::Map,
            Ty::Ref(inner) => Kind::Ref(Box::new(self.kind(inner))),
        }
    }

    fn field_ty(&self, ty: &Ty, name: &str) -> Result<Ty, PathError> {
        let def = self.resolve(ty).ok_or_else(|| {
            PathError(format!("cannot access field {name:?} on non-struct type"))
        })?;
        match &def.body {
            TypeBody::Struct { fields, .. } => fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.ty.clone())
                .ok_or_else(|| {
                    PathError(format!("type {} has no field {name:?}", def.qualified()))
                }),
            TypeBody::Opaque { .. } => Err(PathError(format!(
                "cannot traverse opaque value of type {}",
                def.qualified()
            ))),
        }
    }

    fn method(&self, ty: &Ty, name: &str) -> Option<FnSig> {
        let def = self.resolve(ty)?;
        match &def.body {
            TypeBody::Struct { methods, .. } => methods
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.sig.clone()),
            TypeBody::Opaque { .. } => None,
        }
    }

    /// Type reached by traversing `idents` through field accesses and, at
    /// the last step, a method invocation.
    pub fn walk_path(&self, idents: &[String], root: &Ty) -> Result<Ty, PathError> {
        let mut current = root.clone();
        for (i, ident) in idents.iter().enumerate() {
            let last = i + 1 == idents.len();
            if last {
                if let Some(sig) = self.method(&current, ident) {
                    return sig.value_out().cloned().ok_or_else(|| {
                        PathError(format!("method {ident:?} produces no value"))
                    });
                }
            }
            current = self.field_ty(&current, ident)?;
        }
        Ok(current)
    }

    /// True when the path ends in a method of the walked-to type.
    pub fn is_method_path(&self, idents: &[String], root: &Ty) -> bool {
        let Some((last, init)) = idents.split_last() else {
            return false;
        };
        let mut current = root.clone();
        for ident in init {
            match self.field_ty(&current, ident) {
                Ok(ty) => current = ty,
                Err(_) => return false,
            }
        }
        self.method(&current, last).is_some()
    }

    /// The signature of the method a path ends in.
    pub fn reflect_path(&self, idents: &[String], root: &Ty) -> Result<FnSig, PathError> {
        let (last, init) = idents
            .split_last()
            .ok_or_else(|| PathError("empty method path".to_string()))?;
        let mut current = root.clone();
        for ident in init {
            current = self.field_ty(&current, ident)?;
        }
        self.method(&current, last)
            .ok_or_else(|| PathError(format!("no method {last:?} on walked type")))
    }

    /// Renders the Rust type for emitted bindings of `ty`. `importer` maps
    /// a module path to the alias the emitted file imports it under.
    pub fn render(&self, ty: &Ty, importer: &mut dyn FnMut(&str) -> String) -> String {
        match ty {
            Ty::Str => "String".to_string(),
            Ty::Bool => "bool".to_string(),
            Ty::I8 => "i8".to_string(),
            Ty::I16 => "i16".to_string(),
            Ty::I32 => "i32".to_string(),
            Ty::I64 => "i64".to_string(),
            Ty::Isize => "isize".to_string(),
            Ty::U8 => "u8".to_string(),
            Ty::U16 => "u16".to_string(),
            Ty::U32 => "u32".to_string(),
            Ty::U64 => "u64".to_string(),
            Ty::Usize => "usize".to_string(),
            Ty::F32 => "f32".to_string(),
            Ty::F64 => "f64".to_string(),
            Ty::Error => "tplc::registry::RenderError".to_string(),
            Ty::Named(q) => match self.types.get(q) {
                Some(def) => match &def.body {
                    TypeBody::Opaque { rendered } => rendered.clone(),
                    TypeBody::Struct { .. } if def.module.is_empty() => def.name.clone(),
                    TypeBody::Struct { .. } => {
                        format!("{}::{}", importer(&def.module), def.name)
                    }
                },
                None => q.clone(),
            },
            Ty::Slice(elem) => format!("Vec<{}>", self.render(elem, importer)),
            Ty::Array(elem, n) => format!("[{}; {}]", self.render(elem, importer), n),
            Ty::Map(k, v) => format!(
                "std::collections::HashMap<{}, {}>",
                self.render(k, importer),
                self.render(v, importer)
            ),
            // Reference-ness is erased at the `Any` boundary; bindings hold
            // the owned form.
            Ty::Ref(inner) => self.render(inner, importer),
        }
    }

    /// Renders the `fn(..) -> ..` type of a helper for the typed dynamic
    /// dispatch. A fallible helper renders its value result inside
    /// `Result<_, RenderError>`.
    pub fn render_fn_type(
        &self,
        sig: &FnSig,
        importer: &mut dyn FnMut(&str) -> String,
    ) -> String {
        let mut params = Vec::with_capacity(sig.ins.len());
        for (i, input) in sig.ins.iter().enumerate() {
            let rendered = self.render(input, importer);
            if sig.variadic && i + 1 == sig.ins.len() {
                params.push(format!("Vec<{rendered}>"));
            } else {
                params.push(rendered);
            }
        }
        let fallible = sig.fallible();
        let values = if fallible {
            &sig.outs[..sig.outs.len() - 1]
        } else {
            &sig.outs[..]
        };
        let rendered_values = match values {
            [] => "()".to_string(),
            [one] => self.render(one, importer),
            many => {
                let parts: Vec<String> =
                    many.iter().map(|t| self.render(t, importer)).collect();
                format!("({})", parts.join(", "))
            }
        };
        let out = if fallible {
            let alias = importer("tplc::registry");
            format!(" -> Result<{rendered_values}, {alias}::RenderError>")
        } else if values.is_empty() {
            String::new()
        } else {
            format!(" -> {rendered_values}")
        };
        format!("fn({}){}", params.join(", "), out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> (TypeEnv, Ty) {
        let mut env = TypeEnv::new();
        let inner = env.register(TypeDef {
            name: "Inner".to_string(),
            module: "demo::data".to_string(),
            public: true,
            body: TypeBody::Struct {
                fields: vec![FieldDef {
                    name: "count".to_string(),
                    ty: Ty::Isize,
                }],
                methods: vec![],
            },
        });
        let root = env.register(TypeDef {
            name: "Outer".to_string(),
            module: "demo::data".to_string(),
            public: true,
            body: TypeBody::Struct {
                fields: vec![
                    FieldDef {
                        name: "title".to_string(),
                        ty: Ty::Str,
                    },
                    FieldDef {
                        name: "inner".to_string(),
                        ty: inner,
                    },
                    FieldDef {
                        name: "bytes".to_string(),
                        ty: Ty::Slice(Box::new(Ty::U8)),
                    },
                ],
                methods: vec![MethodDef {
                    name: "greeting".to_string(),
                    sig: FnSig::new(vec![], vec![Ty::Str]),
                }],
            },
        });
        (env, root)
    }

    fn idents(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_walk_field_path() {
        let (env, root) = sample_env();
        let ty = env.walk_path(&idents(&["inner", "count"]), &root).unwrap();
        assert_eq!(ty, Ty::Isize);
    }

    #[test]
    fn test_walk_method_path() {
        let (env, root) = sample_env();
        assert!(env.is_method_path(&idents(&["greeting"]), &root));
        let ty = env.walk_path(&idents(&["greeting"]), &root).unwrap();
        assert_eq!(ty, Ty::Str);
        let sig = env.reflect_path(&idents(&["greeting"]), &root).unwrap();
        assert_eq!(sig.outs, vec![Ty::Str]);
    }

    #[test]
    fn test_unknown_field_fails() {
        let (env, root) = sample_env();
        assert!(env.walk_path(&idents(&["nope"]), &root).is_err());
    }

    #[test]
    fn test_kinds() {
        let (env, root) = sample_env();
        assert_eq!(env.kind(&root), Kind::Struct);
        assert_eq!(
            env.kind(&Ty::Slice(Box::new(Ty::U8))),
            Kind::Slice(Box::new(Kind::U8))
        );
        assert!(env.kind(&Ty::Isize).is_signed());
        assert!(env.kind(&Ty::F32).is_float());
        assert_eq!(env.kind(&Ty::Named("missing".into())), Kind::Opaque);
    }

    #[test]
    fn test_render_types() {
        let (env, root) = sample_env();
        let mut importer = |path: &str| {
            assert_eq!(path, "demo::data");
            "data".to_string()
        };
        assert_eq!(env.render(&root, &mut importer), "data::Outer");
        assert_eq!(
            env.render(&Ty::Slice(Box::new(Ty::U8)), &mut |_| unreachable!()),
            "Vec<u8>"
        );
    }

    #[test]
    fn test_render_fn_type() {
        let env = TypeEnv::new();
        let sig = FnSig {
            ins: vec![Ty::Str, Ty::Str],
            outs: vec![Ty::Str, Ty::Error],
            variadic: true,
        };
        let mut importer = |path: &str| match path {
            "tplc::registry" => "registry".to_string(),
            other => panic!("unexpected import {other}"),
        };
        assert_eq!(
            env.render_fn_type(&sig, &mut importer),
            "fn(String, Vec<String>) -> Result<String, registry::RenderError>"
        );
    }
}
