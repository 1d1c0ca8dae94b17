//! Compilation configuration.
//!
//! One [`Configuration`] describes one compilation unit: the destination
//! file, the template sets to compile into it, and the type environment the
//! oracle resolves declared data shapes against. The CLI deserializes this
//! from JSON; library callers build it directly.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::funcs::{Funcs, PublicIdent};
use crate::reflect::{Ty, TypeBody, TypeEnv};

/// Where a template set's sources come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TemplateSource {
    /// A filesystem glob pattern; each match is one template file whose
    /// basename is the template name.
    Glob(String),
    /// An inline source with an explicit name.
    Inline { name: String, content: String },
}

/// One set of templates sharing a helper catalog and data table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfiguration {
    /// When true, the escaper catalog is added and string prints are
    /// escaped on output.
    #[serde(default)]
    pub html_mode: bool,
    pub source: TemplateSource,
    /// Template name → declared data type. The sentinel key `"*"` supplies
    /// the default for names not otherwise listed.
    #[serde(default)]
    pub data: BTreeMap<String, Ty>,
    /// User helper signatures, merged over the baseline catalogs.
    #[serde(default)]
    pub funcs: Funcs,
    /// Helpers also callable as package-qualified symbols.
    #[serde(default)]
    pub public_idents: Vec<PublicIdent>,
}

impl TemplateConfiguration {
    /// The declared data type for a template name, falling back to the
    /// `"*"` sentinel.
    pub fn data_for(&self, name: &str) -> Option<&Ty> {
        self.data.get(name).or_else(|| self.data.get("*"))
    }
}

fn default_registry_variable() -> String {
    "COMPILED_TEMPLATES".to_string()
}

/// A full compilation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Destination file for the emitted source.
    pub out_path: PathBuf,
    /// Declared output module name; inferred from the destination directory
    /// when absent.
    #[serde(default)]
    pub out_module: Option<String>,
    pub templates: Vec<TemplateConfiguration>,
    /// The exported static holding the compiled-template registry.
    #[serde(default = "default_registry_variable")]
    pub registry_variable: String,
    /// Path of a `fn() -> FuncsTable` supplying dynamic helpers at run
    /// time, e.g. `demo::helpers::template_funcs`. When absent the registry
    /// starts with an empty table.
    #[serde(default)]
    pub funcs_provider: Option<String>,
    #[serde(default)]
    pub type_env: TypeEnv,
}

/// The data shape one compiled function downcasts its input to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConfiguration {
    pub is_reference: bool,
    pub type_name: String,
    pub package_path: String,
    pub qualified_name: String,
    /// The declared type itself, used for oracle queries and rendering.
    pub ty: Ty,
}

impl DataConfiguration {
    /// Extracts the descriptor from a declared data type.
    pub fn from_ty(
        template: &str,
        ty: &Ty,
        env: &TypeEnv,
    ) -> Result<DataConfiguration, CompileError> {
        let (is_reference, base) = match ty {
            Ty::Ref(inner) => (true, inner.as_ref()),
            other => (false, other),
        };
        let (type_name, package_path, qualified_name) = match base {
            Ty::Named(q) => {
                let def = env.get(q).ok_or_else(|| CompileError::BadDataSelector {
                    template: template.to_string(),
                    detail: format!("type {q:?} is not registered in the type environment"),
                })?;
                if matches!(def.body, TypeBody::Opaque { .. }) {
                    return Err(CompileError::BadDataSelector {
                        template: template.to_string(),
                        detail: format!("opaque type {q:?} cannot be a data root"),
                    });
                }
                (def.name.clone(), def.module.clone(), def.qualified())
            }
            other => {
                let rendered = env.render(other, &mut |m: &str| m.to_string());
                (rendered.clone(), String::new(), rendered)
            }
        };
        Ok(DataConfiguration {
            is_reference,
            type_name,
            package_path,
            qualified_name,
            ty: base.clone(),
        })
    }
}

impl Configuration {
    pub fn from_json(json: &str) -> Result<Configuration, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The output module name: the declared one, or the inferred one.
    pub fn module_name(&self) -> io::Result<String> {
        match &self.out_module {
            Some(name) if !name.is_empty() => Ok(name.clone()),
            _ => lookup_module_name(&self.out_path),
        }
    }
}

/// Infers the module name the destination file belongs to: a sibling
/// `lib.rs` or `main.rs` marks the crate root, otherwise the directory
/// basename is used (which is also the module name `mod.rs` directories
/// carry).
pub fn lookup_module_name(out_path: &Path) -> io::Result<String> {
    let dir = out_path.parent().unwrap_or_else(|| Path::new("."));
    if dir.as_os_str().is_empty() || fs::metadata(dir).is_ok() {
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        for marker in ["lib.rs", "main.rs"] {
            if dir.join(marker).exists() {
                return Ok("crate".to_string());
            }
        }
        let base = fs::canonicalize(dir)?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "gen".to_string());
        Ok(sanitize_module_name(&base))
    } else {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("output directory {} does not exist", dir.display()),
        ))
    }
}

fn sanitize_module_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{FieldDef, TypeDef};

    #[test]
    fn test_data_configuration_from_named() {
        let mut env = TypeEnv::new();
        let ty = env.register(TypeDef {
            name: "Post".to_string(),
            module: "blog::model".to_string(),
            public: true,
            body: TypeBody::Struct {
                fields: vec![FieldDef {
                    name: "title".to_string(),
                    ty: Ty::Str,
                }],
                methods: vec![],
            },
        });

        let cfg = DataConfiguration::from_ty("post.tpl", &ty, &env).unwrap();
        assert!(!cfg.is_reference);
        assert_eq!(cfg.type_name, "Post");
        assert_eq!(cfg.package_path, "blog::model");
        assert_eq!(cfg.qualified_name, "blog::model::Post");

        let by_ref = Ty::Ref(Box::new(ty));
        let cfg = DataConfiguration::from_ty("post.tpl", &by_ref, &env).unwrap();
        assert!(cfg.is_reference);
        assert_eq!(cfg.qualified_name, "blog::model::Post");
    }

    #[test]
    fn test_data_configuration_unregistered_type_fails() {
        let env = TypeEnv::new();
        let err = DataConfiguration::from_ty("x", &Ty::Named("ghost".into()), &env).unwrap_err();
        assert!(matches!(err, CompileError::BadDataSelector { .. }));
    }

    #[test]
    fn test_sentinel_fallback() {
        let mut cfg = TemplateConfiguration {
            html_mode: false,
            source: TemplateSource::Inline {
                name: "x".to_string(),
                content: String::new(),
            },
            data: BTreeMap::new(),
            funcs: Funcs::new(),
            public_idents: vec![],
        };
        cfg.data.insert("*".to_string(), Ty::Str);
        cfg.data.insert("special".to_string(), Ty::Isize);
        assert_eq!(cfg.data_for("special"), Some(&Ty::Isize));
        assert_eq!(cfg.data_for("other"), Some(&Ty::Str));
    }

    #[test]
    fn test_sanitize_module_name() {
        assert_eq!(sanitize_module_name("My-App"), "my_app");
        assert_eq!(sanitize_module_name("3d"), "_3d");
    }

    #[test]
    fn test_configuration_json_round_trip() {
        let json = r#"{
            "out_path": "src/gen.rs",
            "templates": [{
                "source": { "Inline": { "name": "t", "content": "hi" } }
            }]
        }"#;
        let cfg = Configuration::from_json(json).unwrap();
        assert_eq!(cfg.registry_variable, "COMPILED_TEMPLATES");
        assert_eq!(cfg.templates.len(), 1);
        assert!(cfg.funcs_provider.is_none());
    }
}
