//! The compilation pipeline.
//!
//! One call to [`compile`] turns a [`Configuration`] into the emitted
//! source of one output file: template sets are resolved (glob or inline),
//! parsed, simplified, emitted function by function into the shared
//! program, linked, and assembled.

pub(crate) mod calls;
mod convert;
mod program;

use std::collections::BTreeMap;
use std::fs;
use std::io;

use log::{debug, info};

use crate::config::{Configuration, DataConfiguration, TemplateConfiguration, TemplateSource};
use crate::error::CompileError;
use crate::funcs;
use crate::parse::{self, Tree};
use crate::simplify;

use program::{Association, CompiledTemplatesProgram, EmittedFn};

/// One template tree scheduled for emission.
pub(crate) struct TemplateToCompile {
    /// The registry name (file basename, inline name, or define name).
    pub name: String,
    pub tree: Tree,
    /// Names this template `{{define}}`s, recorded on the parent only.
    pub defined: Vec<String>,
}

/// Orders the trees of one source for emission (main template first) and
/// records the define associations on the parent.
pub(crate) fn prepare_template(
    main_name: &str,
    mut trees: BTreeMap<String, Tree>,
) -> Vec<TemplateToCompile> {
    let mut out = Vec::with_capacity(trees.len());
    let defined: Vec<String> = trees.keys().filter(|n| *n != main_name).cloned().collect();
    if let Some(main) = trees.remove(main_name) {
        out.push(TemplateToCompile {
            name: main_name.to_string(),
            tree: main,
            defined,
        });
    }
    for (name, tree) in trees {
        out.push(TemplateToCompile {
            name,
            tree,
            defined: Vec::new(),
        });
    }
    out
}

fn sanitize_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}

/// The base function name for a tree of a source template.
fn fn_base_name(main_name: &str, tree_name: &str, index: usize) -> String {
    if tree_name == main_name {
        format!("fn_{}_{}", sanitize_ident(main_name), index)
    } else {
        format!(
            "fn_{}_{}_{}",
            sanitize_ident(main_name),
            sanitize_ident(tree_name),
            index
        )
    }
}

/// Resolves a template set's sources into `(name, content)` pairs, sorted
/// for deterministic output.
fn resolve_sources(source: &TemplateSource) -> Result<Vec<(String, String)>, CompileError> {
    match source {
        TemplateSource::Inline { name, content } => {
            Ok(vec![(name.clone(), content.clone())])
        }
        TemplateSource::Glob(pattern) => {
            let paths = glob::glob(pattern).map_err(|e| {
                CompileError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("bad glob pattern {pattern:?}: {e}"),
                ))
            })?;
            let mut files = Vec::new();
            for entry in paths {
                let path = entry.map_err(|e| CompileError::Io(e.into_error()))?;
                if !path.is_file() {
                    continue;
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let content = fs::read_to_string(&path)?;
                files.push((name, content));
            }
            files.sort();
            Ok(files)
        }
    }
}

/// Compiles a configuration into the emitted source text.
pub fn compile(cfg: &Configuration) -> Result<String, CompileError> {
    let module_name = cfg.out_module.clone().unwrap_or_default();
    let module_name = if module_name.is_empty() {
        cfg.module_name()?
    } else {
        module_name
    };

    let mut program = CompiledTemplatesProgram::new(&cfg.registry_variable);
    let mut associations: Vec<Association> = Vec::new();
    let mut template_index = 0usize;

    for tcfg in &cfg.templates {
        compile_set(
            cfg,
            tcfg,
            &mut program,
            &mut associations,
            &mut template_index,
        )?;
    }

    let src = program.assemble(
        &module_name,
        &cfg.registry_variable,
        cfg.funcs_provider.as_deref(),
        &associations,
    )?;
    info!(
        "compiled {} template function(s) into module {}",
        program.funcs().len(),
        module_name
    );
    Ok(src)
}

fn compile_set(
    cfg: &Configuration,
    tcfg: &TemplateConfiguration,
    program: &mut CompiledTemplatesProgram,
    associations: &mut Vec<Association>,
    template_index: &mut usize,
) -> Result<(), CompileError> {
    let catalog = funcs::with_baseline(&tcfg.funcs, tcfg.html_mode);

    for (main_name, content) in resolve_sources(&tcfg.source)? {
        let trees = parse::parse(&main_name, &content)?;
        let templates = prepare_template(&main_name, trees);

        for (tree_idx, template) in templates.into_iter().enumerate() {
            let data_cfg = match tcfg.data_for(&template.name) {
                Some(ty) => Some(DataConfiguration::from_ty(
                    &template.name,
                    ty,
                    &cfg.type_env,
                )?),
                None => None,
            };
            let data_ty = data_cfg.as_ref().map(|c| c.ty.clone());

            let transformed = simplify::transform_tree(
                template.tree,
                data_ty,
                &cfg.type_env,
                &catalog,
            )?;
            debug!(
                "template {:?}: uses_dot={} prints={} dispatches={}",
                template.name,
                simplify::is_using_dot(&transformed.tree),
                simplify::prints_anything(&transformed.tree),
                simplify::uses_templater(&transformed.tree),
            );

            let base = fn_base_name(&main_name, &template.name, tree_idx);
            let fn_name = program.fresh_function_name(&base);
            let item = convert::convert_tpl_tree(
                &fn_name,
                &transformed.tree,
                data_cfg.as_ref(),
                transformed.state,
                &tcfg.public_idents,
                tcfg.html_mode,
                program,
            )?;
            program.push_func(EmittedFn {
                registry_name: template.name.clone(),
                fn_name,
                item,
            });

            for (sub_index, child) in template.defined.iter().enumerate() {
                associations.push(Association {
                    template_index: *template_index,
                    sub_index,
                    parent: template.name.clone(),
                    child: child.clone(),
                });
            }
            *template_index += 1;
        }
    }
    Ok(())
}

/// Compiles a configuration and writes the result to its `out_path`.
pub fn compile_to_file(cfg: &Configuration) -> Result<(), CompileError> {
    let src = compile(cfg)?;
    fs::write(&cfg.out_path, src)?;
    info!("wrote {}", cfg.out_path.display());
    Ok(())
}
