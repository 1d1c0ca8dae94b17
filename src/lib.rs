//! Ahead-of-time template compiler.
//!
//! `tplc` consumes action-based `{{...}}` template sources together with a
//! declared data shape and emits equivalent Rust code: one function per
//! template, registered by name in a [`registry::Registry`] so callers can
//! look templates up and render them to any writer with no parsing and no
//! reflection at run time.
//!
//! # Architecture
//!
//! - [`parse`] — lexer and recursive-descent parser producing one tree per
//!   `{{define}}` plus the main tree.
//! - [`simplify`] — the tree simplifier and type annotator: variable
//!   hygiene, pipeline lowering into typed temporaries, and the
//!   scope-typed state the emitter replays.
//! - [`reflect`] — the declarative type model standing in for runtime
//!   reflection.
//! - [`compile`] — symbol environment, node emitter, call specializer and
//!   program assembler.
//! - [`registry`] / [`escape`] — the runtime the emitted code links
//!   against.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//!
//! use tplc::config::{Configuration, TemplateConfiguration, TemplateSource};
//! use tplc::reflect::{Ty, TypeEnv};
//!
//! let mut data = BTreeMap::new();
//! data.insert("*".to_string(), Ty::Str);
//!
//! let cfg = Configuration {
//!     out_path: "src/gen_templates.rs".into(),
//!     out_module: Some("crate".to_string()),
//!     templates: vec![TemplateConfiguration {
//!         html_mode: false,
//!         source: TemplateSource::Inline {
//!             name: "hello".to_string(),
//!             content: "Hello, {{.}}!".to_string(),
//!         },
//!         data,
//!         funcs: BTreeMap::new(),
//!         public_idents: vec![],
//!     }],
//!     registry_variable: "COMPILED_TEMPLATES".to_string(),
//!     funcs_provider: None,
//!     type_env: TypeEnv::new(),
//! };
//! let source = tplc::compile(&cfg).unwrap();
//! ```

pub mod compile;
pub mod config;
pub mod error;
pub mod escape;
pub mod funcs;
pub mod parse;
pub mod reflect;
pub mod registry;
pub mod simplify;

pub use compile::{compile, compile_to_file};
pub use config::Configuration;
pub use error::CompileError;
