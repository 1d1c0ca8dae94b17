//! Runtime registry for compiled templates.
//!
//! An emitted program installs one compiled function per template into a
//! [`Registry`] at process start (a `LazyLock` initializer) and wires
//! `{{define}}` sub-templates into their parents with [`Compiled::compiled`].
//! Rendering calls the bound function directly; nothing is parsed or
//! interpreted at run time.
//!
//! Sub-template invocation goes through the registry indirection by string
//! name, so mutually recursive templates never form an ownership cycle.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced while rendering a compiled template.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    #[error("helper failed: {0}")]
    Helper(String),
}

/// The shape of every compiled template function.
pub type CompiledTemplateFn =
    fn(&dyn Templater, &mut dyn io::Write, &dyn Any) -> Result<(), RenderError>;

/// Dynamic helpers, stored type-erased and re-typed at emitted call sites.
pub type FuncsTable = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// The minimum capability compiled functions demand of their `t` parameter:
/// dynamic helper lookup and sub-template dispatch by name.
pub trait Templater {
    fn get_funcs(&self) -> &FuncsTable;
    fn execute_template(
        &self,
        w: &mut dyn io::Write,
        name: &str,
        data: &dyn Any,
    ) -> Result<(), RenderError>;
}

/// A compiled template: its own function plus the function table of every
/// sub-template associated with it.
#[derive(Clone)]
pub struct Compiled {
    name: String,
    execute_fn: CompiledTemplateFn,
    tmpl: HashMap<String, CompiledTemplateFn>,
    funcs: Arc<FuncsTable>,
}

impl Compiled {
    pub fn new(name: &str, f: CompiledTemplateFn) -> Self {
        let mut tmpl = HashMap::new();
        tmpl.insert(name.to_string(), f);
        Compiled {
            name: name.to_string(),
            execute_fn: f,
            tmpl,
            funcs: Arc::new(FuncsTable::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches `other` (and everything already attached to it) as callable
    /// sub-templates of `self`.
    pub fn compiled(mut self, other: Compiled) -> Compiled {
        self.tmpl.extend(other.tmpl);
        self
    }

    /// Renders this template to `w`.
    pub fn execute(&self, w: &mut dyn io::Write, data: &dyn Any) -> Result<(), RenderError> {
        (self.execute_fn)(self, w, data)
    }

    fn set_funcs(&mut self, funcs: Arc<FuncsTable>) {
        self.funcs = funcs;
    }
}

impl Templater for Compiled {
    fn get_funcs(&self) -> &FuncsTable {
        &self.funcs
    }

    fn execute_template(
        &self,
        w: &mut dyn io::Write,
        name: &str,
        data: &dyn Any,
    ) -> Result<(), RenderError> {
        match self.tmpl.get(name) {
            Some(f) => f(self, w, data),
            None => Err(RenderError::TemplateNotFound(name.to_string())),
        }
    }
}

/// Registers compiled templates by name.
#[derive(Default)]
pub struct Registry {
    templates: HashMap<String, Compiled>,
    funcs: Arc<FuncsTable>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Installs the dynamic helper table shared by every template added
    /// afterwards (and retrofits the ones already added).
    pub fn with_funcs(mut self, funcs: FuncsTable) -> Registry {
        self.funcs = Arc::new(funcs);
        for tpl in self.templates.values_mut() {
            tpl.set_funcs(Arc::clone(&self.funcs));
        }
        self
    }

    /// Binds `name` to a compiled function. Re-adding a name replaces the
    /// earlier binding: the last `add` in init order wins.
    pub fn add(&mut self, name: &str, f: CompiledTemplateFn) {
        let mut tpl = Compiled::new(name, f);
        tpl.set_funcs(Arc::clone(&self.funcs));
        self.templates.insert(name.to_string(), tpl);
    }

    pub fn get(&self, name: &str) -> Option<&Compiled> {
        self.templates.get(name)
    }

    /// Like [`Registry::get`] but panics on a miss; init code uses this so a
    /// broken association fails loudly at startup.
    pub fn must_get(&self, name: &str) -> &Compiled {
        match self.templates.get(name) {
            Some(tpl) => tpl,
            None => panic!("template not found: {name}"),
        }
    }

    /// Replaces an entry after sub-template association.
    pub fn set(&mut self, name: &str, tpl: Compiled) {
        self.templates.insert(name.to_string(), tpl);
    }
}
