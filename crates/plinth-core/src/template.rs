//! Template engine for `plinth`.
//!
//! A [`Template`] is a name plus a raw body. The body is compiled on first
//! execution and the compiled form is cached on the template for the life of
//! the process; a compile failure is cached too and reported on every later
//! call without recompiling.
//!
//! Each execution takes a data context and a [`FunctionTable`]. The table is
//! built by the caller for one render and injected as top-level callables, so
//! the same compiled template can run concurrently with different bindings.
//! Caller functions shadow the built-in helpers (`indent`) on name collision.
//!
//! Templates use Jinja syntax via `minijinja`: `{{ tls_crt("etcd") }}`,
//! `{{ vars.domain }}`, `{% for h in hosts_of_group() %}`. Undefined
//! variables are errors.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use minijinja::{AutoEscape, Environment, UndefinedBehavior, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::TemplateError;

/// A named template with a lazily compiled, cached form.
#[derive(Deserialize)]
pub struct Template {
    /// Template name, unique within its kind.
    pub name: String,
    /// Raw template body.
    #[serde(rename = "template", default)]
    pub body: String,
    #[serde(skip)]
    compiled: OnceLock<Result<Environment<'static>, String>>,
}

impl Template {
    /// Create a template from a name and body. Nothing is compiled yet.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            compiled: OnceLock::new(),
        }
    }

    /// Compile (once) and return the environment holding this template.
    fn environment(&self) -> Result<&Environment<'static>, TemplateError> {
        let compiled = self.compiled.get_or_init(|| {
            debug!(template = %self.name, "compiling template");
            let mut env = base_environment();
            env.add_template_owned(self.name.clone(), self.body.clone())
                .map(|()| env)
                .map_err(|e| e.to_string())
        });

        compiled.as_ref().map_err(|reason| TemplateError::Compile {
            name: self.name.clone(),
            reason: reason.clone(),
        })
    }

    /// Execute the template against `data` with `functions` bound.
    ///
    /// `data` must serialize to a mapping; its keys become top-level template
    /// variables. `context_name` and `element` identify the execution in
    /// errors and in the diagnostics directory (`host:node1`, `config`).
    ///
    /// # Errors
    ///
    /// - [`TemplateError::Compile`] if the body does not compile.
    /// - [`TemplateError::Data`] if `data` is not a serializable mapping.
    /// - [`TemplateError::Execute`] if rendering fails, including when a bound
    ///   function returns an error.
    pub fn execute<T: Serialize>(
        &self,
        context_name: &str,
        element: &str,
        data: &T,
        functions: &FunctionTable,
        details: Option<&Details>,
    ) -> Result<String, TemplateError> {
        let env = self.environment()?;
        let root = self.root_value(data, functions)?;

        let result = env
            .get_template(&self.name)
            .and_then(|tmpl| tmpl.render(root));

        if let Some(details) = details {
            details.record(context_name, element, &self.body, data, result.as_deref().ok());
        }

        result.map_err(|source| TemplateError::Execute {
            context: context_name.to_owned(),
            element: element.to_owned(),
            template: self.name.clone(),
            source,
        })
    }

    fn root_value<T: Serialize>(
        &self,
        data: &T,
        functions: &FunctionTable,
    ) -> Result<Value, TemplateError> {
        let data_error = |reason: String| TemplateError::Data {
            name: self.name.clone(),
            reason,
        };

        let mapping = match serde_yaml::to_value(data).map_err(|e| data_error(e.to_string()))? {
            serde_yaml::Value::Mapping(mapping) => mapping,
            serde_yaml::Value::Null => serde_yaml::Mapping::new(),
            other => return Err(data_error(format!("expected a mapping, got {other:?}"))),
        };

        let mut root: BTreeMap<String, Value> = BTreeMap::new();
        for (key, value) in mapping {
            let serde_yaml::Value::String(key) = key else {
                return Err(data_error(format!("non-string top-level key {key:?}")));
            };
            root.insert(key, Value::from_serialize(&value));
        }
        for (name, function) in &functions.functions {
            root.insert(name.clone(), function.clone());
        }

        Ok(Value::from(root))
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("compiled", &self.compiled.get().map(Result::is_ok))
            .finish_non_exhaustive()
    }
}

fn base_environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.set_keep_trailing_newline(true);
    env.add_function("indent", indent);
    env
}

/// Prefix every line of `text` with `prefix`.
///
/// Used to splice multi-line values (PEM blocks, file bundles) into YAML.
#[must_use]
pub fn indent(prefix: &str, text: &str) -> String {
    let mut indented = String::with_capacity(text.len() + prefix.len());
    indented.push_str(prefix);
    indented.push_str(&text.replace('\n', &format!("\n{prefix}")));
    indented
}

/// Callables bound into one template execution.
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, Value>,
}

impl FunctionTable {
    /// An empty table; templates see only the built-in helpers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `function` under `name`, replacing any previous binding.
    pub fn insert(&mut self, name: impl Into<String>, function: Value) {
        self.functions.insert(name.into(), function);
    }

    /// Whether a function is bound under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Names of all bound functions, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Diagnostics sink: writes each template execution's input, data, and
/// output under a directory.
///
/// Layout: `<dir>/<context>/<element>-<seq>/{in,data,out}`. Purely
/// observational: write failures are logged and never fail the render.
#[derive(Debug)]
pub struct Details {
    dir: PathBuf,
    seq: AtomicU64,
}

impl Details {
    /// Record executions under `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            seq: AtomicU64::new(0),
        }
    }

    /// Root diagnostics directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record<T: Serialize>(
        &self,
        context_name: &str,
        element: &str,
        body: &str,
        data: &T,
        output: Option<&str>,
    ) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let base = self
            .dir
            .join(context_name)
            .join(format!("{element}-{seq:03}"));

        if let Err(e) = write_details(&base, body, data, output) {
            warn!(path = %base.display(), error = %e, "failed to write template details");
        } else {
            debug!(path = %base.display(), "wrote template details");
        }
    }
}

fn write_details<T: Serialize>(
    base: &Path,
    body: &str,
    data: &T,
    output: Option<&str>,
) -> std::io::Result<()> {
    std::fs::create_dir_all(base)?;
    std::fs::write(base.join("in"), body)?;

    let data = serde_yaml::to_string(data).map_err(std::io::Error::other)?;
    std::fs::write(base.join("data"), data)?;

    if let Some(output) = output {
        std::fs::write(base.join("out"), output)?;
    }
    Ok(())
}
