//! The render pipeline.
//!
//! A [`Renderer`] owns the cluster specification and the secret store. Each
//! render composes the host's [`RenderContext`], binds a function table to
//! the store and the [`RequestResolver`] for that host, executes the named
//! template, and saves the store if the render changed it.
//!
//! Secrets are resolved in a single pass: `{{ tls_crt("etcd") }}` issues (or
//! reuses) the certificate while the config template renders.
//!
//! Template rendering and secret generation are blocking, so every render
//! runs on the blocking thread pool.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use minijinja::{ErrorKind, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{RenderError, TemplateError};
use crate::resolver::RequestResolver;
use crate::scope::{ClusterScope, RenderContext};
use crate::secrets::SecretStore;
use crate::spec::{ClusterSpec, Host};
use crate::ssh::host_key_file_name;
use crate::template::{Details, FunctionTable, Template};

/// Directory under which `ca_dir` places CA bundles.
pub const CA_DIR_ROOT: &str = "/etc/tls-ca";
/// Directory under which `tls_dir` places certificate bundles.
pub const TLS_DIR_ROOT: &str = "/etc/tls";

const ADDONS_SET: &str = "addons";
const BOOTSTRAP_PODS_SET: &str = "bootstrap-pods";

/// A file to materialize on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDef {
    pub path: String,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub content: String,
}

impl FileDef {
    pub fn new(path: impl Into<String>, mode: u32, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode,
            content: content.into(),
        }
    }
}

/// A parsed host configuration. Only `files` is typed; every other key is
/// kept as-is for the boot image builders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub files: Vec<FileDef>,
    #[serde(flatten)]
    pub rest: serde_yaml::Mapping,
}

/// A rendered host configuration: the raw document and its parsed form.
#[derive(Debug, Clone)]
pub struct RenderedConfig {
    pub raw: String,
    pub config: HostConfig,
}

/// One pod from a cluster's bootstrap-pods set.
#[derive(Debug, Clone)]
pub struct BootstrapPod {
    pub namespace: String,
    pub name: String,
    pub pod: serde_yaml::Value,
}

// ── function errors ────────────────────────────────────────────────

/// Keeps the first typed error raised by a bound function during one
/// render, so it survives the trip through the template engine.
#[derive(Debug, Clone, Default)]
struct FunctionErrors(Arc<Mutex<Option<(String, RenderError)>>>);

impl FunctionErrors {
    fn fail(&self, function: &str, err: RenderError) -> minijinja::Error {
        let message = format!("{function}: {err}");
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some((function.to_owned(), err));
        }
        minijinja::Error::new(ErrorKind::InvalidOperation, message)
    }

    /// Convert a failed execution, preferring the function's own error.
    fn wrap(&self, err: TemplateError) -> RenderError {
        let taken = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match taken {
            Some((function, source)) => RenderError::Function {
                function,
                source: Box::new(source),
            },
            None => err.into(),
        }
    }
}

fn bind<R, F>(table: &mut FunctionTable, errors: &FunctionErrors, name: &'static str, f: F)
where
    R: Into<Value>,
    F: Fn(&str) -> Result<R, RenderError> + Send + Sync + 'static,
{
    let errors = errors.clone();
    table.insert(
        name,
        Value::from_function(move |arg: &str| f(arg).map_err(|e| errors.fail(name, e))),
    );
}

fn bind_nullary<R, F>(table: &mut FunctionTable, errors: &FunctionErrors, name: &'static str, f: F)
where
    R: Into<Value>,
    F: Fn() -> Result<R, RenderError> + Send + Sync + 'static,
{
    let errors = errors.clone();
    table.insert(
        name,
        Value::from_function(move || f().map_err(|e| errors.fail(name, e))),
    );
}

fn file_bundle(files: &[FileDef]) -> Result<String, RenderError> {
    serde_yaml::to_string(files).map_err(|e| RenderError::Output {
        reason: format!("file bundle: {e}"),
    })
}

fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{name}", dir.trim_end_matches('/'))
}

// ── cluster renders ────────────────────────────────────────────────

/// Bindings shared by cluster-level and host-level renders.
struct ClusterRender {
    spec: Arc<ClusterSpec>,
    store: Arc<SecretStore>,
    scope: ClusterScope,
    details: Option<Arc<Details>>,
    errors: FunctionErrors,
}

impl ClusterRender {
    fn new(
        spec: Arc<ClusterSpec>,
        store: Arc<SecretStore>,
        cluster: &str,
        details: Option<Arc<Details>>,
        errors: FunctionErrors,
    ) -> Result<Arc<Self>, RenderError> {
        let scope = ClusterScope::new(spec.cluster(cluster)?)?;
        Ok(Arc::new(Self {
            spec,
            store,
            scope,
            details,
            errors,
        }))
    }

    fn name(&self) -> &str {
        &self.scope.cluster.name
    }

    fn functions(self: &Arc<Self>) -> FunctionTable {
        let mut table = FunctionTable::new();
        let errors = &self.errors;

        let this = Arc::clone(self);
        bind(&mut table, errors, "token", move |name| {
            Ok(this.store.token(this.name(), name)?)
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "password", move |name| {
            Ok(this.store.password(this.name(), name)?)
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "ca_key", move |name| {
            Ok(this.store.ca(this.name(), name)?.key)
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "ca_crt", move |name| {
            Ok(this.store.ca(this.name(), name)?.cert)
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "ca_dir", move |name| {
            let ca = this.store.ca(this.name(), name)?;
            let dir = join_path(CA_DIR_ROOT, name);
            file_bundle(&[
                FileDef::new(join_path(&dir, "ca.crt"), 0o644, ca.cert),
                FileDef::new(join_path(&dir, "ca.key"), 0o600, ca.key),
            ])
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "hosts_by_group", move |group| {
            let hosts: Vec<&Host> = this.spec.hosts_in_group(group).collect();
            if hosts.is_empty() {
                return Err(RenderError::NotFound {
                    what: format!("hosts in group {group:?}"),
                });
            }
            Ok(Value::from_serialize(&hosts))
        });

        table
    }

    /// Render the template set named `set_ref` of kind `set` into one
    /// multi-document stream. An empty reference renders nothing.
    fn render_set(
        self: &Arc<Self>,
        set: &'static str,
        set_ref: &str,
        sets: &BTreeMap<String, Vec<Template>>,
    ) -> Result<String, RenderError> {
        if set_ref.is_empty() {
            return Ok(String::new());
        }
        let templates = sets.get(set_ref).ok_or_else(|| TemplateError::NotFound {
            kind: set,
            name: set_ref.to_owned(),
        })?;

        let context_name = format!("cluster:{}", self.name());
        let functions = self.functions();
        let mut out = String::new();

        for template in templates {
            debug!(cluster = %self.name(), set = %set, template = %template.name, "rendering cluster template");
            out.push_str(&format!("---\n# {set}: {}\n", template.name));
            let body = template
                .execute(
                    &context_name,
                    &format!("{set}/{}", template.name),
                    &self.scope,
                    &functions,
                    self.details.as_deref(),
                )
                .map_err(|e| self.errors.wrap(e))?;
            out.push_str(&body);
            out.push('\n');
        }
        Ok(out)
    }

    fn addons(self: &Arc<Self>) -> Result<String, RenderError> {
        self.render_set(ADDONS_SET, &self.scope.cluster.addons, &self.spec.addons)
    }

    fn bootstrap_pods_stream(self: &Arc<Self>) -> Result<String, RenderError> {
        self.render_set(
            BOOTSTRAP_PODS_SET,
            &self.scope.cluster.bootstrap_pods,
            &self.spec.bootstrap_pods,
        )
    }

    fn bootstrap_pods(self: &Arc<Self>) -> Result<Vec<BootstrapPod>, RenderError> {
        parse_bootstrap_pods(&self.bootstrap_pods_stream()?)
    }
}

/// Split a rendered bootstrap-pods stream into pods. Empty documents are
/// skipped; every other document needs `metadata.namespace` and
/// `metadata.name`.
///
/// # Errors
///
/// Returns [`RenderError::Output`] for unparsable documents or pods without
/// identifying metadata.
pub fn parse_bootstrap_pods(stream: &str) -> Result<Vec<BootstrapPod>, RenderError> {
    let mut pods = Vec::new();

    for (n, document) in serde_yaml::Deserializer::from_str(stream).enumerate() {
        let pod = serde_yaml::Value::deserialize(document).map_err(|e| RenderError::Output {
            reason: format!("bootstrap pod {n}: {e}"),
        })?;

        let empty = match &pod {
            serde_yaml::Value::Null => true,
            serde_yaml::Value::Mapping(m) => m.is_empty(),
            _ => false,
        };
        if empty {
            continue;
        }

        let metadata = |key: &str| {
            pod.get("metadata")
                .and_then(|md| md.get(key))
                .and_then(serde_yaml::Value::as_str)
                .map(str::to_owned)
        };
        let (Some(namespace), Some(name)) = (metadata("namespace"), metadata("name")) else {
            return Err(RenderError::Output {
                reason: format!("bootstrap pod {n}: metadata.namespace and metadata.name are required"),
            });
        };

        pods.push(BootstrapPod {
            namespace,
            name,
            pod,
        });
    }
    Ok(pods)
}

// ── host renders ───────────────────────────────────────────────────

/// One host render: its context and everything its functions are bound to.
struct HostRender {
    cluster: Arc<ClusterRender>,
    context: Arc<RenderContext>,
    resolver: RequestResolver,
}

impl HostRender {
    fn new(renderer: &Renderer, host: &str) -> Result<Arc<Self>, RenderError> {
        let context = Arc::new(RenderContext::for_host(&renderer.spec, host)?);
        let errors = FunctionErrors::default();
        let cluster = ClusterRender::new(
            Arc::clone(&renderer.spec),
            Arc::clone(&renderer.store),
            context.cluster_name(),
            renderer.details.clone(),
            errors,
        )?;
        let resolver = RequestResolver::new(
            Arc::clone(&renderer.spec),
            Arc::clone(&renderer.store),
            Arc::clone(&context),
        )
        .with_details(renderer.details.clone());

        Ok(Arc::new(Self {
            cluster,
            context,
            resolver,
        }))
    }

    fn errors(&self) -> &FunctionErrors {
        &self.cluster.errors
    }

    fn execute(
        &self,
        template: &Template,
        element: &str,
        functions: &FunctionTable,
    ) -> Result<String, RenderError> {
        template
            .execute(
                &self.context.name(),
                element,
                self.context.as_ref(),
                functions,
                self.cluster.details.as_deref(),
            )
            .map_err(|e| self.errors().wrap(e))
    }

    /// Functions available to every host template.
    fn base_functions(self: &Arc<Self>) -> FunctionTable {
        let mut table = self.cluster.functions();
        let errors = self.errors().clone();
        let errors = &errors;

        let this = Arc::clone(self);
        bind(&mut table, errors, "tls_key", move |name| {
            Ok(this.resolver.key_cert(name)?.key_pem())
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "tls_crt", move |name| {
            Ok(this.resolver.key_cert(name)?.cert_pem())
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "tls_dir", move |name| {
            let ca = this.resolver.ca(name)?;
            let key_cert = this.resolver.key_cert(name)?;
            let dir = join_path(TLS_DIR_ROOT, name);
            file_bundle(&[
                FileDef::new(join_path(&dir, "ca.crt"), 0o644, ca.cert),
                FileDef::new(join_path(&dir, "tls.crt"), 0o644, key_cert.cert_pem()),
                FileDef::new(join_path(&dir, "tls.key"), 0o600, key_cert.key_pem()),
            ])
        });

        let this = Arc::clone(self);
        bind(&mut table, errors, "ssh_host_keys", move |dir| {
            let pairs = this
                .cluster
                .store
                .ssh_key_pairs(this.context.cluster_name(), this.context.host_name())?;
            let mut files = Vec::with_capacity(pairs.len() * 2);
            for pair in pairs {
                let path = join_path(dir, &host_key_file_name(&pair.key_type));
                files.push(FileDef::new(format!("{path}.pub"), 0o644, pair.public));
                files.push(FileDef::new(path, 0o600, pair.private));
            }
            file_bundle(&files)
        });

        let this = Arc::clone(self);
        bind_nullary(&mut table, errors, "hosts_of_group", move || {
            let hosts: Vec<&Host> = this
                .cluster
                .spec
                .hosts_in_group(&this.context.host.group)
                .collect();
            Ok(Value::from_serialize(&hosts))
        });

        let this = Arc::clone(self);
        bind_nullary(&mut table, errors, "hosts_of_group_count", move || {
            Ok(this
                .cluster
                .spec
                .hosts_in_group(&this.context.host.group)
                .count())
        });

        let this = Arc::clone(self);
        bind_nullary(&mut table, errors, "machine_id", move || {
            Ok(machine_id(this.context.cluster_name(), this.context.host_name()))
        });

        table
    }

    /// Functions available to config templates: the base set plus
    /// `static_pods()` and `bootstrap_pods_files(dir)`.
    fn config_functions(self: &Arc<Self>) -> FunctionTable {
        let mut table = self.base_functions();
        let errors = self.errors().clone();

        let this = Arc::clone(self);
        bind_nullary(&mut table, &errors, "static_pods", move || this.static_pods());

        let this = Arc::clone(self);
        bind(&mut table, &errors, "bootstrap_pods_files", move |dir| {
            let files: Vec<FileDef> = this
                .cluster
                .bootstrap_pods()?
                .into_iter()
                .map(|pod| {
                    let content = serde_yaml::to_string(&pod.pod).map_err(|e| RenderError::Output {
                        reason: format!("bootstrap pod {}_{}: {e}", pod.namespace, pod.name),
                    })?;
                    let path = join_path(dir, &format!("{}_{}.yaml", pod.namespace, pod.name));
                    Ok(FileDef::new(path, 0o640, content))
                })
                .collect::<Result<_, RenderError>>()?;
            file_bundle(&files)
        });

        table
    }

    fn config(self: &Arc<Self>) -> Result<String, RenderError> {
        let group = &self.context.group;
        let template = self
            .cluster
            .spec
            .config_template(&group.config)
            .ok_or_else(|| TemplateError::NotFound {
                kind: "config",
                name: group.config.clone(),
            })?;
        self.execute(template, "config", &self.config_functions())
    }

    fn static_pods(self: &Arc<Self>) -> Result<String, RenderError> {
        let group = &self.context.group;
        let template = self
            .cluster
            .spec
            .static_pods_template(&group.static_pods)
            .ok_or_else(|| TemplateError::NotFound {
                kind: "static-pods",
                name: group.static_pods.clone(),
            })?;
        self.execute(template, "static-pods", &self.base_functions())
    }
}

/// A stable machine id for `host` in `cluster`: the first 16 bytes of
/// SHA-256 over `<cluster>/<host>`, as 32 hex digits.
#[must_use]
pub fn machine_id(cluster: &str, host: &str) -> String {
    let digest = Sha256::digest(format!("{cluster}/{host}").as_bytes());
    hex::encode(&digest[..16])
}

/// Re-insert every object's keys in sorted order.
fn canonical_json(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonical_json(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonical_json).collect())
        }
        other => other,
    }
}

// ── renderer ───────────────────────────────────────────────────────

/// Renders host and cluster documents from a specification and a store.
#[derive(Debug, Clone)]
pub struct Renderer {
    spec: Arc<ClusterSpec>,
    store: Arc<SecretStore>,
    details: Option<Arc<Details>>,
}

impl Renderer {
    pub fn new(spec: Arc<ClusterSpec>, store: Arc<SecretStore>) -> Self {
        Self {
            spec,
            store,
            details: None,
        }
    }

    /// Record every template execution under `details`.
    #[must_use]
    pub fn with_details(mut self, details: Details) -> Self {
        info!(dir = %details.dir().display(), "recording template details");
        self.details = Some(Arc::new(details));
        self
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    /// The render context of `host`.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown hosts, groups, or clusters.
    pub fn context(&self, host: &str) -> Result<RenderContext, RenderError> {
        Ok(RenderContext::for_host(&self.spec, host)?)
    }

    async fn run<T, F>(&self, what: &str, render: F) -> Result<T, RenderError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, RenderError> + Send + 'static,
    {
        let result = tokio::task::spawn_blocking(render)
            .await
            .map_err(|e| RenderError::Task {
                reason: format!("{what}: {e}"),
            })?;

        let value = result?;
        if self.store.changed() {
            self.store.save().await?;
        }
        Ok(value)
    }

    /// Render and parse the config of `host`.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for missing hosts, templates, or certificate
    /// requests; any other failure is internal.
    pub async fn config(&self, host: &str) -> Result<RenderedConfig, RenderError> {
        info!(host = %host, "rendering config");
        let render = HostRender::new(self, host)?;
        let raw = self.run("config", move || render.config()).await?;

        let config: HostConfig = serde_yaml::from_str(&raw).map_err(|e| RenderError::Output {
            reason: format!("config of host {host:?}: {e}"),
        })?;
        debug!(host = %host, files = config.files.len(), "rendered config");

        Ok(RenderedConfig { raw, config })
    }

    /// Render the static-pods document of `host`.
    ///
    /// # Errors
    ///
    /// As for [`config`](Self::config).
    pub async fn static_pods(&self, host: &str) -> Result<String, RenderError> {
        info!(host = %host, "rendering static pods");
        let render = HostRender::new(self, host)?;
        self.run("static-pods", move || render.static_pods()).await
    }

    fn cluster_render(&self, cluster: &str) -> Result<Arc<ClusterRender>, RenderError> {
        ClusterRender::new(
            Arc::clone(&self.spec),
            Arc::clone(&self.store),
            cluster,
            self.details.clone(),
            FunctionErrors::default(),
        )
    }

    /// Render the addon set of `cluster` as a multi-document stream.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown clusters or addon sets.
    pub async fn addons(&self, cluster: &str) -> Result<String, RenderError> {
        info!(cluster = %cluster, "rendering addons");
        let render = self.cluster_render(cluster)?;
        self.run("addons", move || render.addons()).await
    }

    /// Render the bootstrap-pods set of `cluster` as a multi-document stream.
    ///
    /// # Errors
    ///
    /// Returns not-found errors for unknown clusters or sets.
    pub async fn bootstrap_pods(&self, cluster: &str) -> Result<String, RenderError> {
        info!(cluster = %cluster, "rendering bootstrap pods");
        let render = self.cluster_render(cluster)?;
        self.run("bootstrap-pods", move || render.bootstrap_pods_stream())
            .await
    }

    /// The fingerprint of `host`: hex SHA-256 over the canonical JSON of its
    /// parsed config and its render context.
    ///
    /// # Errors
    ///
    /// As for [`config`](Self::config).
    pub async fn tag(&self, host: &str) -> Result<String, RenderError> {
        let rendered = self.config(host).await?;
        let context = self.context(host)?;

        let to_json = |what: &str, value: Result<serde_json::Value, serde_json::Error>| {
            value.map(canonical_json).map_err(|e| RenderError::Output {
                reason: format!("{what} of host {host:?} is not serializable: {e}"),
            })
        };
        let config = to_json("config", serde_json::to_value(&rendered.config))?;
        let context = to_json("context", serde_json::to_value(&context))?;

        let encoded = serde_json::to_vec(&[config, context]).map_err(|e| RenderError::Output {
            reason: e.to_string(),
        })?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}
