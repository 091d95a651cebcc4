//! Error types for `plinth-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Secret errors never include key material, only cluster, CA
//! and certificate names or operation descriptions.
//!
//! Every layer keeps "not found" as its own variant so the caller of the
//! render pipeline can tell an absent resource from an internal failure; see
//! [`RenderError::is_not_found`].

use plinth_storage::StorageError;

/// Errors from loading or querying the cluster specification.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// A named host, group, cluster, or template does not exist.
    #[error("no {kind} named '{name}'")]
    NotFound { kind: &'static str, name: String },

    /// The specification document could not be parsed.
    #[error("invalid cluster specification: {reason}")]
    Parse { reason: String },

    /// The specification file could not be read.
    #[error("failed to read specification '{path}': {reason}")]
    Io { path: String, reason: String },

    /// A cluster's services subnet is not a valid CIDR.
    #[error("cluster '{cluster}': invalid services subnet: {reason}")]
    InvalidSubnet { cluster: String, reason: String },
}

/// Errors from compiling or executing templates.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// The named template is not defined.
    #[error("no {kind} template named '{name}'")]
    NotFound { kind: &'static str, name: String },

    /// The template body failed to compile. Cached; never retried.
    #[error("template '{name}' failed to compile: {reason}")]
    Compile { name: String, reason: String },

    /// The template failed at runtime.
    #[error("{context}: failed to render {element} [{template}]: {source}")]
    Execute {
        context: String,
        element: String,
        template: String,
        #[source]
        source: minijinja::Error,
    },

    /// The render context could not be converted to template data.
    #[error("template data for '{name}' is not serializable: {reason}")]
    Data { name: String, reason: String },
}

/// Errors from the certificate and secret store.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// A certificate request host is neither an IP nor a DNS name.
    #[error("{path}: {host:?} is not an IP or FQDN")]
    InvalidHost { path: String, host: String },

    /// A certificate request tried to nominate its own CA.
    #[error("certificate request '{name}': no CA section allowed here")]
    CaSectionNotAllowed { name: String },

    /// The requested key algorithm or size cannot be generated.
    #[error("unsupported key request: algo '{algo}' size {size}")]
    UnsupportedKey { algo: String, size: u32 },

    /// Private key generation failed.
    #[error("key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Building or self-signing a CA certificate failed.
    #[error("certificate generation failed: {reason}")]
    CertGeneration { reason: String },

    /// Signing a leaf certificate with a CA failed.
    #[error("certificate signing failed for '{name}': {reason}")]
    Signing { name: String, reason: String },

    /// The signing policy document is invalid.
    #[error("invalid signing policy: {reason}")]
    Policy { reason: String },

    /// `ssh-keygen` (or another SSH key generator) failed.
    #[error("ssh {key_type} key generation failed: {reason}")]
    SshKeygen { key_type: String, reason: String },

    /// The snapshot could not be encoded.
    #[error("secret snapshot serialization failed: {reason}")]
    Serialization { reason: String },

    /// The persisted snapshot could not be decoded.
    #[error("secret snapshot is corrupt: {reason}")]
    Snapshot { reason: String },

    /// A thread panicked while holding the store lock.
    #[error("secret store lock poisoned")]
    LockPoisoned,

    /// The snapshot backend failed.
    #[error("secret store persistence error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors surfaced by the render pipeline.
///
/// Errors raised inside template functions are carried through the template
/// engine unchanged in [`RenderError::Function`], so a missing CSR definition
/// deep inside a config template is still reported as not-found.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// A referenced resource is absent.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A certificate request definition is unusable.
    #[error("certificate request '{name}': {reason}")]
    InvalidRequest { name: String, reason: String },

    /// The rendered document could not be parsed or serialized.
    #[error("invalid rendered output: {reason}")]
    Output { reason: String },

    /// A template function failed.
    #[error("{function}: {source}")]
    Function {
        function: String,
        #[source]
        source: Box<RenderError>,
    },

    /// Specification lookup or parsing failed.
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// Template compilation or execution failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The secret store failed.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// The blocking render task was cancelled or panicked.
    #[error("render task failed: {reason}")]
    Task { reason: String },
}

impl RenderError {
    /// Whether this error means "resource absent" rather than an internal
    /// failure. Looks through wrapped template-function errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. }
            | Self::Spec(SpecError::NotFound { .. })
            | Self::Template(TemplateError::NotFound { .. }) => true,
            Self::Function { source, .. } => source.is_not_found(),
            Self::InvalidRequest { .. }
            | Self::Output { .. }
            | Self::Spec(_)
            | Self::Template(_)
            | Self::Secret(_)
            | Self::Task { .. } => false,
        }
    }
}
