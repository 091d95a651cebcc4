//! Core library for plinth.
//!
//! Plinth turns a declarative cluster specification (hosts, groups, clusters,
//! templates and certificate request definitions) into per-host boot
//! configuration. Templates call back into a per-cluster secret store that
//! lazily creates CAs, certificates, tokens and SSH host keys, and persists
//! them as one snapshot through a [`plinth_storage::SnapshotBackend`].
//!
//! # Modules
//!
//! - [`spec`]: the cluster specification and its lookups
//! - [`scope`]: cluster → group → host composition into a [`RenderContext`]
//! - [`template`]: named templates, function tables and render diagnostics
//! - [`pki`]: certificate requests, signing policy and X.509 issuance
//! - [`ssh`]: SSH host key generation
//! - [`secrets`]: the persistent per-cluster [`SecretStore`]
//! - [`resolver`]: certificate request resolution for one host
//! - [`render`]: the [`Renderer`] that ties it all together

pub mod error;
pub mod pki;
pub mod render;
pub mod resolver;
pub mod scope;
pub mod secrets;
pub mod spec;
pub mod ssh;
pub mod template;

pub use error::{RenderError, SecretError, SpecError, TemplateError};
pub use pki::{CertRequest, SigningPolicy};
pub use render::{FileDef, HostConfig, RenderedConfig, Renderer};
pub use scope::RenderContext;
pub use secrets::SecretStore;
pub use spec::ClusterSpec;
pub use ssh::{SshKeyGenerator, SshKeygen};
pub use template::{Details, Template};
