//! Certificate request resolution.
//!
//! Turns a certificate request name into an issued [`KeyCert`]: look up the
//! definition, render its template against the host's render context (no
//! functions bound), parse the JSON payload, and ask the store to issue or
//! reuse a certificate under the request's key.

use std::sync::Arc;

use tracing::debug;

use crate::error::RenderError;
use crate::pki::{CertRequest, IssuedPem, KeyRequest};
use crate::scope::RenderContext;
use crate::secrets::{KeyCert, SecretStore};
use crate::spec::{CertRequestDef, ClusterSpec};
use crate::template::{Details, FunctionTable};

/// Resolves certificate requests for one host render.
#[derive(Debug, Clone)]
pub struct RequestResolver {
    spec: Arc<ClusterSpec>,
    store: Arc<SecretStore>,
    context: Arc<RenderContext>,
    details: Option<Arc<Details>>,
}

impl RequestResolver {
    pub fn new(spec: Arc<ClusterSpec>, store: Arc<SecretStore>, context: Arc<RenderContext>) -> Self {
        Self {
            spec,
            store,
            context,
            details: None,
        }
    }

    /// Record CSR template executions under `details`.
    #[must_use]
    pub fn with_details(mut self, details: Option<Arc<Details>>) -> Self {
        self.details = details;
        self
    }

    /// The definition named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::NotFound`] if there is no such definition or it
    /// names no CA.
    pub fn definition(&self, name: &str) -> Result<&CertRequestDef, RenderError> {
        let def = self.spec.csr(name).ok_or_else(|| RenderError::NotFound {
            what: format!("certificate request {name:?}"),
        })?;

        if def.ca.is_empty() {
            return Err(RenderError::NotFound {
                what: format!("CA of certificate request {name:?}"),
            });
        }
        Ok(def)
    }

    /// Render and parse the request `name`. A request without a `key`
    /// section gets the default ECDSA P-256 key, so implicit and explicit
    /// defaults hash equally.
    ///
    /// # Errors
    ///
    /// Returns not-found errors from [`definition`](Self::definition), template
    /// errors, or [`RenderError::InvalidRequest`] if the payload is not a
    /// certificate request.
    pub fn request(&self, name: &str) -> Result<CertRequest, RenderError> {
        let def = self.definition(name)?;

        let payload = def.template.execute(
            &self.context.name(),
            &format!("req:{name}"),
            self.context.as_ref(),
            &FunctionTable::new(),
            self.details.as_deref(),
        )?;

        let mut request: CertRequest =
            serde_json::from_str(&payload).map_err(|e| RenderError::InvalidRequest {
                name: name.to_owned(),
                reason: format!("payload is not a certificate request: {e}"),
            })?;
        if request.key.is_none() {
            request.key = Some(KeyRequest::default());
        }
        Ok(request)
    }

    /// The store key of a request: its name, plus `/<host>` when issued per
    /// host.
    #[must_use]
    pub fn store_key(&self, def: &CertRequestDef) -> String {
        if def.per_host {
            format!("{}/{}", def.name(), self.context.host_name())
        } else {
            def.name().to_owned()
        }
    }

    /// Issue, or reuse, the certificate for request `name`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); store errors are passed through.
    pub fn key_cert(&self, name: &str) -> Result<KeyCert, RenderError> {
        let def = self.definition(name)?;
        let request = self.request(name)?;
        let key = self.store_key(def);

        debug!(
            context = %self.context.name(),
            request = %name,
            key = %key,
            ca = %def.ca,
            "resolving certificate request"
        );

        Ok(self.store.key_cert(
            self.context.cluster_name(),
            &def.ca,
            &key,
            &def.profile,
            &def.label,
            &request,
        )?)
    }

    /// The CA that signs request `name`.
    ///
    /// # Errors
    ///
    /// Returns not-found errors from [`definition`](Self::definition) or
    /// store errors.
    pub fn ca(&self, name: &str) -> Result<IssuedPem, RenderError> {
        let def = self.definition(name)?;
        Ok(self.store.ca(self.context.cluster_name(), &def.ca)?)
    }
}
