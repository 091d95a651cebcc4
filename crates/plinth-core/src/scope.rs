//! Scope composition: one effective render context per host.
//!
//! Vars are layered cluster → group → host with [`deep_merge`]; labels and
//! annotations use a flat merge in the same order. The resulting
//! [`RenderContext`] is the data every template of a host render sees.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::error::SpecError;
use crate::spec::{Cluster, ClusterSpec, Group, Host, Vars};

/// Merge `later` over `earlier`.
///
/// Two mappings merge key by key, recursively; in every other case
/// (scalars, sequences, or a type mismatch) `later` wins outright.
#[must_use]
pub fn deep_merge(earlier: Value, later: Value) -> Value {
    match (earlier, later) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            merge_mapping(&mut base, overlay);
            Value::Mapping(base)
        }
        (_, later) => later,
    }
}

/// Merge every key of `overlay` into `base` with [`deep_merge`] semantics.
///
/// Overridden keys keep their position in `base`; new keys are appended in
/// overlay order.
pub fn merge_mapping(base: &mut Mapping, overlay: Mapping) {
    for (key, value) in overlay {
        if let Some(slot) = base.get_mut(&key) {
            let existing = std::mem::take(slot);
            *slot = deep_merge(existing, value);
        } else {
            base.insert(key, value);
        }
    }
}

/// Cluster as seen by templates, with service IPs derived from its subnets.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterScope {
    #[serde(flatten)]
    pub cluster: Cluster,
    /// First address of the services subnet; absent without a subnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_svc_ip: Option<String>,
    /// Second address of the services subnet; absent without a subnet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_svc_ip: Option<String>,
}

impl ClusterScope {
    /// Derive the template view of `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidSubnet`] for a malformed services subnet.
    pub fn new(cluster: &Cluster) -> Result<Self, SpecError> {
        let (kubernetes_svc_ip, dns_svc_ip) = if cluster.subnets.services.is_empty() {
            (None, None)
        } else {
            (
                Some(cluster.kubernetes_svc_ip()?.to_string()),
                Some(cluster.dns_svc_ip()?.to_string()),
            )
        };

        Ok(Self {
            cluster: cluster.clone(),
            kubernetes_svc_ip,
            dns_svc_ip,
        })
    }
}

/// The composed, effective scope of one host.
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub host: Host,
    pub group: Group,
    pub cluster: ClusterScope,
    pub vars: Vars,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl RenderContext {
    /// Compose the context for `host_name`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if the host, its group, or its cluster
    /// is missing, or [`SpecError::InvalidSubnet`] for a malformed services
    /// subnet.
    pub fn for_host(spec: &ClusterSpec, host_name: &str) -> Result<Self, SpecError> {
        let host = spec.host(host_name)?;
        let group = spec.group(&host.group)?;
        let cluster = spec.cluster(&host.cluster)?;
        Self::compose(cluster, group, host)
    }

    /// Compose the context from already-resolved layers.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidSubnet`] for a malformed services subnet.
    pub fn compose(cluster: &Cluster, group: &Group, host: &Host) -> Result<Self, SpecError> {
        let mut vars = cluster.vars.clone();
        merge_mapping(&mut vars, group.vars.clone());
        merge_mapping(&mut vars, host.vars.clone());

        let mut labels = cluster.labels.clone();
        labels.extend(group.labels.clone());
        labels.extend(host.labels.clone());

        let mut annotations = cluster.annotations.clone();
        annotations.extend(group.annotations.clone());
        annotations.extend(host.annotations.clone());

        Ok(Self {
            host: host.clone(),
            group: group.clone(),
            cluster: ClusterScope::new(cluster)?,
            vars,
            labels,
            annotations,
        })
    }

    /// Display name used in diagnostics: `host:<name>`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("host:{}", self.host.name)
    }

    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host.name
    }

    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster.cluster.name
    }
}
