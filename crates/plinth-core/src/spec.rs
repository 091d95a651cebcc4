//! Cluster specification model.
//!
//! One YAML document describes every host, group, and cluster this server
//! bootstraps, along with the named templates they reference and the
//! certificate request definitions used by `tls_*` template functions. The
//! specification is loaded once and is immutable during renders; compiled
//! template forms are cached inside it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::SpecError;
use crate::template::Template;

/// User-defined key/values, arbitrarily nested.
pub type Vars = serde_yaml::Mapping;

/// A host served by this server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    pub mac: String,
    pub ip: String,
    pub ips: Vec<String>,
    pub cluster: String,
    pub group: String,
    pub vars: Vars,
}

impl Host {
    /// Whether `ip` is this host's primary IP or one of its extra IPs.
    #[must_use]
    pub fn has_ip(&self, ip: &str) -> bool {
        self.ip == ip || self.ips.iter().any(|other| other == ip)
    }
}

/// A group of hosts sharing templates and boot artifact versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Group {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    pub master: bool,
    pub ipxe: String,
    pub kernel: String,
    pub initrd: String,
    /// Name of the config template.
    pub config: String,
    /// Name of the static-pods template.
    pub static_pods: String,
    pub versions: BTreeMap<String, String>,
    pub vars: Vars,
}

/// Cluster subnets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnets {
    pub services: String,
    pub pods: String,
}

/// A cluster of hosts, carrying cluster-wide variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Cluster {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    pub domain: String,
    /// Name of the addon template set.
    pub addons: String,
    /// Name of the bootstrap-pods template set.
    pub bootstrap_pods: String,
    pub subnets: Subnets,
    pub vars: Vars,
}

impl Cluster {
    /// IP of the Kubernetes API service: first address after the services
    /// network address.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidSubnet`] if the services subnet is invalid.
    pub fn kubernetes_svc_ip(&self) -> Result<IpAddr, SpecError> {
        self.nth_svc_ip(1)
    }

    /// IP of the cluster DNS service: second address of the services subnet.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidSubnet`] if the services subnet is invalid.
    pub fn dns_svc_ip(&self) -> Result<IpAddr, SpecError> {
        self.nth_svc_ip(2)
    }

    /// The services network address plus `n`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::InvalidSubnet`] if the services subnet is not a
    /// CIDR or is too small to hold the `n`th address.
    pub fn nth_svc_ip(&self, n: u8) -> Result<IpAddr, SpecError> {
        let invalid = |reason: String| SpecError::InvalidSubnet {
            cluster: self.name.clone(),
            reason,
        };

        let net: IpNet = self
            .subnets
            .services
            .parse()
            .map_err(|e| invalid(format!("{:?}: {e}", self.subnets.services)))?;

        let ip = match net.network() {
            IpAddr::V4(base) => u32::from(base)
                .checked_add(u32::from(n))
                .map(|v| IpAddr::from(std::net::Ipv4Addr::from(v))),
            IpAddr::V6(base) => u128::from(base)
                .checked_add(u128::from(n))
                .map(|v| IpAddr::from(std::net::Ipv6Addr::from(v))),
        };

        match ip {
            Some(ip) if net.contains(&ip) => Ok(ip),
            _ => Err(invalid(format!("{net} has no address #{n}"))),
        }
    }
}

/// A certificate request definition.
///
/// The embedded template renders (against the host's render context) into a
/// JSON [`CertRequest`](crate::pki::CertRequest) payload.
#[derive(Debug, Deserialize)]
pub struct CertRequestDef {
    #[serde(flatten)]
    pub template: Template,
    /// Name of the CA that signs this request.
    #[serde(default)]
    pub ca: String,
    /// Signing profile from the cluster signing policy.
    #[serde(default)]
    pub profile: String,
    /// Signing label.
    #[serde(default)]
    pub label: String,
    /// Issue one certificate per host instead of one per cluster.
    #[serde(default)]
    pub per_host: bool,
}

impl CertRequestDef {
    /// Request name (the template name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.template.name
    }
}

/// The full cluster specification.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    pub hosts: Vec<Host>,
    pub groups: Vec<Group>,
    pub clusters: Vec<Cluster>,
    pub configs: Vec<Template>,
    pub static_pods: Vec<Template>,
    pub bootstrap_pods: BTreeMap<String, Vec<Template>>,
    pub addons: BTreeMap<String, Vec<Template>>,
    /// cfssl-style signing policy (JSON or YAML); empty means the default.
    pub ssl_config: String,
    pub cert_requests: Vec<CertRequestDef>,
}

fn not_found(kind: &'static str, name: &str) -> SpecError {
    SpecError::NotFound {
        kind,
        name: name.to_owned(),
    }
}

impl ClusterSpec {
    /// Parse a specification from YAML.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Parse`] if the document is not a valid specification.
    pub fn from_yaml(data: &str) -> Result<Self, SpecError> {
        serde_yaml::from_str(data).map_err(|e| SpecError::Parse {
            reason: e.to_string(),
        })
    }

    /// Read and parse a specification file.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Io`] if the file cannot be read, or
    /// [`SpecError::Parse`] if it is not a valid specification.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| SpecError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&data)
    }

    /// Look up a host by name.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if no such host exists.
    pub fn host(&self, name: &str) -> Result<&Host, SpecError> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| not_found("host", name))
    }

    /// Look up a host by any of its IPs.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if no host has this IP.
    pub fn host_by_ip(&self, ip: &str) -> Result<&Host, SpecError> {
        self.hosts
            .iter()
            .find(|h| h.has_ip(ip))
            .ok_or_else(|| not_found("host with IP", ip))
    }

    /// Look up a host by MAC address. Case-insensitive; `-` separators are
    /// accepted in place of `:`.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if no host has this MAC.
    pub fn host_by_mac(&self, mac: &str) -> Result<&Host, SpecError> {
        let wanted = mac.to_lowercase().replace('-', ":");
        self.hosts
            .iter()
            .find(|h| h.mac.to_lowercase() == wanted)
            .ok_or_else(|| not_found("host with MAC", mac))
    }

    /// Hosts belonging to `group`, in specification order.
    pub fn hosts_in_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Host> + 'a {
        self.hosts.iter().filter(move |h| h.group == group)
    }

    /// Look up a group by name.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if no such group exists.
    pub fn group(&self, name: &str) -> Result<&Group, SpecError> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| not_found("group", name))
    }

    /// Look up a cluster by name.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::NotFound`] if no such cluster exists.
    pub fn cluster(&self, name: &str) -> Result<&Cluster, SpecError> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| not_found("cluster", name))
    }

    /// Look up a config template by name.
    #[must_use]
    pub fn config_template(&self, name: &str) -> Option<&Template> {
        self.configs.iter().find(|t| t.name == name)
    }

    /// Look up a static-pods template by name.
    #[must_use]
    pub fn static_pods_template(&self, name: &str) -> Option<&Template> {
        self.static_pods.iter().find(|t| t.name == name)
    }

    /// Look up a certificate request definition by name.
    #[must_use]
    pub fn csr(&self, name: &str) -> Option<&CertRequestDef> {
        self.cert_requests.iter().find(|r| r.name() == name)
    }
}
