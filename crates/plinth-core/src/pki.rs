//! PKI primitives for the embedded per-cluster certificate authorities.
//!
//! Certificate requests use the cfssl JSON shape (`CN`, `names`, `hosts`,
//! `key`) so existing request templates keep working. Signing policies use
//! the cfssl `signing` document: a default profile plus named profiles, each
//! with an expiry (`"8760h"`) and a list of usages.
//!
//! All key and certificate generation goes through `rcgen`. Supported leaf
//! keys: ECDSA P-256, P-384 and P-521, Ed25519, and RSA 2048, 3072 and 4096.
//! CAs are always ECDSA P-384.
//!
//! Request fields outside the cfssl shape modeled here are rejected rather
//! than ignored, so every accepted field takes part in the request hash.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PrintableString, RsaKeySize,
    SerialNumber,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::SecretError;

/// CA common name.
pub const CA_COMMON_NAME: &str = "Plinth Boot Server";
/// CA organization.
pub const CA_ORGANIZATION: &str = "plinth";
/// CA validity, in years.
const CA_VALIDITY_YEARS: i64 = 5;
/// Expiry of the built-in default profile (one week, as in cfssl).
const DEFAULT_EXPIRY: Duration = Duration::from_secs(168 * 3600);
const MAX_DNS_NAME_LEN: usize = 253;
/// X.520 `serialNumber` attribute.
const OID_SERIAL_NUMBER: [u64; 4] = [2, 5, 4, 5];

// ── Certificate requests ───────────────────────────────────────────

/// One subject name entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Name {
    #[serde(rename = "C", default)]
    pub country: String,
    #[serde(rename = "ST", default)]
    pub state: String,
    #[serde(rename = "L", default)]
    pub locality: String,
    #[serde(rename = "O", default)]
    pub organization: String,
    #[serde(rename = "OU", default)]
    pub organizational_unit: String,
    #[serde(rename = "SerialNumber", default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
}

/// Requested key algorithm and size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyRequest {
    pub algo: String,
    #[serde(default)]
    pub size: u32,
}

impl Default for KeyRequest {
    fn default() -> Self {
        Self {
            algo: "ecdsa".to_owned(),
            size: 256,
        }
    }
}

impl KeyRequest {
    /// Generate a key of the requested algorithm and size. A zero size picks
    /// the cfssl default for the algorithm.
    fn generate(&self, name: &str) -> Result<KeyPair, SecretError> {
        let unsupported = || SecretError::UnsupportedKey {
            algo: self.algo.clone(),
            size: self.size,
        };

        let generated = match (self.algo.as_str(), self.size) {
            ("ecdsa", 0 | 256) => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
            ("ecdsa", 384) => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
            ("ecdsa", 521) => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P521_SHA512),
            ("ed25519", _) => KeyPair::generate_for(&rcgen::PKCS_ED25519),
            ("rsa", size) => {
                let size = match size {
                    0 | 2048 => RsaKeySize::_2048,
                    3072 => RsaKeySize::_3072,
                    4096 => RsaKeySize::_4096,
                    _ => return Err(unsupported()),
                };
                KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, size)
            }
            _ => return Err(unsupported()),
        };

        generated.map_err(|e| SecretError::KeyGeneration {
            reason: format!("{name}: {e}"),
        })
    }
}

/// A concrete certificate request, as rendered from a CSR template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertRequest {
    #[serde(rename = "CN", default)]
    pub common_name: String,
    #[serde(default)]
    pub names: Vec<Name>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyRequest>,
    /// Subject serial number; overrides any `names[].SerialNumber`.
    #[serde(rename = "serialnumber", default, skip_serializing_if = "String::is_empty")]
    pub serial_number: String,
    /// Requests may not nominate their CA; only kept to reject it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<serde_json::Value>,
}

impl CertRequest {
    /// Whether the request embeds a CA section.
    #[must_use]
    pub fn has_ca_section(&self) -> bool {
        self.ca.is_some()
    }

    /// Check every host entry; `path` prefixes the offending index in errors
    /// (`c1.etcd` gives `c1.etcd.hosts[2]`).
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidHost`] for the first invalid entry.
    pub fn validate_hosts(&self, path: &str) -> Result<(), SecretError> {
        match self.hosts.iter().position(|h| !is_valid_host(h)) {
            Some(idx) => Err(SecretError::InvalidHost {
                path: format!("{path}.hosts[{idx}]"),
                host: self.hosts[idx].clone(),
            }),
            None => Ok(()),
        }
    }

    /// Canonical hash of the request payload: SHA-256 over its JSON encoding,
    /// unpadded base64. Field order is fixed by the struct, so equal requests
    /// always hash equally.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Serialization`] if the request cannot be encoded.
    pub fn hash(&self) -> Result<String, SecretError> {
        let encoded = serde_json::to_vec(&[self]).map_err(|e| SecretError::Serialization {
            reason: e.to_string(),
        })?;
        Ok(STANDARD_NO_PAD.encode(Sha256::digest(&encoded)))
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        let mut push = |ty: DnType, value: &str| {
            if !value.is_empty() {
                dn.push(ty, DnValue::Utf8String(value.to_owned()));
            }
        };

        for name in &self.names {
            push(DnType::CountryName, &name.country);
            push(DnType::StateOrProvinceName, &name.state);
            push(DnType::LocalityName, &name.locality);
            push(DnType::OrganizationName, &name.organization);
            push(DnType::OrganizationalUnitName, &name.organizational_unit);
        }
        push(DnType::CommonName, &self.common_name);

        let serial = self
            .names
            .iter()
            .map(|name| name.serial_number.as_str())
            .chain(std::iter::once(self.serial_number.as_str()))
            .rev()
            .find(|serial| !serial.is_empty());
        if let Some(serial) = serial {
            let value = PrintableString::try_from(serial)
                .map_or_else(|_| DnValue::Utf8String(serial.to_owned()), DnValue::PrintableString);
            dn.push(DnType::CustomDnType(OID_SERIAL_NUMBER.to_vec()), value);
        }
        dn
    }
}

#[allow(clippy::expect_used)]
static DNS_1123_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS-1123 pattern compiles")
});

/// Whether `host` is a literal IP, a DNS-1123 subdomain, a wildcard
/// subdomain (`*.example.com`), or `*`.
#[must_use]
pub fn is_valid_host(host: &str) -> bool {
    if host == "*" || host.parse::<IpAddr>().is_ok() {
        return true;
    }
    if host.len() > MAX_DNS_NAME_LEN {
        return false;
    }
    let name = host.strip_prefix("*.").unwrap_or(host);
    DNS_1123_SUBDOMAIN.is_match(name)
}

// ── Signing policy ─────────────────────────────────────────────────

/// A resolved signing profile.
#[derive(Debug, Clone, PartialEq)]
pub struct SigningProfile {
    pub expiry: Duration,
    pub key_usages: Vec<KeyUsagePurpose>,
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
}

impl Default for SigningProfile {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            key_usages: vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            extended_key_usages: vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    signing: SigningSection,
}

#[derive(Debug, Default, Deserialize)]
struct SigningSection {
    default: Option<ProfileDocument>,
    #[serde(default)]
    profiles: BTreeMap<String, ProfileDocument>,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileDocument {
    expiry: Option<String>,
    usages: Option<Vec<String>>,
}

/// The cluster signing policy: a default profile and named profiles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SigningPolicy {
    default: SigningProfile,
    profiles: BTreeMap<String, SigningProfile>,
}

impl SigningPolicy {
    /// Parse a cfssl-style policy document (JSON or YAML). An empty or blank
    /// document yields the built-in default policy.
    ///
    /// Profiles without an expiry or usages inherit them from the default.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Policy`] on malformed documents, unknown usages,
    /// or unparsable expiries.
    pub fn parse(document: &str) -> Result<Self, SecretError> {
        if document.trim().is_empty() {
            return Ok(Self::default());
        }

        let doc: PolicyDocument = serde_json::from_str(document)
            .or_else(|_| serde_yaml::from_str(document))
            .map_err(|e| SecretError::Policy {
                reason: e.to_string(),
            })?;

        let base = SigningProfile::default();
        let default = match doc.signing.default {
            Some(def) => resolve_profile(&def, &base)?,
            None => base,
        };

        let profiles = doc
            .signing
            .profiles
            .iter()
            .map(|(name, def)| {
                resolve_profile(def, &default)
                    .map(|profile| (name.clone(), profile))
                    .map_err(|e| match e {
                        SecretError::Policy { reason } => SecretError::Policy {
                            reason: format!("profile '{name}': {reason}"),
                        },
                        other => other,
                    })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { default, profiles })
    }

    /// The named profile, or the default one when `name` is empty or unknown.
    #[must_use]
    pub fn profile(&self, name: &str) -> &SigningProfile {
        self.profiles.get(name).unwrap_or(&self.default)
    }

    /// Names of the explicitly defined profiles.
    pub fn profile_names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

fn resolve_profile(
    def: &ProfileDocument,
    fallback: &SigningProfile,
) -> Result<SigningProfile, SecretError> {
    let expiry = match &def.expiry {
        Some(expiry) => parse_expiry(expiry)?,
        None => fallback.expiry,
    };

    let (key_usages, extended_key_usages) = match &def.usages {
        Some(usages) => parse_usages(usages)?,
        None => (
            fallback.key_usages.clone(),
            fallback.extended_key_usages.clone(),
        ),
    };

    Ok(SigningProfile {
        expiry,
        key_usages,
        extended_key_usages,
    })
}

fn parse_usages(
    usages: &[String],
) -> Result<(Vec<KeyUsagePurpose>, Vec<ExtendedKeyUsagePurpose>), SecretError> {
    let mut key_usages = Vec::new();
    let mut extended = Vec::new();

    for usage in usages {
        match usage.as_str() {
            "signing" | "digital signature" => key_usages.push(KeyUsagePurpose::DigitalSignature),
            "content commitment" => key_usages.push(KeyUsagePurpose::ContentCommitment),
            "key encipherment" => key_usages.push(KeyUsagePurpose::KeyEncipherment),
            "data encipherment" => key_usages.push(KeyUsagePurpose::DataEncipherment),
            "key agreement" => key_usages.push(KeyUsagePurpose::KeyAgreement),
            "cert sign" => key_usages.push(KeyUsagePurpose::KeyCertSign),
            "crl sign" => key_usages.push(KeyUsagePurpose::CrlSign),
            "encipher only" => key_usages.push(KeyUsagePurpose::EncipherOnly),
            "decipher only" => key_usages.push(KeyUsagePurpose::DecipherOnly),
            "any" => extended.push(ExtendedKeyUsagePurpose::Any),
            "server auth" => extended.push(ExtendedKeyUsagePurpose::ServerAuth),
            "client auth" => extended.push(ExtendedKeyUsagePurpose::ClientAuth),
            "code signing" => extended.push(ExtendedKeyUsagePurpose::CodeSigning),
            "email protection" | "s/mime" => extended.push(ExtendedKeyUsagePurpose::EmailProtection),
            "timestamping" => extended.push(ExtendedKeyUsagePurpose::TimeStamping),
            "ocsp signing" => extended.push(ExtendedKeyUsagePurpose::OcspSigning),
            other => {
                return Err(SecretError::Policy {
                    reason: format!("unknown usage {other:?}"),
                });
            }
        }
    }

    key_usages.dedup();
    extended.dedup();
    Ok((key_usages, extended))
}

/// Parse a duration such as `"8760h"`, `"1h30m"` or `"90s"`.
///
/// # Errors
///
/// Returns [`SecretError::Policy`] if the string is not a sequence of
/// `<number><h|m|s>` terms.
pub fn parse_expiry(value: &str) -> Result<Duration, SecretError> {
    let invalid = || SecretError::Policy {
        reason: format!("invalid expiry {value:?}"),
    };

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in value.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        total = n
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
        digits.clear();
    }

    if !digits.is_empty() || total == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

// ── Issuance ───────────────────────────────────────────────────────

/// A PEM private key and its PEM certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedPem {
    pub key: String,
    pub cert: String,
}

impl std::fmt::Debug for IssuedPem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedPem")
            .field("cert_len", &self.cert.len())
            .finish_non_exhaustive()
    }
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Keep the DER integer positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Generate a new self-signed CA with a fixed subject and an ECDSA P-384 key.
///
/// # Errors
///
/// Returns [`SecretError::KeyGeneration`] or [`SecretError::CertGeneration`]
/// if `rcgen` fails.
pub fn generate_ca() -> Result<IssuedPem, SecretError> {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).map_err(|e| {
        SecretError::KeyGeneration {
            reason: format!("failed to generate CA key: {e}"),
        }
    })?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(CA_COMMON_NAME.to_owned()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(CA_ORGANIZATION.to_owned()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now
        .checked_add(time::Duration::days(365 * CA_VALIDITY_YEARS))
        .unwrap_or(now);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SecretError::CertGeneration {
            reason: format!("failed to self-sign CA: {e}"),
        })?;

    Ok(IssuedPem {
        key: key_pair.serialize_pem(),
        cert: cert.pem(),
    })
}

/// Generate a key for `request` and sign it with the CA under `profile`.
///
/// `name` only identifies the certificate in errors and logs; `label` is
/// accepted for compatibility with cfssl signing requests and logged.
///
/// # Errors
///
/// - [`SecretError::UnsupportedKey`] for key algorithms that cannot be generated.
/// - [`SecretError::Signing`] if the CA material cannot be loaded or signing fails.
pub fn sign(
    ca: &IssuedPem,
    name: &str,
    profile: &SigningProfile,
    label: &str,
    request: &CertRequest,
) -> Result<IssuedPem, SecretError> {
    let signing = |reason: String| SecretError::Signing {
        name: name.to_owned(),
        reason,
    };

    let leaf_key = request.key.clone().unwrap_or_default().generate(name)?;

    let ca_key = KeyPair::from_pem(&ca.key).map_err(|e| signing(format!("CA key: {e}")))?;
    let ca_cert = CertificateParams::from_ca_cert_pem(&ca.cert)
        .and_then(|params| params.self_signed(&ca_key))
        .map_err(|e| signing(format!("CA certificate: {e}")))?;

    let mut params = CertificateParams::new(request.hosts.clone())
        .map_err(|e| signing(format!("subject alt names: {e}")))?;
    params.distinguished_name = request.distinguished_name();
    params.is_ca = IsCa::NoCa;
    params.key_usages.clone_from(&profile.key_usages);
    params.extended_key_usages.clone_from(&profile.extended_key_usages);
    params.use_authority_key_identifier_extension = true;
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    let expiry = time::Duration::try_from(profile.expiry)
        .map_err(|e| signing(format!("expiry: {e}")))?;
    params.not_before = now;
    params.not_after = now
        .checked_add(expiry)
        .ok_or_else(|| signing("expiry out of range".to_owned()))?;

    let cert = params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(|e| signing(e.to_string()))?;

    debug!(cert = %name, label = %label, expiry_secs = profile.expiry.as_secs(), "signed certificate");

    Ok(IssuedPem {
        key: leaf_key.serialize_pem(),
        cert: cert.pem(),
    })
}
