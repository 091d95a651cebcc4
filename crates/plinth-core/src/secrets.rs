//! The certificate and secret store.
//!
//! A [`SecretStore`] holds, per cluster, the CAs and the certificates they
//! signed, generated tokens, operator-set passwords, and SSH host keys. Every
//! accessor that may lazily create an entry takes the single store mutex for
//! its whole read-check-create sequence, so concurrent renders never create
//! two CAs or sign the same request twice.
//!
//! The store is backed by one JSON snapshot through a [`SnapshotBackend`].
//! [`SecretStore::save`] writes it only when the serialized content differs
//! from what was last persisted.
//!
//! # Snapshot format
//!
//! ```json
//! {
//!   "c1": {
//!     "CAs": { "etcd": { "Key": "<base64 PEM>", "Cert": "<base64 PEM>",
//!                        "Signed": { "etcd-server": { "Key": "…", "Cert": "…", "ReqHash": "…" } } } },
//!     "Tokens": { "bootstrap": "…" },
//!     "Passwords": { "admin": "…" },
//!     "SSHKeyPairs": { "host1": [ { "Type": "ed25519", "Public": "…", "Private": "…" } ] }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use plinth_storage::SnapshotBackend;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::SecretError;
use crate::pki::{self, CertRequest, IssuedPem, SigningPolicy};
use crate::ssh::{SSH_KEY_TYPES, SshKeyGenerator, SshKeyPair, SshKeygen};

/// Random bytes per generated token.
const TOKEN_BYTES: usize = 16;

/// Byte fields are stored as standard base64 strings.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Accept `null` wherever an empty collection is meant.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// An issued key and certificate, tagged with the request hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCert {
    #[serde(rename = "Key", with = "base64_bytes")]
    pub key: Vec<u8>,
    #[serde(rename = "Cert", with = "base64_bytes")]
    pub cert: Vec<u8>,
    #[serde(rename = "ReqHash", default)]
    pub req_hash: String,
}

impl KeyCert {
    /// PEM private key.
    #[must_use]
    pub fn key_pem(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// PEM certificate.
    #[must_use]
    pub fn cert_pem(&self) -> String {
        String::from_utf8_lossy(&self.cert).into_owned()
    }
}

impl fmt::Debug for KeyCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCert")
            .field("req_hash", &self.req_hash)
            .finish_non_exhaustive()
    }
}

/// A CA and the certificates it signed.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Ca {
    #[serde(rename = "Key", with = "base64_bytes")]
    pub key: Vec<u8>,
    #[serde(rename = "Cert", with = "base64_bytes")]
    pub cert: Vec<u8>,
    #[serde(rename = "Signed", default, deserialize_with = "null_as_default")]
    pub signed: BTreeMap<String, KeyCert>,
}

impl Ca {
    fn pem(&self) -> IssuedPem {
        IssuedPem {
            key: String::from_utf8_lossy(&self.key).into_owned(),
            cert: String::from_utf8_lossy(&self.cert).into_owned(),
        }
    }
}

impl From<IssuedPem> for Ca {
    fn from(pem: IssuedPem) -> Self {
        Self {
            key: pem.key.into_bytes(),
            cert: pem.cert.into_bytes(),
            signed: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for Ca {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ca")
            .field("signed", &self.signed.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Everything stored for one cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSecrets {
    #[serde(rename = "CAs", default, deserialize_with = "null_as_default")]
    pub cas: BTreeMap<String, Ca>,
    #[serde(rename = "Tokens", default, deserialize_with = "null_as_default")]
    pub tokens: BTreeMap<String, String>,
    #[serde(rename = "Passwords", default, deserialize_with = "null_as_default")]
    pub passwords: BTreeMap<String, String>,
    #[serde(rename = "SSHKeyPairs", default, deserialize_with = "null_as_default")]
    pub ssh_key_pairs: BTreeMap<String, Vec<SshKeyPair>>,
}

/// Mutable store content, guarded by the store mutex.
///
/// `revision` counts mutations; the store is changed while it is ahead of
/// `saved_revision`.
#[derive(Debug, Default)]
struct State {
    clusters: BTreeMap<String, ClusterSecrets>,
    revision: u64,
    saved_revision: u64,
    saved_hash: Option<[u8; 32]>,
}

fn bucket<'a>(
    clusters: &'a mut BTreeMap<String, ClusterSecrets>,
    revision: &mut u64,
    cluster: &str,
) -> &'a mut ClusterSecrets {
    clusters.entry(cluster.to_owned()).or_insert_with(|| {
        info!(cluster = %cluster, "new cluster secrets");
        *revision += 1;
        ClusterSecrets::default()
    })
}

impl State {
    fn bucket(&mut self, cluster: &str) -> &mut ClusterSecrets {
        bucket(&mut self.clusters, &mut self.revision, cluster)
    }

    fn ca(&mut self, cluster: &str, name: &str) -> Result<&mut Ca, SecretError> {
        let Self {
            clusters, revision, ..
        } = self;

        match bucket(clusters, revision, cluster).cas.entry(name.to_owned()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let pem = pki::generate_ca()?;
                info!(cluster = %cluster, ca = %name, "new CA");
                *revision += 1;
                Ok(entry.insert(Ca::from(pem)))
            }
        }
    }

    fn encode(&self) -> Result<(Vec<u8>, [u8; 32]), SecretError> {
        let data = serde_json::to_vec(&self.clusters).map_err(|e| SecretError::Serialization {
            reason: e.to_string(),
        })?;
        let hash: [u8; 32] = Sha256::digest(&data).into();
        Ok((data, hash))
    }
}

/// The process-wide certificate and secret store.
pub struct SecretStore {
    policy: SigningPolicy,
    backend: Arc<dyn SnapshotBackend>,
    ssh: Arc<dyn SshKeyGenerator>,
    state: Mutex<State>,
    save_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("backend", &self.backend.location())
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Load the store from `backend`.
    ///
    /// A missing snapshot yields an empty store that reports
    /// [`changed`](Self::changed) so the first save creates the file.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Storage`] if the snapshot cannot be read, or
    /// [`SecretError::Snapshot`] if it cannot be decoded.
    pub async fn load(
        policy: SigningPolicy,
        backend: Arc<dyn SnapshotBackend>,
    ) -> Result<Self, SecretError> {
        let state = match backend.load().await? {
            None => {
                info!(location = %backend.location(), "no secret snapshot, starting empty");
                State {
                    revision: 1,
                    ..State::default()
                }
            }
            Some(data) => {
                let clusters: BTreeMap<String, ClusterSecrets> = serde_json::from_slice(&data)
                    .map_err(|e| SecretError::Snapshot {
                        reason: e.to_string(),
                    })?;
                let mut state = State {
                    clusters,
                    ..State::default()
                };
                state.saved_hash = Some(state.encode()?.1);
                info!(
                    location = %backend.location(),
                    clusters = state.clusters.len(),
                    "loaded secret snapshot"
                );
                state
            }
        };

        Ok(Self {
            policy,
            backend,
            ssh: Arc::new(SshKeygen::new()),
            state: Mutex::new(state),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replace the SSH key generator.
    #[must_use]
    pub fn with_ssh_generator(mut self, generator: Arc<dyn SshKeyGenerator>) -> Self {
        self.ssh = generator;
        self
    }

    /// The signing policy certificates are issued under.
    #[must_use]
    pub fn policy(&self) -> &SigningPolicy {
        &self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, SecretError> {
        self.state.lock().map_err(|_| SecretError::LockPoisoned)
    }

    // ── CAs and certificates ───────────────────────────────────────

    /// The CA `name` of `cluster`, created on first use.
    ///
    /// # Errors
    ///
    /// Returns a key or certificate generation error if the CA must be created
    /// and creation fails; nothing is stored in that case.
    pub fn ca(&self, cluster: &str, name: &str) -> Result<IssuedPem, SecretError> {
        let mut state = self.lock()?;
        Ok(state.ca(cluster, name)?.pem())
    }

    /// The certificate `cert_name` signed by CA `ca_name` for `request`.
    ///
    /// Returns the stored certificate when the request hash is unchanged;
    /// otherwise signs a fresh key and replaces the stored entry.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidHost`] if a host entry is not an IP or DNS name.
    /// - [`SecretError::CaSectionNotAllowed`] if the request embeds a CA section.
    /// - Generation or signing errors; the stored entry is untouched then.
    pub fn key_cert(
        &self,
        cluster: &str,
        ca_name: &str,
        cert_name: &str,
        profile: &str,
        label: &str,
        request: &CertRequest,
    ) -> Result<KeyCert, SecretError> {
        request.validate_hosts(&format!("{cluster}.{cert_name}"))?;
        if request.has_ca_section() {
            return Err(SecretError::CaSectionNotAllowed {
                name: cert_name.to_owned(),
            });
        }
        let req_hash = request.hash()?;

        let mut state = self.lock()?;
        let ca = state.ca(cluster, ca_name)?;

        let previous_hash = match ca.signed.get(cert_name) {
            Some(existing) if existing.req_hash == req_hash => return Ok(existing.clone()),
            Some(existing) => Some(existing.req_hash.clone()),
            None => None,
        };

        let issued = pki::sign(
            &ca.pem(),
            cert_name,
            self.policy.profile(profile),
            label,
            request,
        )?;

        match &previous_hash {
            Some(old) => info!(
                cluster = %cluster, ca = %ca_name, cert = %cert_name,
                old_hash = %old, new_hash = %req_hash,
                "CSR changed, re-signing"
            ),
            None => info!(
                cluster = %cluster, ca = %ca_name, cert = %cert_name, hash = %req_hash,
                "new CSR"
            ),
        }

        let key_cert = KeyCert {
            key: issued.key.into_bytes(),
            cert: issued.cert.into_bytes(),
            req_hash,
        };
        ca.signed.insert(cert_name.to_owned(), key_cert.clone());
        state.revision += 1;

        Ok(key_cert)
    }

    // ── tokens and passwords ───────────────────────────────────────

    /// The token `name` of `cluster`, generated on first use from 16 random
    /// bytes, base32 without padding.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::LockPoisoned`] if the store lock is poisoned.
    pub fn token(&self, cluster: &str, name: &str) -> Result<String, SecretError> {
        let mut state = self.lock()?;
        let bucket = state.bucket(cluster);
        if let Some(token) = bucket.tokens.get(name).filter(|t| !t.is_empty()) {
            return Ok(token.clone());
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = base32_no_pad(&bytes);

        bucket.tokens.insert(name.to_owned(), token.clone());
        state.revision += 1;
        info!(cluster = %cluster, token = %name, "new token");
        Ok(token)
    }

    /// The password `name` of `cluster`; empty until set. Reading never
    /// creates state.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::LockPoisoned`] if the store lock is poisoned.
    pub fn password(&self, cluster: &str, name: &str) -> Result<String, SecretError> {
        let state = self.lock()?;
        Ok(state
            .clusters
            .get(cluster)
            .and_then(|bucket| bucket.passwords.get(name))
            .cloned()
            .unwrap_or_default())
    }

    /// Set the password `name` of `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::LockPoisoned`] if the store lock is poisoned.
    pub fn set_password(&self, cluster: &str, name: &str, value: &str) -> Result<(), SecretError> {
        let mut state = self.lock()?;
        state
            .bucket(cluster)
            .passwords
            .insert(name.to_owned(), value.to_owned());
        state.revision += 1;
        info!(cluster = %cluster, password = %name, "password set");
        Ok(())
    }

    /// Names of the passwords defined for `cluster`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::LockPoisoned`] if the store lock is poisoned.
    pub fn password_names(&self, cluster: &str) -> Result<Vec<String>, SecretError> {
        let state = self.lock()?;
        Ok(state
            .clusters
            .get(cluster)
            .map(|bucket| bucket.passwords.keys().cloned().collect())
            .unwrap_or_default())
    }

    // ── SSH host keys ──────────────────────────────────────────────

    /// The SSH host keypairs of `host` in `cluster`, generating any of the
    /// standard key types not yet present. Existing pairs are never
    /// regenerated.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::SshKeygen`] if any generation fails; nothing
    /// generated by the failed call is kept.
    pub fn ssh_key_pairs(&self, cluster: &str, host: &str) -> Result<Vec<SshKeyPair>, SecretError> {
        let mut state = self.lock()?;
        let mut pairs = state
            .clusters
            .get(cluster)
            .and_then(|bucket| bucket.ssh_key_pairs.get(host))
            .cloned()
            .unwrap_or_default();

        let missing: Vec<&str> = SSH_KEY_TYPES
            .iter()
            .copied()
            .filter(|key_type| !pairs.iter().any(|p| p.key_type == *key_type))
            .collect();

        if missing.is_empty() {
            return Ok(pairs);
        }

        for key_type in missing {
            pairs.push(self.ssh.generate(host, key_type)?);
        }

        state
            .bucket(cluster)
            .ssh_key_pairs
            .insert(host.to_owned(), pairs.clone());
        state.revision += 1;
        Ok(pairs)
    }

    // ── persistence ────────────────────────────────────────────────

    /// Whether the store holds content that has not been saved.
    #[must_use]
    pub fn changed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.revision != state.saved_revision
    }

    /// Persist the store if its content differs from the last saved snapshot.
    ///
    /// Returns whether a write happened. On success, every mutation made
    /// before the snapshot was taken counts as saved.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Serialization`] or [`SecretError::Storage`];
    /// the store stays changed in that case.
    pub async fn save(&self) -> Result<bool, SecretError> {
        let _serialized = self.save_lock.lock().await;

        let (data, hash, revision) = {
            let mut state = self.lock()?;
            let (data, hash) = state.encode()?;
            if state.saved_hash == Some(hash) {
                state.saved_revision = state.revision;
                debug!(location = %self.backend.location(), "secret snapshot unchanged, skipping write");
                return Ok(false);
            }
            (data, hash, state.revision)
        };

        if let Err(e) = self.backend.store(&data).await {
            warn!(location = %self.backend.location(), error = %e, "failed to save secret snapshot");
            return Err(e.into());
        }

        let mut state = self.lock()?;
        state.saved_hash = Some(hash);
        state.saved_revision = revision;
        info!(location = %self.backend.location(), bytes = data.len(), "saved secret snapshot");
        Ok(true)
    }
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// RFC 4648 base32, without padding.
fn base32_no_pad(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u16 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(char::from(BASE32_ALPHABET[usize::from((buffer >> bits) & 0x1f)]));
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(char::from(BASE32_ALPHABET[usize::from((buffer << (5 - bits)) & 0x1f)]));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use plinth_storage::MemoryBackend;

    use super::*;

    /// Deterministic generator that counts calls and can fail on one type.
    #[derive(Default)]
    struct FakeKeygen {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl SshKeyGenerator for FakeKeygen {
        fn generate(&self, host: &str, key_type: &str) -> Result<SshKeyPair, SecretError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(key_type) {
                return Err(SecretError::SshKeygen {
                    key_type: key_type.to_owned(),
                    reason: "boom".to_owned(),
                });
            }
            Ok(SshKeyPair {
                key_type: key_type.to_owned(),
                public: format!("ssh-{key_type} PUB{n} root@{host}\n"),
                private: format!("PRIV{n}\n"),
            })
        }
    }

    async fn store_with(backend: &MemoryBackend, keygen: Arc<FakeKeygen>) -> SecretStore {
        SecretStore::load(SigningPolicy::default(), Arc::new(backend.clone()))
            .await
            .unwrap()
            .with_ssh_generator(keygen)
    }

    async fn empty_store() -> SecretStore {
        store_with(&MemoryBackend::new(), Arc::new(FakeKeygen::default())).await
    }

    fn request(hosts: &[&str]) -> CertRequest {
        CertRequest {
            common_name: "etcd".to_owned(),
            hosts: hosts.iter().map(|h| (*h).to_owned()).collect(),
            ..CertRequest::default()
        }
    }

    // ── base32 ─────────────────────────────────────────────────────

    #[test]
    fn base32_rfc4648_vectors() {
        assert_eq!(base32_no_pad(b""), "");
        assert_eq!(base32_no_pad(b"f"), "MY");
        assert_eq!(base32_no_pad(b"fo"), "MZXQ");
        assert_eq!(base32_no_pad(b"foo"), "MZXW6");
        assert_eq!(base32_no_pad(b"foob"), "MZXW6YQ");
        assert_eq!(base32_no_pad(b"fooba"), "MZXW6YTB");
        assert_eq!(base32_no_pad(b"foobar"), "MZXW6YTBOI");
    }

    // ── CA ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ca_is_created_once() {
        let store = empty_store().await;
        let first = store.ca("c1", "root").unwrap();
        let second = store.ca("c1", "root").unwrap();
        assert_eq!(first, second);
        assert_ne!(store.ca("c2", "root").unwrap(), first);
    }

    #[tokio::test]
    async fn concurrent_ca_calls_agree() {
        let store = Arc::new(empty_store().await);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::task::spawn_blocking(move || store.ca("c1", "root").unwrap())
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    // ── key_cert ───────────────────────────────────────────────────

    #[tokio::test]
    async fn unchanged_request_is_not_resigned() {
        let store = empty_store().await;
        let req = request(&["10.0.0.1"]);

        let first = store.key_cert("c1", "etcd", "server", "", "", &req).unwrap();
        store.save().await.unwrap();
        assert!(!store.changed());

        let second = store.key_cert("c1", "etcd", "server", "", "", &req).unwrap();
        assert_eq!(first, second);
        assert!(!store.changed());
    }

    #[tokio::test]
    async fn changed_request_is_resigned() {
        let store = empty_store().await;
        let first = store
            .key_cert("c1", "etcd", "server", "", "", &request(&["10.0.0.1"]))
            .unwrap();
        store.save().await.unwrap();

        let second = store
            .key_cert("c1", "etcd", "server", "", "", &request(&["10.0.0.1", "10.0.0.2"]))
            .unwrap();
        assert_ne!(first.key, second.key);
        assert_ne!(first.req_hash, second.req_hash);
        assert!(store.changed());

        let third = store
            .key_cert("c1", "etcd", "server", "", "", &request(&["10.0.0.1", "10.0.0.2"]))
            .unwrap();
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn ca_section_is_rejected_before_any_mutation() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        store.save().await.unwrap();

        let mut req = request(&[]);
        req.ca = Some(serde_json::json!({"expiry": "1h"}));
        let err = store.key_cert("c1", "etcd", "server", "", "", &req).unwrap_err();
        assert!(matches!(err, SecretError::CaSectionNotAllowed { .. }));
        assert!(!store.changed());
    }

    #[tokio::test]
    async fn invalid_host_is_rejected_before_any_mutation() {
        let store = empty_store().await;
        store.save().await.unwrap();

        let err = store
            .key_cert("c1", "etcd", "server", "", "", &request(&["ok.example", "not a host!!"]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "c1.server.hosts[1]: \"not a host!!\" is not an IP or FQDN"
        );
        assert!(!store.changed());
    }

    #[tokio::test]
    async fn invalid_host_is_reported_before_ca_section() {
        let store = empty_store().await;
        let mut req = request(&["not a host!!"]);
        req.ca = Some(serde_json::json!({"expiry": "1h"}));

        let err = store.key_cert("c1", "etcd", "server", "", "", &req).unwrap_err();
        assert!(matches!(err, SecretError::InvalidHost { .. }), "{err}");
    }

    #[tokio::test]
    async fn unsupported_key_leaves_previous_cert() {
        let store = empty_store().await;
        let good = store.key_cert("c1", "etcd", "server", "", "", &request(&[])).unwrap();

        let mut weak = request(&["10.0.0.9"]);
        weak.key = Some(pki::KeyRequest {
            algo: "rsa".to_owned(),
            size: 1024,
        });
        let err = store.key_cert("c1", "etcd", "server", "", "", &weak).unwrap_err();
        assert!(matches!(err, SecretError::UnsupportedKey { size: 1024, .. }));

        let again = store.key_cert("c1", "etcd", "server", "", "", &request(&[])).unwrap();
        assert_eq!(good, again);
    }

    #[tokio::test]
    async fn rsa_and_p521_requests_are_issued_and_reused() {
        let store = empty_store().await;
        for (cert, algo, size) in [("rsa", "rsa", 2048), ("p521", "ecdsa", 521)] {
            let mut req = request(&["10.0.0.9"]);
            req.key = Some(pki::KeyRequest {
                algo: algo.to_owned(),
                size,
            });
            let first = store.key_cert("c1", "etcd", cert, "", "", &req).unwrap();
            assert!(first.cert_pem().contains("BEGIN CERTIFICATE"));
            let second = store.key_cert("c1", "etcd", cert, "", "", &req).unwrap();
            assert_eq!(first, second);
        }
    }

    // ── tokens and passwords ───────────────────────────────────────

    #[tokio::test]
    async fn tokens_are_stable() {
        let store = empty_store().await;
        let token = store.token("c1", "bootstrap").unwrap();
        assert_eq!(token.len(), 26);
        assert!(token.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
        assert_eq!(store.token("c1", "bootstrap").unwrap(), token);
        assert_ne!(store.token("c1", "other").unwrap(), token);
    }

    #[tokio::test]
    async fn passwords_read_empty_until_set() {
        let store = empty_store().await;
        store.save().await.unwrap();

        assert_eq!(store.password("c1", "admin").unwrap(), "");
        assert!(!store.changed());

        store.set_password("c1", "admin", "hunter2").unwrap();
        assert!(store.changed());
        assert_eq!(store.password("c1", "admin").unwrap(), "hunter2");

        store.set_password("c1", "backup", "x").unwrap();
        assert_eq!(store.password_names("c1").unwrap(), vec!["admin", "backup"]);
        assert!(store.password_names("c2").unwrap().is_empty());
    }

    // ── SSH keys ───────────────────────────────────────────────────

    #[tokio::test]
    async fn ssh_keys_generated_for_every_type() {
        let keygen = Arc::new(FakeKeygen::default());
        let store = store_with(&MemoryBackend::new(), Arc::clone(&keygen)).await;

        let pairs = store.ssh_key_pairs("c", "h").unwrap();
        let types: Vec<_> = pairs.iter().map(|p| p.key_type.as_str()).collect();
        assert_eq!(types, SSH_KEY_TYPES);

        let again = store.ssh_key_pairs("c", "h").unwrap();
        assert_eq!(pairs, again);
        assert_eq!(keygen.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn ssh_keys_only_missing_types_are_generated() {
        let seeded = serde_json::json!({
            "c": { "SSHKeyPairs": { "h": [
                { "Type": "ecdsa", "Public": "ssh-ecdsa KEEP root@h\n", "Private": "KEEP\n" }
            ] } }
        });
        let backend = MemoryBackend::with_snapshot(serde_json::to_vec(&seeded).unwrap());
        let keygen = Arc::new(FakeKeygen::default());
        let store = store_with(&backend, Arc::clone(&keygen)).await;

        let pairs = store.ssh_key_pairs("c", "h").unwrap();
        assert_eq!(pairs.len(), 4);
        assert_eq!(keygen.calls.load(Ordering::SeqCst), 3);

        let ecdsa = pairs.iter().find(|p| p.key_type == "ecdsa").unwrap();
        assert_eq!(ecdsa.private, "KEEP\n");
        assert!(store.changed());
    }

    #[tokio::test]
    async fn ssh_failure_keeps_nothing() {
        let keygen = Arc::new(FakeKeygen {
            fail_on: Some("ecdsa"),
            ..FakeKeygen::default()
        });
        let store = store_with(&MemoryBackend::new(), keygen).await;
        store.save().await.unwrap();

        assert!(store.ssh_key_pairs("c", "h").is_err());
        assert!(!store.changed());
    }

    // ── persistence ────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_snapshot_is_changed_and_saves_once() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        assert!(store.changed());

        store.token("c1", "t").unwrap();
        assert!(store.save().await.unwrap());
        assert_eq!(backend.writes(), 1);

        let reloaded = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        assert!(!reloaded.changed());
        assert!(!reloaded.save().await.unwrap());
        assert_eq!(backend.writes(), 1);
        assert_eq!(reloaded.token("c1", "t").unwrap(), store.token("c1", "t").unwrap());
    }

    #[tokio::test]
    async fn save_without_mutation_skips_write() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        store.ca("c1", "root").unwrap();
        assert!(store.save().await.unwrap());
        assert!(!store.save().await.unwrap());
        assert_eq!(backend.writes(), 1);
    }

    #[tokio::test]
    async fn snapshot_roundtrips_ca_material() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        let ca = store.ca("c1", "root").unwrap();
        let kc = store.key_cert("c1", "root", "leaf", "", "", &request(&["h1"])).unwrap();
        store.save().await.unwrap();

        let reloaded = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        assert_eq!(reloaded.ca("c1", "root").unwrap(), ca);
        assert_eq!(
            reloaded.key_cert("c1", "root", "leaf", "", "", &request(&["h1"])).unwrap(),
            kc
        );
        assert!(!reloaded.changed());
    }

    #[tokio::test]
    async fn snapshot_uses_stable_field_names() {
        let backend = MemoryBackend::new();
        let store = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        store.ca("c1", "root").unwrap();
        store.token("c1", "t").unwrap();
        store.save().await.unwrap();

        let raw = backend.load().await.unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        let cluster = &json["c1"];
        assert!(cluster["CAs"]["root"]["Key"].is_string());
        assert!(cluster["CAs"]["root"]["Cert"].is_string());
        assert!(cluster["CAs"]["root"]["Signed"].is_object());
        assert!(cluster["Tokens"]["t"].is_string());
        assert!(cluster["Passwords"].is_object());
        assert!(cluster["SSHKeyPairs"].is_object());
    }

    #[tokio::test]
    async fn null_collections_load_as_empty() {
        let backend = MemoryBackend::with_snapshot(
            br#"{"c1":{"CAs":null,"Tokens":{"t":"ABC"},"Passwords":null}}"#.to_vec(),
        );
        let store = store_with(&backend, Arc::new(FakeKeygen::default())).await;
        assert_eq!(store.token("c1", "t").unwrap(), "ABC");
        assert_eq!(store.password("c1", "p").unwrap(), "");
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let backend = MemoryBackend::with_snapshot(b"{not json".to_vec());
        let err = SecretStore::load(SigningPolicy::default(), Arc::new(backend))
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::Snapshot { .. }));
    }
}
