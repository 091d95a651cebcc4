//! End-to-end tests for the render pipeline.
//!
//! Each test loads a YAML cluster specification, renders host configs through
//! a [`Renderer`] and checks what reaches the secret store and the snapshot.
//! SSH keys come from a deterministic generator; no `ssh-keygen` is needed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use plinth_core::error::SecretError;
use plinth_core::ssh::SshKeyPair;
use plinth_core::{ClusterSpec, Renderer, SecretStore, SigningPolicy, SshKeyGenerator};
use plinth_storage::{FileBackend, MemoryBackend, SnapshotBackend};
use x509_parser::extensions::GeneralName;

#[derive(Default)]
struct CountingKeygen {
    calls: AtomicUsize,
}

impl SshKeyGenerator for CountingKeygen {
    fn generate(&self, host: &str, key_type: &str) -> Result<SshKeyPair, SecretError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SshKeyPair {
            key_type: key_type.to_owned(),
            public: format!("ssh-{key_type} KEY{n} root@{host}\n"),
            private: format!("PRIVATE-{key_type}-{n}\n"),
        })
    }
}

const SPEC: &str = r#"
hosts:
  - name: m1
    ip: 10.0.0.11
    cluster: prod
    group: masters
    vars: { net: { mtu: 9000 } }
  - name: m2
    ip: 10.0.0.12
    cluster: prod
    group: masters
groups:
  - name: masters
    config: master
    vars: { role: master, net: { bond: true } }
clusters:
  - name: prod
    domain: prod.example
    subnets: { services: 10.96.0.0/12 }
    vars: { role: node, net: { mtu: 1500 } }
configs:
  - name: master
    template: |
      mtu: {{ vars.net.mtu }}
      bond: {{ vars.net.bond }}
      role: {{ vars.role }}
      ca: |
      {{ indent("  ", ca_crt("kubernetes")) }}
      apiserver: |
      {{ indent("  ", tls_crt("apiserver")) }}
      files:
      {{ tls_dir("apiserver") }}
      {{ ssh_host_keys("/etc/ssh") }}
cert_requests:
  - name: apiserver
    ca: kubernetes
    per_host: true
    template: |
      {"CN": "{{ host.name }}", "hosts": ["{{ host.ip }}", "{{ cluster.kubernetes_svc_ip }}", "kubernetes.default.svc.{{ cluster.domain }}"]}
"#;

async fn store_on(backend: Arc<dyn SnapshotBackend>, keygen: Arc<CountingKeygen>) -> Arc<SecretStore> {
    Arc::new(
        SecretStore::load(SigningPolicy::default(), backend)
            .await
            .unwrap()
            .with_ssh_generator(keygen),
    )
}

fn renderer(spec: &str, store: Arc<SecretStore>) -> Renderer {
    Renderer::new(Arc::new(ClusterSpec::from_yaml(spec).unwrap()), store)
}

fn yaml_str<'a>(config: &'a plinth_core::HostConfig, key: &str) -> &'a str {
    config.rest[key].as_str().unwrap()
}

// ── scope ──────────────────────────────────────────────────────────

#[tokio::test]
async fn vars_are_layered_cluster_group_host() {
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::default()).await;
    let rendered = renderer(SPEC, store).config("m1").await.unwrap();
    let config = rendered.config;

    assert_eq!(config.rest["mtu"], serde_yaml::Value::from(9000));
    assert_eq!(config.rest["bond"], serde_yaml::Value::from(true));
    assert_eq!(yaml_str(&config, "role"), "master");
}

// ── issuance ───────────────────────────────────────────────────────

#[tokio::test]
async fn unchanged_requests_reuse_certificates() {
    let backend = MemoryBackend::new();
    let store = store_on(Arc::new(backend.clone()), Arc::default()).await;
    let renderer = renderer(SPEC, Arc::clone(&store));

    let first = renderer.config("m1").await.unwrap();
    assert_eq!(backend.writes(), 1);

    let second = renderer.config("m1").await.unwrap();
    assert_eq!(first.raw, second.raw);
    assert!(!store.changed());
    assert_eq!(backend.writes(), 1);
}

#[tokio::test]
async fn changed_request_is_reissued() {
    let backend = MemoryBackend::new();
    let store = store_on(Arc::new(backend.clone()), Arc::default()).await;

    let before = renderer(SPEC, Arc::clone(&store)).config("m1").await.unwrap();

    let widened = SPEC.replace(
        r#""kubernetes.default.svc.{{ cluster.domain }}"]"#,
        r#""kubernetes.default.svc.{{ cluster.domain }}", "api.{{ cluster.domain }}"]"#,
    );
    let after = renderer(&widened, Arc::clone(&store)).config("m1").await.unwrap();

    assert_ne!(
        yaml_str(&before.config, "apiserver"),
        yaml_str(&after.config, "apiserver")
    );
    // Same CA signs both.
    assert_eq!(yaml_str(&before.config, "ca"), yaml_str(&after.config, "ca"));
    assert_eq!(backend.writes(), 2);
}

#[tokio::test]
async fn per_host_requests_are_distinct() {
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::default()).await;
    let renderer = renderer(SPEC, store);

    let m1 = renderer.config("m1").await.unwrap();
    let m2 = renderer.config("m2").await.unwrap();

    assert_ne!(yaml_str(&m1.config, "apiserver"), yaml_str(&m2.config, "apiserver"));
    assert_eq!(yaml_str(&m1.config, "ca"), yaml_str(&m2.config, "ca"));
}

#[tokio::test]
async fn issued_certificate_carries_request_hosts() {
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::default()).await;
    let rendered = renderer(SPEC, store).config("m1").await.unwrap();

    let pem = yaml_str(&rendered.config, "apiserver");
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    assert!(cert.subject().to_string().contains("CN=m1"));

    let san = cert.subject_alternative_name().unwrap().unwrap();
    let names = &san.value.general_names;
    assert!(names.iter().any(
        |n| matches!(n, GeneralName::DNSName(dns) if *dns == "kubernetes.default.svc.prod.example")
    ));
    assert!(names
        .iter()
        .any(|n| matches!(n, GeneralName::IPAddress(ip) if *ip == [10, 96, 0, 1])));
}

#[tokio::test]
async fn tls_dir_bundles_ca_cert_and_key() {
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::default()).await;
    let config = renderer(SPEC, store).config("m1").await.unwrap().config;

    let tls: Vec<_> = config
        .files
        .iter()
        .filter(|f| f.path.starts_with("/etc/tls/apiserver/"))
        .map(|f| (f.path.as_str(), f.mode))
        .collect();
    assert_eq!(
        tls,
        vec![
            ("/etc/tls/apiserver/ca.crt", 0o644),
            ("/etc/tls/apiserver/tls.crt", 0o644),
            ("/etc/tls/apiserver/tls.key", 0o600),
        ]
    );
}

#[tokio::test]
async fn concurrent_renders_share_one_ca() {
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::default()).await;
    let renderer = renderer(SPEC, store);

    let mut tasks = Vec::new();
    for i in 0..8 {
        let renderer = renderer.clone();
        let host = if i % 2 == 0 { "m1" } else { "m2" };
        tasks.push(tokio::spawn(async move { renderer.config(host).await }));
    }

    let mut cas = Vec::new();
    for task in tasks {
        let rendered = task.await.unwrap().unwrap();
        cas.push(yaml_str(&rendered.config, "ca").to_owned());
    }
    cas.dedup();
    assert_eq!(cas.len(), 1);
}

// ── validation ─────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_csr_host_fails_render() {
    let backend = MemoryBackend::new();
    let store = store_on(Arc::new(backend.clone()), Arc::default()).await;
    let bad = SPEC.replace(r#""{{ host.ip }}", "#, r#""{{ host.ip }}", "not a host!!", "#);

    let err = renderer(&bad, Arc::clone(&store)).config("m1").await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.to_string().contains("prod.apiserver/m1.hosts[1]"), "{err}");
    assert_eq!(backend.writes(), 0);
}

#[tokio::test]
async fn missing_resources_are_not_found() {
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::default()).await;

    let renderer_ = renderer(SPEC, Arc::clone(&store));
    assert!(renderer_.config("nobody").await.unwrap_err().is_not_found());

    let missing_csr = SPEC.replace(r#"tls_crt("apiserver")"#, r#"tls_crt("etcd")"#);
    let err = renderer(&missing_csr, Arc::clone(&store))
        .config("m1")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{err}");

    let missing_config = SPEC.replace("config: master", "config: worker");
    let err = renderer(&missing_config, store).config("m1").await.unwrap_err();
    assert!(err.is_not_found(), "{err}");
}

// ── ssh ────────────────────────────────────────────────────────────

#[tokio::test]
async fn ssh_host_keys_are_generated_once() {
    let keygen = Arc::new(CountingKeygen::default());
    let store = store_on(Arc::new(MemoryBackend::new()), Arc::clone(&keygen)).await;
    let renderer = renderer(SPEC, store);

    let first = renderer.config("m1").await.unwrap().config;
    assert_eq!(keygen.calls.load(Ordering::SeqCst), 4);

    let second = renderer.config("m1").await.unwrap().config;
    assert_eq!(keygen.calls.load(Ordering::SeqCst), 4);
    assert_eq!(first.files, second.files);

    let ssh: Vec<_> = first
        .files
        .iter()
        .filter(|f| f.path.starts_with("/etc/ssh/"))
        .collect();
    assert_eq!(ssh.len(), 8);
    for file in ssh {
        let expected = if file.path.ends_with(".pub") { 0o644 } else { 0o600 };
        assert_eq!(file.mode, expected, "{}", file.path);
    }
}

// ── persistence ────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("secret-data.json");

    let store = store_on(Arc::new(FileBackend::in_dir(dir.path())), Arc::default()).await;
    assert!(store.changed());
    let before = renderer(SPEC, store);
    let tag = before.tag("m1").await.unwrap();
    let written = std::fs::read(&snapshot).unwrap();

    let store = store_on(Arc::new(FileBackend::in_dir(dir.path())), Arc::default()).await;
    assert!(!store.changed());
    let after = renderer(SPEC, Arc::clone(&store));
    assert_eq!(after.tag("m1").await.unwrap(), tag);

    assert!(!store.changed());
    assert!(!store.save().await.unwrap());
    assert_eq!(std::fs::read(&snapshot).unwrap(), written);
}

#[tokio::test]
async fn snapshot_uses_stable_field_names() {
    let backend = MemoryBackend::new();
    let store = store_on(Arc::new(backend.clone()), Arc::default()).await;
    renderer(SPEC, store).config("m1").await.unwrap();

    let data = backend.load().await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&data).unwrap();
    let prod = &json["prod"];
    assert!(prod["CAs"]["kubernetes"]["Signed"]["apiserver/m1"]["ReqHash"].is_string());
    assert_eq!(prod["SSHKeyPairs"]["m1"].as_array().unwrap().len(), 4);
}
