//! SSH host key generation.
//!
//! Host keys are generated by the system `ssh-keygen` into a private
//! temporary directory and read back as OpenSSH-format text. The
//! [`SshKeyGenerator`] trait lets tests substitute a deterministic generator.

use std::fmt;
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SecretError;

/// Key algorithms every host gets, in generation order.
pub const SSH_KEY_TYPES: [&str; 4] = ["rsa", "dsa", "ecdsa", "ed25519"];

/// One generated host keypair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyPair {
    #[serde(rename = "Type")]
    pub key_type: String,
    #[serde(rename = "Public")]
    pub public: String,
    #[serde(rename = "Private")]
    pub private: String,
}

impl fmt::Debug for SshKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeyPair")
            .field("key_type", &self.key_type)
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Generates one SSH keypair of a given type for a host.
pub trait SshKeyGenerator: Send + Sync + 'static {
    /// Generate a `key_type` keypair commented `root@<host>`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::SshKeygen`] if generation fails.
    fn generate(&self, host: &str, key_type: &str) -> Result<SshKeyPair, SecretError>;
}

/// Runs `ssh-keygen`.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    program: String,
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self {
            program: "ssh-keygen".to_owned(),
        }
    }
}

impl SshKeygen {
    /// Use `ssh-keygen` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `ssh-keygen` binary.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl SshKeyGenerator for SshKeygen {
    fn generate(&self, host: &str, key_type: &str) -> Result<SshKeyPair, SecretError> {
        let failed = |reason: String| SecretError::SshKeygen {
            key_type: key_type.to_owned(),
            reason,
        };

        let dir = tempfile::Builder::new()
            .prefix("plinth-key.")
            .tempdir()
            .map_err(|e| failed(format!("temp dir: {e}")))?;
        let key_path = dir.path().join("key");

        debug!(host = %host, key_type = %key_type, "running ssh-keygen");

        let output = Command::new(&self.program)
            .args(["-q", "-N", "", "-C"])
            .arg(format!("root@{host}"))
            .arg("-f")
            .arg(&key_path)
            .args(["-t", key_type])
            .output()
            .map_err(|e| failed(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            return Err(failed(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let private = std::fs::read_to_string(&key_path)
            .map_err(|e| failed(format!("read private key: {e}")))?;
        let public = std::fs::read_to_string(key_path.with_extension("pub"))
            .map_err(|e| failed(format!("read public key: {e}")))?;

        info!(host = %host, key_type = %key_type, "generated ssh host key");

        Ok(SshKeyPair {
            key_type: key_type.to_owned(),
            public,
            private,
        })
    }
}

/// File name of a host key of `key_type`: `ssh_host_<type>_key`.
#[must_use]
pub fn host_key_file_name(key_type: &str) -> String {
    format!("ssh_host_{key_type}_key")
}
