//! File snapshot backend, the production default.
//!
//! The snapshot is one file (conventionally `<data-dir>/secret-data.json`).
//! Writes go to a sibling temporary file that is then renamed over the
//! target, so a crash mid-write leaves the previous snapshot intact. On Unix
//! the file is created with mode `0600` because it holds private keys.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{SnapshotBackend, StorageError};

/// A snapshot backend backed by a single file on disk.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Create a backend for the snapshot file at `path`.
    ///
    /// Nothing is touched on disk until the first [`store`](SnapshotBackend::store).
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create a backend for `secret-data.json` inside `data_dir`.
    #[must_use]
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join("secret-data.json"))
    }

    /// Return the snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_error(&self, e: &std::io::Error) -> StorageError {
        StorageError::Write {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait::async_trait]
impl SnapshotBackend for FileBackend {
    async fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn store(&self, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.write_error(&e))?;
        }

        let tmp = self.temp_path();
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await.map_err(|e| self.write_error(&e))?;
        file.write_all(data)
            .await
            .map_err(|e| self.write_error(&e))?;
        file.sync_all().await.map_err(|e| self.write_error(&e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.write_error(&e))?;

        debug!(path = %self.path.display(), bytes = data.len(), "snapshot written");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}
