//! In-memory snapshot backend for testing.
//!
//! Keeps the latest snapshot in a `Vec<u8>` behind a `RwLock` and counts
//! writes, so tests can assert that unchanged state is never re-persisted.
//! Not persistent: everything is lost when the process exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::RwLock;

use crate::{SnapshotBackend, StorageError};

/// An in-memory snapshot backend.
///
/// Clones share state, which lets a test hand one clone to the store and
/// inspect the other.
///
/// # Examples
///
/// ```
/// # use plinth_storage::{MemoryBackend, SnapshotBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.store(b"{}").await.unwrap();
/// assert_eq!(backend.load().await.unwrap(), Some(b"{}".to_vec()));
/// assert_eq!(backend.writes(), 1);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<Option<Vec<u8>>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that already holds `data`, as if a previous process
    /// had saved it.
    #[must_use]
    pub fn with_snapshot(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::new(RwLock::new(Some(data.into()))),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of successful [`store`](SnapshotBackend::store) calls so far.
    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.clone())
    }

    async fn store(&self, data: &[u8]) -> Result<(), StorageError> {
        *self.data.write().await = Some(data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_owned()
    }
}
