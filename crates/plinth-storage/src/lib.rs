//! Snapshot persistence for `plinth`.
//!
//! This crate defines the [`SnapshotBackend`] trait, a whole-document
//! storage interface that knows nothing about certificates, tokens, or
//! clusters. The secret store in `plinth-core` serializes its full state to
//! one byte buffer and hands it to a backend; the backend only moves bytes.
//!
//! Two implementations are provided:
//!
//! - [`FileBackend`]: production default, a single file written atomically
//! - [`MemoryBackend`]: in-memory, for testing only

mod error;
mod file;
mod memory;

pub use error::StorageError;
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// A pluggable single-document storage backend.
///
/// A backend holds at most one snapshot. Absence is not an error: a fresh
/// deployment has no snapshot yet, and [`load`](SnapshotBackend::load)
/// reports that as `Ok(None)`.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
/// Callers are expected to serialize their own writes; backends do not
/// coordinate between processes.
#[async_trait::async_trait]
pub trait SnapshotBackend: Send + Sync + 'static {
    /// Read the whole snapshot.
    ///
    /// Returns `Ok(None)` if no snapshot has been written yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] for any failure other than absence.
    async fn load(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the whole snapshot with `data`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the snapshot could not be written.
    async fn store(&self, data: &[u8]) -> Result<(), StorageError>;

    /// Human-readable location of the snapshot, used in logs.
    fn location(&self) -> String;
}
