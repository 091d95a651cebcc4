//! Storage error types.
//!
//! Every error variant carries the snapshot location and the underlying
//! reason so a failed load or save can be diagnosed from the log line alone.

/// Errors that can occur while reading or writing a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to read the snapshot.
    #[error("failed to read snapshot '{path}': {reason}")]
    Read { path: String, reason: String },

    /// Failed to write the snapshot.
    #[error("failed to write snapshot '{path}': {reason}")]
    Write { path: String, reason: String },
}
