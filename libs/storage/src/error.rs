use std::path::PathBuf;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by the state store and the snapshot store
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted key in column {column}: {reason}")]
    CorruptedKey { column: u16, reason: String },

    #[error("Snapshot already exists at {0}")]
    SnapshotAlreadyExists(PathBuf),

    #[error("Snapshot checksum mismatch in {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Invalid snapshot {0}")]
    InvalidSnapshot(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
