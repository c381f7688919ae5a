use thiserror::Error;

#[derive(Debug, Error)]
pub enum StashError {
    #[error("invalid file type: {0}")]
    InvalidType(String),

    #[error("file exceeds the {limit} byte upload limit")]
    TooLarge { limit: u64 },

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid storage name: {0}")]
    InvalidStorageName(String),

    #[error("blob already exists: {0}")]
    BlobExists(String),

    #[error("ledger is corrupt: {0}")]
    LedgerCorrupt(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable tag for each error family. The HTTP layer maps these to status
/// codes without looking at message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidType,
    TooLarge,
    NotFound,
    InvalidStorageName,
    InvalidRequest,
    BlobExists,
    LedgerCorrupt,
    StorageIo,
    StreamInterrupted,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidType => "invalid_type",
            ErrorKind::TooLarge => "too_large",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidStorageName => "invalid_storage_name",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::BlobExists => "blob_exists",
            ErrorKind::LedgerCorrupt => "ledger_corrupt",
            ErrorKind::StorageIo => "storage_io",
            ErrorKind::StreamInterrupted => "stream_interrupted",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl StashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StashError::InvalidType(_) => ErrorKind::InvalidType,
            StashError::TooLarge { .. } => ErrorKind::TooLarge,
            StashError::NotFound(_) => ErrorKind::NotFound,
            StashError::InvalidStorageName(_) => ErrorKind::InvalidStorageName,
            StashError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            StashError::BlobExists(_) => ErrorKind::BlobExists,
            StashError::LedgerCorrupt(_) => ErrorKind::LedgerCorrupt,
            StashError::Io(_) => ErrorKind::StorageIo,
            StashError::StreamInterrupted(_) => ErrorKind::StreamInterrupted,
            StashError::Config(_) => ErrorKind::Config,
            StashError::Serialization(_) | StashError::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StashError>;
