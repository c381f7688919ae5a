//! Docstash Core - storage backend for uploaded documents
//!
//! Uploaded files are kept as flat blobs under generated storage names:
//! - ULID storage names that keep the original extension
//! - an allow-list and size ceiling checked while the body streams in
//! - a JSON ledger mapping storage names back to original names

pub mod error;
pub mod naming;
pub mod operations;
pub mod storage;
pub mod validation;

pub use error::{ErrorKind, Result, StashError};
pub use naming::{extension_of, generate_storage_name, validate_storage_name};
pub use operations::*;
pub use storage::{
    BlobReader, BlobStat, BlobStore, DEFAULT_LEDGER_FILE, Ledger, LedgerRecord, PutBlobResult,
    StagedBlob,
};
pub use validation::{DEFAULT_ALLOWED_TYPES, DEFAULT_MAX_UPLOAD_BYTES, UploadPolicy};
