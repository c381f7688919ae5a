//! Storage modules for Docstash
//!
//! Provides the flat blob directory and the JSON name ledger that lives
//! beside it.

pub mod blob_store;
pub mod ledger;

pub use blob_store::{BlobReader, BlobStat, BlobStore, PutBlobResult, StagedBlob};
pub use ledger::{DEFAULT_LEDGER_FILE, Ledger, LedgerRecord};
