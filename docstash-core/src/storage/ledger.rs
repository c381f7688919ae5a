use crate::error::{Result, StashError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const DEFAULT_LEDGER_FILE: &str = "fileMetadata.json";

/// One ledger entry. Field names match the JSON documents written by
/// earlier deployments, so existing ledgers load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerRecord {
    #[serde(rename = "filename")]
    pub storage_name: String,
    #[serde(rename = "originalname")]
    pub original_name: String,
    #[serde(
        rename = "uploadedby",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub uploaded_by: Option<String>,
    #[serde(
        rename = "uploadedat",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl LedgerRecord {
    pub fn new(storage_name: impl Into<String>, original_name: impl Into<String>) -> Self {
        Self {
            storage_name: storage_name.into(),
            original_name: original_name.into(),
            uploaded_by: None,
            uploaded_at: None,
        }
    }
}

/// The metadata ledger: a single JSON array document mapping storage names
/// to original file names, in upload order.
///
/// Appends are serialized through `write_lock` and land through a temp file
/// plus rename, so readers (which never lock) always see a whole document.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// File name of the backing document, used to hide it from listings.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Append a record. Fails closed: if the existing document cannot be
    /// parsed the append is refused and the document is left untouched.
    pub async fn append(&self, record: LedgerRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut records = self.load().await?;
        records.push(record);
        self.store(&records).await?;

        tracing::debug!(
            "Ledger {:?} now holds {} records",
            self.path,
            records.len()
        );
        Ok(())
    }

    /// Original name for a storage name; first match wins.
    pub async fn lookup(&self, storage_name: &str) -> Option<String> {
        self.all()
            .await
            .into_iter()
            .find(|record| record.storage_name == storage_name)
            .map(|record| record.original_name)
    }

    /// All records in insertion order. Fails open: an unreadable or corrupt
    /// document reads as empty.
    pub async fn all(&self) -> Vec<LedgerRecord> {
        match self.load().await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(
                    "Ledger {:?} unreadable, serving without original names: {}",
                    self.path,
                    error
                );
                Vec::new()
            }
        }
    }

    /// Strict read. A missing document is an empty ledger.
    pub async fn load(&self) -> Result<Vec<LedgerRecord>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };

        if data.iter().all(|byte| byte.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }

        serde_json::from_slice(&data).map_err(|error| {
            StashError::LedgerCorrupt(format!("{}: {}", self.path.display(), error))
        })
    }

    async fn store(&self, records: &[LedgerRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let payload = serde_json::to_vec_pretty(records)?;
        let temp_path = self.temp_path();

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&payload).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await?;
            Ok::<(), std::io::Error>(())
        };

        if let Err(error) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        Ok(())
    }

    /// Hold the write lock, stalling every append until the guard drops.
    #[cfg(test)]
    pub(crate) async fn block_appends(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    fn temp_path(&self) -> PathBuf {
        let name = self.file_name().unwrap_or(DEFAULT_LEDGER_FILE);
        self.path.with_file_name(format!(".{}.tmp", name))
    }
}
