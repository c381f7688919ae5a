use crate::{BlobStore, Ledger, Result, StashError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct ListFilesOperation {
    blob_store: Arc<BlobStore>,
    ledger: Arc<Ledger>,
    public_prefix: String,
}

/// One row of the file catalog, in the shape clients already consume.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub filename: String,
    pub originalname: String,
    pub size: u64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub url: String,
    #[serde(rename = "downloadUrl")]
    pub download_url: String,
}

impl ListFilesOperation {
    pub fn new(
        blob_store: Arc<BlobStore>,
        ledger: Arc<Ledger>,
        public_prefix: impl Into<String>,
    ) -> Self {
        let public_prefix = public_prefix.into().trim_end_matches('/').to_string();
        Self {
            blob_store,
            ledger,
            public_prefix,
        }
    }

    pub async fn run(&self) -> Result<Vec<CatalogEntry>> {
        let mut names = self.blob_store.list().await?;
        names.sort();

        let ledger_name = self.ledger.file_name();

        // One snapshot per listing. Earlier records win on duplicate names.
        let mut original_names: HashMap<String, String> = HashMap::new();
        for record in self.ledger.all().await {
            original_names
                .entry(record.storage_name)
                .or_insert(record.original_name);
        }

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            if ledger_name == Some(name.as_str()) {
                continue;
            }

            let stat = match self.blob_store.stat(&name).await {
                Ok(stat) => stat,
                Err(StashError::NotFound(_)) => {
                    tracing::debug!("Blob {} vanished during listing", name);
                    continue;
                }
                Err(error) => return Err(error),
            };

            let originalname = original_names
                .get(&name)
                .cloned()
                .unwrap_or_else(|| name.clone());

            entries.push(CatalogEntry {
                url: format!("{}/view/{}", self.public_prefix, name),
                download_url: format!("{}/download/{}", self.public_prefix, name),
                filename: name,
                originalname,
                size: stat.size_bytes,
                created_at: stat.created_at,
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerRecord;
    use bytes::Bytes;
    use futures_util::stream;

    async fn put(store: &BlobStore, name: &str, data: &'static [u8]) {
        store
            .put(name, stream::iter(vec![Ok(Bytes::from_static(data))]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_joins_ledger_and_hides_it() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().to_path_buf();
        let store = Arc::new(BlobStore::new(root.clone()).unwrap());
        let ledger = Arc::new(Ledger::new(root.join(crate::DEFAULT_LEDGER_FILE)));
        let operation = ListFilesOperation::new(store.clone(), ledger.clone(), "/api/files/");

        put(&store, "b.png", b"png").await;
        put(&store, "a.pdf", b"0123456789").await;
        put(&store, "c.doc", b"doc").await;
        ledger.append(LedgerRecord::new("a.pdf", "report.pdf")).await.unwrap();
        ledger.append(LedgerRecord::new("b.png", "photo.png")).await.unwrap();
        ledger.append(LedgerRecord::new("b.png", "later.png")).await.unwrap();

        let entries = operation.run().await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a.pdf", "b.png", "c.doc"]);

        assert_eq!(entries[0].originalname, "report.pdf");
        assert_eq!(entries[0].size, 10);
        assert_eq!(entries[0].url, "/api/files/view/a.pdf");
        assert_eq!(entries[0].download_url, "/api/files/download/a.pdf");
        assert_eq!(entries[1].originalname, "photo.png");
        // No ledger entry
        assert_eq!(entries[2].originalname, "c.doc");

        let json = serde_json::to_value(&entries[0]).unwrap();
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["downloadUrl"], "/api/files/download/a.pdf");
    }

    #[tokio::test]
    async fn test_list_is_stable_without_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().to_path_buf();
        let store = Arc::new(BlobStore::new(root.clone()).unwrap());
        let ledger = Arc::new(Ledger::new(root.join(crate::DEFAULT_LEDGER_FILE)));
        let operation = ListFilesOperation::new(store.clone(), ledger.clone(), "/api/files");

        put(&store, "x.pdf", b"x").await;
        put(&store, "y.pdf", b"y").await;
        ledger.append(LedgerRecord::new("x.pdf", "x.pdf")).await.unwrap();

        let first = operation.run().await.unwrap();
        let second = operation.run().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_list_with_missing_root_or_corrupt_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("uploads");
        let store = Arc::new(BlobStore::new(root.clone()).unwrap());
        let ledger = Arc::new(Ledger::new(root.join(crate::DEFAULT_LEDGER_FILE)));
        let operation = ListFilesOperation::new(store.clone(), ledger, "/api/files");

        std::fs::remove_dir_all(&root).unwrap();
        assert!(operation.run().await.unwrap().is_empty());

        std::fs::create_dir_all(&root).unwrap();
        put(&store, "a.pdf", b"a").await;
        std::fs::write(root.join(crate::DEFAULT_LEDGER_FILE), b"not json").unwrap();

        let entries = operation.run().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].originalname, "a.pdf");
    }
}
