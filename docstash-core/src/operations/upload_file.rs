use crate::{
    BlobStore, Ledger, LedgerRecord, PutBlobResult, Result, StagedBlob, StashError, UploadPolicy,
    generate_storage_name,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct UploadFileOperation {
    blob_store: Arc<BlobStore>,
    ledger: Arc<Ledger>,
    policy: Arc<UploadPolicy>,
}

#[derive(Debug)]
pub struct UploadFileOperationRequest<S> {
    pub body: S,
    pub mime_type: String,
    pub original_name: String,
    pub declared_size: Option<u64>,
    pub identity: Option<String>,
}

/// A file that has been persisted and recorded in the ledger.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredFile {
    pub storage_name: String,
    pub original_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub uploaded_by: Option<String>,
}

impl UploadFileOperation {
    pub fn new(blob_store: Arc<BlobStore>, ledger: Arc<Ledger>, policy: Arc<UploadPolicy>) -> Self {
        Self {
            blob_store,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    pub async fn run<S>(&self, request: UploadFileOperationRequest<S>) -> Result<StoredFile>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let UploadFileOperationRequest {
            body,
            mime_type,
            original_name,
            declared_size,
            identity,
        } = request;

        if original_name.trim().is_empty() {
            return Err(StashError::InvalidRequest(
                "uploaded file has no name".to_string(),
            ));
        }

        self.policy.check_declared(&mime_type, declared_size)?;

        let storage_name = generate_storage_name(&original_name);
        let staged = self
            .blob_store
            .stage(&storage_name, self.policy.limit_stream(body))
            .await?;

        let record = LedgerRecord {
            storage_name: storage_name.clone(),
            original_name: original_name.clone(),
            uploaded_by: identity.clone(),
            uploaded_at: Some(Utc::now()),
        };

        // Once the bytes are staged the rest runs detached, so a dropped
        // request cannot stop between publishing the blob and recording it.
        let commit = tokio::spawn(commit_upload(
            self.blob_store.clone(),
            self.ledger.clone(),
            staged,
            record,
        ));
        let (put_result, created_at) = commit.await.map_err(|error| {
            StashError::Internal(format!("upload commit task failed: {}", error))
        })??;

        tracing::info!(
            "Stored upload storage_name={} original_name={:?} size={} uploaded_by={:?}",
            storage_name,
            original_name,
            put_result.size_bytes,
            identity
        );

        Ok(StoredFile {
            storage_name,
            original_name,
            size_bytes: put_result.size_bytes,
            mime_type,
            sha256: put_result.sha256,
            created_at,
            uploaded_by: identity,
        })
    }
}

/// Publish a staged blob and record it in the ledger. If either step after
/// the link fails the blob is removed again.
async fn commit_upload(
    blob_store: Arc<BlobStore>,
    ledger: Arc<Ledger>,
    staged: StagedBlob,
    record: LedgerRecord,
) -> Result<(PutBlobResult, DateTime<Utc>)> {
    let put_result = staged.commit().await?;
    let storage_name = record.storage_name.clone();

    let created_at = match blob_store.stat(&storage_name).await {
        Ok(stat) => stat.created_at,
        Err(error) => {
            discard_blob(&blob_store, &storage_name).await;
            return Err(error);
        }
    };

    // A blob without a ledger entry would show up under its storage name.
    if let Err(error) = ledger.append(record).await {
        discard_blob(&blob_store, &storage_name).await;
        return Err(error);
    }

    Ok((put_result, created_at))
}

async fn discard_blob(blob_store: &BlobStore, storage_name: &str) {
    if let Err(error) = blob_store.delete(storage_name).await {
        tracing::warn!(
            "Failed to remove blob {} after aborted upload: {}",
            storage_name,
            error
        );
    }
}
