use crate::{BlobReader, BlobStore, Ledger, Result, StashError, validate_storage_name};
use std::sync::Arc;

/// How the client wants to receive the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Inline,
    Attachment,
}

#[derive(Clone)]
pub struct ReadFileOperation {
    blob_store: Arc<BlobStore>,
    ledger: Arc<Ledger>,
}

#[derive(Debug, Clone)]
pub struct ReadFileOperationRequest {
    pub storage_name: String,
    pub mode: RetrievalMode,
}

#[derive(Debug)]
pub struct ReadFileOperationResult {
    pub storage_name: String,
    pub display_name: String,
    pub mime_type: String,
    pub content_disposition: String,
    pub size_bytes: u64,
    pub reader: BlobReader,
}

#[derive(Debug)]
pub enum ReadFileOperationOutcome {
    Found(ReadFileOperationResult),
    NotFound,
}

impl ReadFileOperation {
    pub fn new(blob_store: Arc<BlobStore>, ledger: Arc<Ledger>) -> Self {
        Self { blob_store, ledger }
    }

    pub async fn run(&self, request: ReadFileOperationRequest) -> Result<ReadFileOperationOutcome> {
        let ReadFileOperationRequest { storage_name, mode } = request;

        if let Err(error) = validate_storage_name(&storage_name) {
            tracing::debug!("Refusing retrieval: {}", error);
            return Ok(ReadFileOperationOutcome::NotFound);
        }

        // The ledger shares the blob directory but is not a blob.
        if self.ledger.file_name() == Some(storage_name.as_str()) {
            return Ok(ReadFileOperationOutcome::NotFound);
        }

        let reader = match self.blob_store.open(&storage_name).await {
            Ok(reader) => reader,
            Err(StashError::NotFound(_)) => return Ok(ReadFileOperationOutcome::NotFound),
            Err(error) => return Err(error),
        };

        let display_name = self
            .ledger
            .lookup(&storage_name)
            .await
            .unwrap_or_else(|| storage_name.clone());

        let mime_type = mime_type_for(&storage_name);
        let content_disposition = match mode {
            RetrievalMode::Inline => inline_disposition(&display_name),
            RetrievalMode::Attachment => attachment_disposition(&display_name),
        };

        Ok(ReadFileOperationOutcome::Found(ReadFileOperationResult {
            storage_name,
            display_name,
            mime_type,
            content_disposition,
            size_bytes: reader.size_bytes(),
            reader,
        }))
    }
}

/// Content type from the storage name's extension only.
pub fn mime_type_for(storage_name: &str) -> String {
    mime_guess::from_path(storage_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// `inline; filename="<name>"` with characters that would break the quoted
/// string replaced by `_`.
pub fn inline_disposition(display_name: &str) -> String {
    let safe: String = display_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    format!("inline; filename=\"{}\"", safe)
}

/// `attachment; filename="<percent-encoded name>"`
pub fn attachment_disposition(display_name: &str) -> String {
    format!(
        "attachment; filename=\"{}\"",
        encode_uri_component(display_name)
    )
}

/// Percent-encode everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )`,
/// the same set browsers' `encodeURIComponent` leaves alone.
pub fn encode_uri_component(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}
