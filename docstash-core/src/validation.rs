//! Upload admission rules.
//!
//! [`UploadPolicy`] is shared by every ingestion path. Declared metadata is
//! checked up front with [`UploadPolicy::check_declared`]; the actual byte
//! count is enforced while streaming with [`UploadPolicy::limit_stream`].

use crate::error::{Result, StashError};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

pub const DEFAULT_ALLOWED_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "image/jpeg",
    "image/png",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadPolicy {
    pub allowed_types: Vec<String>,
    pub max_upload_bytes: u64,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            allowed_types: DEFAULT_ALLOWED_TYPES
                .iter()
                .map(|mime| mime.to_string())
                .collect(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl UploadPolicy {
    pub fn new(allowed_types: Vec<String>, max_upload_bytes: u64) -> Self {
        Self {
            allowed_types,
            max_upload_bytes,
        }
    }

    pub fn is_allowed_type(&self, mime_type: &str) -> bool {
        let essence = mime_essence(mime_type);
        self.allowed_types
            .iter()
            .any(|allowed| mime_essence(allowed).eq_ignore_ascii_case(essence))
    }

    /// Check the client's declared type and, when known, declared size.
    pub fn check_declared(&self, mime_type: &str, declared_size: Option<u64>) -> Result<()> {
        if !self.is_allowed_type(mime_type) {
            return Err(StashError::InvalidType(mime_type.to_string()));
        }

        if let Some(size) = declared_size {
            if size > self.max_upload_bytes {
                return Err(StashError::TooLarge {
                    limit: self.max_upload_bytes,
                });
            }
        }

        Ok(())
    }

    /// Wrap an upload stream so it fails with `TooLarge` as soon as the
    /// running total passes the limit. Nothing after the failing chunk is
    /// polled from the inner stream.
    pub fn limit_stream<S>(&self, stream: S) -> impl Stream<Item = Result<Bytes>> + Send + use<S>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let limit = self.max_upload_bytes;
        let mut seen: u64 = 0;

        stream
            .map(move |chunk| {
                let chunk = chunk?;
                seen = seen.saturating_add(chunk.len() as u64);
                if seen > limit {
                    return Err(StashError::TooLarge { limit });
                }
                Ok(chunk)
            })
            .scan(false, |failed, item| {
                if *failed {
                    return futures_util::future::ready(None);
                }
                *failed = item.is_err();
                futures_util::future::ready(Some(item))
            })
    }
}

/// `text/plain; charset=utf-8` -> `text/plain`
fn mime_essence(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or_default().trim()
}
