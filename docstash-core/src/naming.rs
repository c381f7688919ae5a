//! Storage name generation and validation.
//!
//! Storage names are the only keys the blob store accepts. They are produced
//! by [`generate_storage_name`] and every name coming back from a caller is
//! checked with [`validate_storage_name`] before any path is built from it.

use crate::error::{Result, StashError};
use std::path::{Component, Path};
use ulid::Ulid;

const MAX_EXTENSION_LEN: usize = 16;
const MAX_STORAGE_NAME_LEN: usize = 255;

/// Generate a fresh storage name for an upload.
///
/// The name is a ULID followed by the lower-cased extension of
/// `original_name`, e.g. `01J9ZQ3M4V6S8T0XKQH2B7C5DE.pdf`. Unusable
/// extensions are dropped rather than rejected, so this never fails.
pub fn generate_storage_name(original_name: &str) -> String {
    let id = Ulid::new().to_string();
    match extension_of(original_name) {
        Some(ext) => format!("{}.{}", id, ext),
        None => id,
    }
}

/// Extract a safe extension from an untrusted file name.
pub fn extension_of(original_name: &str) -> Option<String> {
    // Some clients send full paths from either platform.
    let base = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original_name);

    let ext = Path::new(base).extension()?.to_str()?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }

    Some(ext.to_ascii_lowercase())
}

/// Check that `name` is a single, plain path component.
///
/// Rejects empty names, dot files, traversal sequences, separators of either
/// platform and NUL bytes. Returns the name unchanged on success.
pub fn validate_storage_name(name: &str) -> Result<&str> {
    let invalid = || StashError::InvalidStorageName(name.to_string());

    if name.is_empty() || name.len() > MAX_STORAGE_NAME_LEN {
        return Err(invalid());
    }

    if name.starts_with('.') || name.contains("..") {
        return Err(invalid());
    }

    if name.contains(['/', '\\', '\0']) {
        return Err(invalid());
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(component)), None) if component == name => Ok(name),
        _ => Err(invalid()),
    }
}
