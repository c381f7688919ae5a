use crate::error::{Result, StashError};
use crate::naming::validate_storage_name;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::ReaderStream;

/// BlobStore keeps uploaded file bytes in a single flat directory,
/// one file per storage name: `{root}/{storage_name}`.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutBlobResult {
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobStat {
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// A fully written blob that is not visible yet. Dropping it discards the
/// bytes.
#[derive(Debug)]
pub struct StagedBlob {
    storage_name: String,
    blob_path: PathBuf,
    temp: TempFile,
    result: PutBlobResult,
}

impl StagedBlob {
    /// Link the staged bytes into place. Fails with `BlobExists` rather than
    /// replace a blob that appeared since staging.
    pub async fn commit(self) -> Result<PutBlobResult> {
        match fs::hard_link(self.temp.path(), &self.blob_path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StashError::BlobExists(self.storage_name));
            }
            Err(error) => return Err(error.into()),
        }

        tracing::debug!(
            "Stored blob {} ({} bytes, sha256 {})",
            self.storage_name,
            self.result.size_bytes,
            self.result.sha256
        );
        Ok(self.result)
    }
}

/// An open blob. Dropping it closes the file handle.
#[derive(Debug)]
pub struct BlobReader {
    storage_name: String,
    size_bytes: u64,
    file: fs::File,
}

impl BlobReader {
    pub fn storage_name(&self) -> &str {
        &self.storage_name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Chunked body stream. A read error ends the stream with that error and
    /// is logged here, since by then the response headers are already out.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        blob_stream(self.storage_name, self.file)
    }

    /// Read the rest of the blob into memory.
    pub async fn read_to_end(self) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.into_stream().try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Stream bytes into `storage_name`.
    ///
    /// Bytes land in a hidden temp file that is linked into place only after
    /// the stream completes and the data is synced. An existing blob is never
    /// replaced. On any error, or if the future is dropped, the temp file is
    /// removed and no blob becomes visible.
    pub async fn put<S>(&self, storage_name: &str, stream: S) -> Result<PutBlobResult>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        self.stage(storage_name, stream).await?.commit().await
    }

    /// First half of [`BlobStore::put`]: write and sync the temp file without
    /// making the blob visible.
    pub async fn stage<S>(&self, storage_name: &str, stream: S) -> Result<StagedBlob>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let blob_path = self.blob_path(storage_name)?;

        fs::create_dir_all(&self.root).await?;

        if fs::try_exists(&blob_path).await? {
            return Err(StashError::BlobExists(storage_name.to_string()));
        }

        // Removes the temp file on every exit, including when this future is
        // dropped mid-stream.
        let temp = TempFile::new(self.root.join(format!(".{}.tmp", storage_name)));
        let result = self.write_temp(temp.path(), stream).await?;

        Ok(StagedBlob {
            storage_name: storage_name.to_string(),
            blob_path,
            temp,
            result,
        })
    }

    async fn write_temp<S>(&self, temp_path: &Path, stream: S) -> Result<PutBlobResult>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        futures_util::pin_mut!(stream);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await?;
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }

        file.sync_all().await?;
        drop(file);

        Ok(PutBlobResult {
            size_bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Open a blob for streaming
    pub async fn open(&self, storage_name: &str) -> Result<BlobReader> {
        let blob_path = self.blob_path(storage_name)?;

        let file = match fs::File::open(&blob_path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(StashError::NotFound(storage_name.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(StashError::NotFound(storage_name.to_string()));
        }

        Ok(BlobReader {
            storage_name: storage_name.to_string(),
            size_bytes: metadata.len(),
            file,
        })
    }

    pub async fn get(&self, storage_name: &str) -> Result<Bytes> {
        self.open(storage_name).await?.read_to_end().await
    }

    pub async fn stat(&self, storage_name: &str) -> Result<BlobStat> {
        let blob_path = self.blob_path(storage_name)?;

        let metadata = match fs::metadata(&blob_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(StashError::NotFound(storage_name.to_string())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(StashError::NotFound(storage_name.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        // Not every filesystem records birth time.
        let created = metadata.created().or_else(|_| metadata.modified())?;

        Ok(BlobStat {
            size_bytes: metadata.len(),
            created_at: DateTime::<Utc>::from(created),
        })
    }

    pub async fn exists(&self, storage_name: &str) -> bool {
        match self.blob_path(storage_name) {
            Ok(path) => fs::metadata(&path)
                .await
                .map(|metadata| metadata.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Remove a blob. Missing blobs are not an error.
    pub async fn delete(&self, storage_name: &str) -> Result<()> {
        let blob_path = self.blob_path(storage_name)?;
        match fs::remove_file(&blob_path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// List all storage names. Hidden files (in-flight temp files) and names
    /// that would not pass validation are skipped. Order is unspecified.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }

            if let Some(name) = entry.file_name().to_str() {
                if validate_storage_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }

        Ok(names)
    }

    /// Get the path to a blob. The name is validated before it is joined.
    fn blob_path(&self, storage_name: &str) -> Result<PathBuf> {
        let name = validate_storage_name(storage_name)?;
        Ok(self.root.join(name))
    }
}

/// Chunked stream over a blob reader. A read error is logged and yielded
/// once, after which the stream ends.
fn blob_stream<R>(
    storage_name: String,
    reader: R,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static
where
    R: AsyncRead + Send + 'static,
{
    ReaderStream::new(reader).inspect_err(move |error| {
        let interrupted = StashError::StreamInterrupted(error.to_string());
        tracing::warn!(
            "Aborting blob stream. storage_name={} error={}",
            storage_name,
            interrupted
        );
    })
}

/// A temp file path that is deleted when the guard goes out of scope.
#[derive(Debug)]
struct TempFile {
    path: PathBuf,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove temp file {:?}: {}", self.path, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn body(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes>> + use<> {
        let items: Vec<Result<Bytes>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part)))
            .collect();
        stream::iter(items)
    }

    #[tokio::test]
    async fn test_blob_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();

        let name = "01J9ZQ3M4V6S8T0XKQH2B7C5DE.pdf";

        // Store blob
        let result = store.put(name, body(&[b"hello ", b"world"])).await.unwrap();
        assert_eq!(result.size_bytes, 11);
        assert_eq!(
            result.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        // Retrieve blob
        let data = store.get(name).await.unwrap();
        assert_eq!(data, Bytes::from("hello world"));

        // Stat and existence
        let stat = store.stat(name).await.unwrap();
        assert_eq!(stat.size_bytes, 11);
        assert!(store.exists(name).await);

        // List
        let names = store.list().await.unwrap();
        assert_eq!(names, vec![name.to_string()]);

        // Delete
        store.delete(name).await.unwrap();
        assert!(!store.exists(name).await);
        assert!(matches!(
            store.stat(name).await,
            Err(StashError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_creates_missing_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("uploads");
        let store = BlobStore::new(root.clone()).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        store.put("a.png", body(&[b"png"])).await.unwrap();
        assert!(root.join("a.png").is_file());
    }

    #[tokio::test]
    async fn test_put_refuses_existing_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();

        store.put("a.pdf", body(&[b"first"])).await.unwrap();
        let err = store.put("a.pdf", body(&[b"second"])).await.unwrap_err();
        assert!(matches!(err, StashError::BlobExists(_)));
        assert_eq!(store.get("a.pdf").await.unwrap(), Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing_behind() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();

        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(StashError::StreamInterrupted("client went away".to_string())),
        ]);
        let err = store.put("b.pdf", failing).await.unwrap_err();
        assert!(matches!(err, StashError::StreamInterrupted(_)));

        assert!(!store.exists("b.pdf").await);
        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_traversal_before_touching_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("uploads");
        let store = BlobStore::new(root).unwrap();

        std::fs::write(temp_dir.path().join("secret.txt"), b"secret").unwrap();

        for name in ["../secret.txt", "/etc/passwd", "..", "sub/../../secret.txt"] {
            assert!(matches!(
                store.open(name).await,
                Err(StashError::InvalidStorageName(_))
            ));
            assert!(matches!(
                store.stat(name).await,
                Err(StashError::InvalidStorageName(_))
            ));
            assert!(!store.exists(name).await);
        }

        let err = store.put("../escape.pdf", body(&[b"x"])).await.unwrap_err();
        assert!(matches!(err, StashError::InvalidStorageName(_)));
        assert!(!temp_dir.path().join("escape.pdf").exists());
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();

        store.put("c.png", body(&[b"c"])).await.unwrap();
        std::fs::write(temp_dir.path().join(".d.png.tmp"), b"in flight").unwrap();
        std::fs::create_dir(temp_dir.path().join("nested")).unwrap();

        let names = store.list().await.unwrap();
        assert_eq!(names, vec!["c.png".to_string()]);
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("gone");
        let store = BlobStore::new(root.clone()).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_reports_size_and_streams() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();
        store.put("e.pdf", body(&[b"0123456789"])).await.unwrap();

        let reader = store.open("e.pdf").await.unwrap();
        assert_eq!(reader.size_bytes(), 10);
        assert_eq!(reader.storage_name(), "e.pdf");

        let chunks: Vec<Bytes> = reader.into_stream().try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"0123456789".to_vec());

        assert!(matches!(
            store.open("missing.pdf").await,
            Err(StashError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_put_removes_temp_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();

        let stalled = stream::iter(vec![Ok(Bytes::from_static(b"partial"))])
            .chain(stream::pending());
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.put("a.pdf", stalled),
        )
        .await;
        assert!(outcome.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
        assert!(!store.exists("a.pdf").await);
    }

    #[tokio::test]
    async fn test_put_never_replaces_a_blob_created_mid_write() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(temp_dir.path().to_path_buf()).unwrap();

        let target = temp_dir.path().join("race.pdf");
        let racing = stream::iter(vec![Ok(Bytes::from_static(b"mine"))]).then(move |chunk| {
            let target = target.clone();
            async move {
                std::fs::write(&target, b"theirs").unwrap();
                chunk
            }
        });

        let err = store.put("race.pdf", racing).await.unwrap_err();
        assert!(matches!(err, StashError::BlobExists(_)));
        assert_eq!(store.get("race.pdf").await.unwrap(), Bytes::from("theirs"));
        assert_eq!(store.list().await.unwrap(), vec!["race.pdf".to_string()]);
        let all: Vec<_> = std::fs::read_dir(temp_dir.path()).unwrap().collect();
        assert_eq!(all.len(), 1);
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Err(std::io::Error::other("disk went away")))
        }
    }

    #[tokio::test]
    async fn test_read_error_mid_stream_ends_the_stream() {
        use tokio::io::AsyncReadExt;

        let reader = (&b"hello"[..]).chain(FailingReader);
        let blob = blob_stream("x.pdf".to_string(), reader);
        futures_util::pin_mut!(blob);

        let first = blob.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"hello"));
        assert!(blob.next().await.unwrap().is_err());
        assert!(blob.next().await.is_none());
    }
}
