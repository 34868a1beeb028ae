use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::StorageError;
use super::hash::ContentHash;

/// Type alias for a boxed async reader.
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send>;

/// Expectations checked while a blob is being staged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestLimits {
    /// Exact byte length the source must produce.
    pub expected_length: Option<u64>,
    /// Digest the source must hash to.
    pub expected_hash: Option<ContentHash>,
}

/// Outcome of installing a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestedBlob {
    pub hash: ContentHash,
    pub length: u64,
    /// `false` when an identical blob was already present.
    pub created: bool,
}

/// A fully hashed candidate that has not been published yet.
///
/// Dropping it without publishing removes the temporary file.
#[derive(Debug)]
pub struct StagedBlob {
    hash: ContentHash,
    length: u64,
    temp_path: PathBuf,
}

impl StagedBlob {
    pub fn new(hash: ContentHash, length: u64, temp_path: PathBuf) -> Self {
        Self {
            hash,
            length,
            temp_path,
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        // Already gone after a rename-based publish.
        let _ = std::fs::remove_file(&self.temp_path);
    }
}

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Length of a stored blob, or `None` when absent.
    async fn stat(&self, hash: &ContentHash) -> Result<Option<u64>, StorageError>;

    /// Open a blob for streaming reads.
    async fn open(&self, hash: &ContentHash) -> Result<BoxReader, StorageError>;

    /// Stream a source into a temporary file, hashing as it goes.
    async fn stage(
        &self,
        reader: BoxReader,
        limits: IngestLimits,
    ) -> Result<StagedBlob, StorageError>;

    /// Move a staged blob to its content-addressed path without clobbering.
    async fn publish(&self, staged: StagedBlob) -> Result<IngestedBlob, StorageError>;

    /// Remove a blob. Returns `false` if it did not exist.
    ///
    /// Callers must have established that nothing references the blob.
    async fn unlink(&self, hash: &ContentHash) -> Result<bool, StorageError>;

    /// Delete abandoned temporaries older than `older_than`.
    async fn sweep_temp(&self, older_than: Duration) -> Result<usize, StorageError>;

    async fn ingest(
        &self,
        reader: BoxReader,
        limits: IngestLimits,
    ) -> Result<IngestedBlob, StorageError> {
        let staged = self.stage(reader, limits).await?;
        self.publish(staged).await
    }

    async fn put(&self, data: &[u8]) -> Result<IngestedBlob, StorageError> {
        let reader: BoxReader = Box::new(Cursor::new(data.to_vec()));
        self.ingest(reader, IngestLimits::default()).await
    }

    async fn read_all(&self, hash: &ContentHash) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.open(hash).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}
