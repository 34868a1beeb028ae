use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::error::StorageError;
use super::hash::{ContentHash, ContentHasher};
use super::traits::{BlobStore, BoxReader, IngestLimits, IngestedBlob, StagedBlob};

const TEMP_DIR: &str = ".tmp";
const READ_BUF_SIZE: usize = 64 * 1024;

/// Filesystem-backed content-addressed blob store.
///
/// Blobs live under a two-level fanout: `{root}/{aa}/{bb}/{digest}` where `aa` and
/// `bb` are the first two pairs of hex characters. Temporaries are written to
/// `{root}/.tmp` so that publishing never crosses a filesystem boundary.
pub struct FilesystemBlobStore {
    root: PathBuf,
    max_size: u64,
}

impl FilesystemBlobStore {
    /// Create a new filesystem blob store.
    pub async fn new(root: PathBuf, max_size: u64) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join(TEMP_DIR)).await?;
        Ok(Self { root, max_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the filesystem path for a given content hash.
    pub fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        let (first, second) = hash.fanout();
        self.root.join(first).join(second).join(hash.to_hex())
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TEMP_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }

    async fn write_temp(
        &self,
        mut reader: BoxReader,
        limits: IngestLimits,
        temp_path: &Path,
    ) -> Result<(ContentHash, u64), StorageError> {
        let limit = match limits.expected_length {
            Some(expected) => expected.min(self.max_size),
            None => self.max_size,
        };
        if let Some(expected) = limits.expected_length
            && expected > self.max_size
        {
            return Err(StorageError::SizeLimitExceeded {
                actual: expected,
                limit: self.max_size,
            });
        }

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut temp_file = fs::File::create(temp_path).await?;

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            hasher.update(&buf[..n]);
            if hasher.length() > limit {
                return Err(StorageError::SizeLimitExceeded {
                    actual: hasher.length(),
                    limit,
                });
            }

            temp_file.write_all(&buf[..n]).await?;
        }

        temp_file.flush().await?;
        temp_file.sync_all().await?;
        drop(temp_file);

        let (hash, total_bytes) = hasher.finish();
        if let Some(expected) = limits.expected_length
            && total_bytes < expected
        {
            return Err(StorageError::ShortRead {
                expected,
                actual: total_bytes,
            });
        }

        if let Some(expected) = limits.expected_hash
            && expected != hash
        {
            return Err(StorageError::HashMismatch {
                expected: expected.to_hex(),
                actual: hash.to_hex(),
            });
        }

        Ok((hash, total_bytes))
    }

    /// Confirm that the blob already at `path` has the length we were about to publish.
    async fn check_existing(
        &self,
        path: &Path,
        hash: &ContentHash,
        length: u64,
    ) -> Result<(), StorageError> {
        let stored = fs::metadata(path).await?.len();
        if stored != length {
            return Err(StorageError::LengthMismatch {
                hash: hash.to_hex(),
                stored,
                incoming: length,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn stat(&self, hash: &ContentHash) -> Result<Option<u64>, StorageError> {
        match fs::metadata(self.blob_path(hash)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, hash: &ContentHash) -> Result<BoxReader, StorageError> {
        match fs::File::open(self.blob_path(hash)).await {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(hash.to_hex())),
            Err(e) => Err(e.into()),
        }
    }

    async fn stage(
        &self,
        reader: BoxReader,
        limits: IngestLimits,
    ) -> Result<StagedBlob, StorageError> {
        let temp_path = self.temp_path();
        match self.write_temp(reader, limits, &temp_path).await {
            Ok((hash, length)) => Ok(StagedBlob::new(hash, length, temp_path)),
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn publish(&self, staged: StagedBlob) -> Result<IngestedBlob, StorageError> {
        let hash = staged.hash();
        let length = staged.length();
        let blob_path = self.blob_path(&hash);

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // A hard link fails when the destination exists, which makes the
        // install no-clobber. The staged file is removed when `staged` drops.
        let created = match fs::hard_link(staged.temp_path(), &blob_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.check_existing(&blob_path, &hash, length).await?;
                false
            }
            Err(e) => {
                debug!(error = %e, "hard link unavailable, falling back to rename");
                if fs::try_exists(&blob_path).await? {
                    self.check_existing(&blob_path, &hash, length).await?;
                    false
                } else {
                    fs::rename(staged.temp_path(), &blob_path).await?;
                    true
                }
            }
        };

        Ok(IngestedBlob {
            hash,
            length,
            created,
        })
    }

    async fn unlink(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        let blob_path = self.blob_path(hash);
        match fs::remove_file(&blob_path).await {
            Ok(()) => {
                // Prune empty fanout directories; failure just means they are still in use.
                if let Some(second) = blob_path.parent() {
                    if fs::remove_dir(second).await.is_ok()
                        && let Some(first) = second.parent()
                    {
                        let _ = fs::remove_dir(first).await;
                    }
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn sweep_temp(&self, older_than: Duration) -> Result<usize, StorageError> {
        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut entries = fs::read_dir(self.root.join(TEMP_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Cannot stat temporary");
                    continue;
                }
            };
            if modified <= cutoff {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(removed)
    }
}
