//! Expiry-stamped blob storage
//!
//! Objects live in a bucket directory, sharded by the first two characters of
//! their key. Every object file starts with a small header carrying the content
//! type and the `expiration-time` stamp, followed by the raw payload:
//!
//! ```text
//! +------+-------------+--------------------------------+-----------+
//! | EPHB | len: u32 BE | {"content-type", "expiration-  | payload.. |
//! |      |             |  time", "size"} (len bytes)    |           |
//! +------+-------------+--------------------------------+-----------+
//! ```
//!
//! Writes go to a hidden `.partial` file which is fsynced and renamed into place,
//! so an object is either fully visible or not visible at all.

use crate::error::{StorageError, ValidationError};
use crate::storage_key;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, ReadDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Stream of payload chunks
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Magic bytes at the start of every object file
const HEADER_MAGIC: &[u8; 4] = b"EPHB";

/// Upper bound on the header JSON; anything larger is treated as corrupt
const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Read buffer for payload streaming (64KB)
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Metadata stamped onto each stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(rename = "content-type")]
    pub content_type: String,
    /// Authoritative expiry (ISO-8601 on disk)
    #[serde(rename = "expiration-time")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "size")]
    pub size_bytes: u64,
}

impl ObjectMetadata {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Wrap an in-memory payload as a single-chunk [`ByteStream`]
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    stream::once(futures_util::future::ready(Ok(data.into()))).boxed()
}

/// Backing object storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `size` bytes under `key`, stamped with content type and expiry.
    ///
    /// Size limits are the caller's business; only the byte count is checked
    /// against `size`.
    async fn put(
        &self,
        key: &str,
        data: ByteStream,
        size: u64,
        content_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Read the stamp without touching the payload
    async fn stat(&self, key: &str) -> Result<ObjectMetadata, StorageError>;

    /// Open the payload as a lazily read stream
    async fn get_stream(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// Remove an object. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// When the object was last written
    async fn last_modified(&self, key: &str) -> Result<DateTime<Utc>, StorageError>;

    /// Every key in the bucket, listed incrementally
    fn list_all(&self) -> BoxStream<'_, Result<String, StorageError>>;
}

/// Filesystem-backed [`BlobStore`]
pub struct FsBlobStore {
    /// `{root}/{bucket}`
    bucket_dir: PathBuf,
}

impl FsBlobStore {
    /// Open the store, creating the bucket directory if it does not exist yet
    pub async fn open<P: AsRef<Path>>(root_dir: P, bucket: &str) -> Result<Self, StorageError> {
        if !storage_key::is_valid(bucket) {
            return Err(StorageError::Config(format!("Invalid bucket name: {}", bucket)));
        }

        let bucket_dir = root_dir.as_ref().join(bucket);

        if fs::metadata(&bucket_dir).await.is_err() {
            fs::create_dir_all(&bucket_dir)
                .await
                .map_err(StorageError::unavailable)?;
            info!(path = %bucket_dir.display(), "Created bucket");
        }

        info!(path = %bucket_dir.display(), "Initialized blob store");

        Ok(Self { bucket_dir })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if !storage_key::is_valid(key) {
            return Err(StorageError::Internal(format!("Invalid storage key: {:?}", key)));
        }
        let shard = key.get(..2).unwrap_or(key);
        Ok(self.bucket_dir.join(shard).join(key))
    }

    /// Open an object and parse its header, leaving the file positioned at the payload
    async fn open_object(&self, key: &str) -> Result<(File, ObjectMetadata), StorageError> {
        let path = self.object_path(key)?;
        let mut file = File::open(&path).await.map_err(|e| not_found_or_unavailable(e, key))?;

        let metadata = match read_header(&mut file).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return Err(StorageError::MissingStamp(key.to_string())),
            Err(e) => return Err(not_found_or_unavailable(e, key)),
        };

        Ok((file, metadata))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        key: &str,
        mut data: ByteStream,
        size: u64,
        content_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::Internal(format!("No shard directory for {}", key)))?;
        fs::create_dir_all(parent).await.map_err(StorageError::unavailable)?;

        let partial = PartialFile::new(parent.join(format!(
            ".{}.partial-{}",
            key,
            uuid::Uuid::new_v4().simple()
        )));

        let metadata = ObjectMetadata {
            content_type: content_type.to_string(),
            expires_at,
            size_bytes: size,
        };
        let header = encode_header(&metadata)?;

        let mut file = File::create(partial.path())
            .await
            .map_err(StorageError::unavailable)?;
        file.write_all(&header).await.map_err(StorageError::unavailable)?;

        let mut received = 0u64;
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            if received > size {
                return Err(ValidationError::SizeMismatch { declared: size, received }.into());
            }
            file.write_all(&chunk).await.map_err(StorageError::unavailable)?;
        }

        if received != size {
            return Err(ValidationError::SizeMismatch { declared: size, received }.into());
        }

        file.flush().await.map_err(StorageError::unavailable)?;
        file.sync_all().await.map_err(StorageError::unavailable)?;
        drop(file);

        fs::rename(partial.path(), &path)
            .await
            .map_err(StorageError::unavailable)?;
        partial.persisted();

        info!(
            key = %key,
            size = size,
            content_type = %content_type,
            expires_at = %expires_at.to_rfc3339(),
            "Stored blob"
        );

        Ok(())
    }

    async fn stat(&self, key: &str) -> Result<ObjectMetadata, StorageError> {
        let (_, metadata) = self.open_object(key).await?;
        Ok(metadata)
    }

    async fn get_stream(&self, key: &str) -> Result<ByteStream, StorageError> {
        let (file, metadata) = self.open_object(key).await?;

        debug!(key = %key, size = metadata.size_bytes, "Streaming blob");

        let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE)
            .map_err(StorageError::unavailable);
        Ok(stream.boxed())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(key = %key, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(key = %key, "Blob already gone");
                Ok(())
            }
            Err(e) => Err(StorageError::unavailable(e)),
        }
    }

    async fn last_modified(&self, key: &str) -> Result<DateTime<Utc>, StorageError> {
        let path = self.object_path(key)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_unavailable(e, key))?;
        let modified = metadata.modified().map_err(StorageError::unavailable)?;
        Ok(DateTime::<Utc>::from(modified))
    }

    fn list_all(&self) -> BoxStream<'_, Result<String, StorageError>> {
        let state = ListState {
            bucket_dir: self.bucket_dir.clone(),
            shards: None,
            current: None,
        };

        stream::try_unfold(state, |mut state| async move {
            let key = state.next_key().await?;
            Ok(key.map(|key| (key, state)))
        })
        .boxed()
    }
}

/// Cursor over `{bucket}/{shard}/{key}`, holding at most two directory handles
struct ListState {
    bucket_dir: PathBuf,
    shards: Option<ReadDir>,
    current: Option<ReadDir>,
}

impl ListState {
    async fn next_key(&mut self) -> Result<Option<String>, StorageError> {
        if self.shards.is_none() {
            match fs::read_dir(&self.bucket_dir).await {
                Ok(dir) => self.shards = Some(dir),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StorageError::unavailable(e)),
            }
        }

        loop {
            if let Some(current) = self.current.as_mut() {
                match current.next_entry().await.map_err(StorageError::unavailable)? {
                    Some(entry) => {
                        let name = entry.file_name().to_string_lossy().to_string();
                        // Skips in-flight `.partial` files
                        if storage_key::is_valid(&name) {
                            return Ok(Some(name));
                        }
                        continue;
                    }
                    None => self.current = None,
                }
            }

            let shards = match self.shards.as_mut() {
                Some(shards) => shards,
                None => return Ok(None),
            };

            match shards.next_entry().await.map_err(StorageError::unavailable)? {
                Some(entry) => {
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    if !is_dir {
                        continue;
                    }
                    match fs::read_dir(entry.path()).await {
                        Ok(dir) => self.current = Some(dir),
                        // Shard vanished between listing and opening
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(StorageError::unavailable(e)),
                    }
                }
                None => {
                    self.shards = None;
                    return Ok(None);
                }
            }
        }
    }
}

/// Temporary upload file, removed on drop unless persisted.
///
/// Covers both failed writes and uploads whose future is dropped mid-stream.
struct PartialFile {
    path: PathBuf,
    persisted: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn persisted(mut self) {
        self.persisted = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial upload");
            }
        }
    }
}

fn encode_header(metadata: &ObjectMetadata) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_vec(metadata)?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or_else(|| StorageError::Internal("Object header too large".to_string()))?;

    let mut header = Vec::with_capacity(8 + json.len());
    header.extend_from_slice(HEADER_MAGIC);
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(&json);
    Ok(header)
}

/// Parse the header at the start of `file`. `Ok(None)` means the file is not a
/// stamped object (wrong magic, truncated or unparseable header).
async fn read_header(file: &mut File) -> std::io::Result<Option<ObjectMetadata>> {
    let mut prefix = [0u8; 8];
    match file.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    if &prefix[..4] != HEADER_MAGIC {
        return Ok(None);
    }

    let len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    if len > MAX_HEADER_LEN {
        return Ok(None);
    }

    let mut json = vec![0u8; len as usize];
    match file.read_exact(&mut json).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    Ok(serde_json::from_slice(&json).ok())
}

fn not_found_or_unavailable(err: std::io::Error, key: &str) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::unavailable(err)
    }
}
