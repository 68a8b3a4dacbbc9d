//! Read path
//!
//! Resolves a record id to a live payload stream. A record whose blob is gone or
//! expired is deleted before answering, so no caller sees content past its
//! expiry. The blob itself is left to the sweeper.

use crate::blob_store::{BlobStore, ByteStream};
use crate::clock::Clock;
use crate::error::StorageError;
use crate::metadata::{BlobRecord, RecordRepository};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A readable blob
pub struct OpenedBlob {
    pub record: BlobRecord,
    pub content_type: String,
    pub size_bytes: u64,
    pub stream: ByteStream,
}

impl std::fmt::Debug for OpenedBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedBlob")
            .field("record", &self.record)
            .field("content_type", &self.content_type)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

pub struct BlobReader {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn RecordRepository>,
    clock: Arc<dyn Clock>,
}

impl BlobReader {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn RecordRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { blobs, index, clock }
    }

    /// Open a record's payload.
    ///
    /// Missing, expired and never-existing records all come back as `NotFound`.
    pub async fn open(&self, id: &str) -> Result<OpenedBlob, StorageError> {
        match self.resolve(id).await {
            Err(StorageError::Expired(id)) => {
                debug!(id = %id, outcome = "expired", "Read refused");
                Err(StorageError::NotFound(id))
            }
            other => other,
        }
    }

    async fn resolve(&self, id: &str) -> Result<OpenedBlob, StorageError> {
        let record = self
            .index
            .find(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let now = self.clock.now();
        if record.is_expired(now) {
            self.heal(&record, "record expired");
            return Err(StorageError::Expired(record.id));
        }

        let stat = match self.blobs.stat(&record.storage_key).await {
            Ok(stat) => stat,
            Err(e) if e.is_not_found() => {
                self.heal(&record, "blob missing");
                return Err(StorageError::NotFound(record.id));
            }
            // Without a stamp the expiry cannot be honoured, so the blob is never served
            Err(StorageError::MissingStamp(_)) => {
                self.heal(&record, "blob unstamped");
                return Err(StorageError::NotFound(record.id));
            }
            Err(e) => return Err(e),
        };

        if stat.is_expired(now) {
            self.heal(&record, "blob expired");
            return Err(StorageError::Expired(record.id));
        }

        // The sweeper may have won the race since the stat
        let stream = match self.blobs.get_stream(&record.storage_key).await {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() => {
                self.heal(&record, "blob missing");
                return Err(StorageError::NotFound(record.id));
            }
            Err(StorageError::MissingStamp(_)) => {
                self.heal(&record, "blob unstamped");
                return Err(StorageError::NotFound(record.id));
            }
            Err(e) => return Err(e),
        };

        Ok(OpenedBlob {
            content_type: record.content_type.clone(),
            size_bytes: stat.size_bytes,
            record,
            stream,
        })
    }

    /// Drop a record that no longer has a live blob. Failures are logged only;
    /// the next read retries.
    pub(crate) fn heal(&self, record: &BlobRecord, reason: &str) {
        match self.index.delete(record) {
            Ok(()) => info!(
                id = %record.id,
                storage_key = %record.storage_key,
                reason = reason,
                "Removed stale record"
            ),
            Err(e) => warn!(
                id = %record.id,
                storage_key = %record.storage_key,
                reason = reason,
                error = %e,
                "Failed to remove stale record"
            ),
        }
    }
}
