//! Service layer for ephemeral-storage
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin)
//!     ↓
//! ExpiringStore (upload / open / delete)
//!     ↓
//! BlobStore (objects)      RecordRepository (metadata index)
//! ```
//!
//! The two stores are never written in one transaction. Ordering carries the
//! consistency: uploads write blob then record, deletes remove record then blob,
//! reads drop records whose blob is gone.

pub mod reader;
pub mod response;
pub mod upload;

// Re-exports
pub use reader::{BlobReader, OpenedBlob};
pub use upload::{UploadCoordinator, UploadPolicy, UploadReceipt, UploadRequest};

use crate::blob_store::BlobStore;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::StorageError;
use crate::metadata::RecordRepository;
use crate::sweeper::Sweeper;
use std::sync::Arc;
use tracing::{debug, info};

/// Facade over both stores, shared by the HTTP layer
pub struct ExpiringStore {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn RecordRepository>,
    clock: Arc<dyn Clock>,
    uploads: UploadCoordinator,
    reader: BlobReader,
}

impl ExpiringStore {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn RecordRepository>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let uploads = UploadCoordinator::new(
            blobs.clone(),
            index.clone(),
            clock.clone(),
            UploadPolicy::from_config(config),
            config.public_base_url.clone(),
        );
        let reader = BlobReader::new(blobs.clone(), index.clone(), clock.clone());

        Self {
            blobs,
            index,
            clock,
            uploads,
            reader,
        }
    }

    pub async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt, StorageError> {
        self.uploads.upload(request).await
    }

    pub async fn open(&self, id: &str) -> Result<OpenedBlob, StorageError> {
        self.reader.open(id).await
    }

    /// Remove a record and its blob.
    ///
    /// The record goes first so a failure in between leaves only an orphaned
    /// blob, which the sweeper reclaims once it expires. An expired record is
    /// answered like an unknown id: its record is dropped and the blob is left
    /// to the sweeper.
    pub async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let record = self
            .index
            .find(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if record.is_expired(self.clock.now()) {
            self.reader.heal(&record, "record expired");
            debug!(id = %id, outcome = "expired", "Delete refused");
            return Err(StorageError::NotFound(record.id));
        }

        self.index.delete(&record)?;
        self.blobs.delete(&record.storage_key).await?;

        info!(id = %id, storage_key = %record.storage_key, "Deleted upload");
        Ok(())
    }

    /// Number of records in the metadata index
    pub fn record_count(&self) -> Result<usize, StorageError> {
        self.index.count()
    }

    /// Sweeper sharing this store's blobs and clock
    pub fn sweeper(&self, config: &Config) -> Sweeper {
        Sweeper::new(
            self.blobs.clone(),
            self.clock.clone(),
            config.sweep_interval(),
            config.lifecycle_window(),
        )
    }
}
