//! Metadata index for uploaded blobs
//!
//! Maps an opaque record id to the blob's storage key, content type and validity
//! window. Backed by sled with two trees kept in step by transactions:
//!
//! - `records` - id -> MessagePack encoded [`BlobRecord`]
//! - `storage_keys` - storage key -> id (uniqueness of keys)

use crate::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Attempts at finding an unused id before giving up
const MAX_ID_ATTEMPTS: usize = 3;

/// Metadata index entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// Server-generated opaque id
    pub id: String,
    /// Key of the backing object
    pub storage_key: String,
    /// MIME type declared at upload
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Copy of the object's expiry stamp, written at upload time
    pub expires_at: DateTime<Utc>,
}

impl BlobRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Record contents before an id is assigned
#[derive(Debug, Clone)]
pub struct NewBlobRecord {
    pub storage_key: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Repository over blob records
pub trait RecordRepository: Send + Sync {
    /// Persist a record under a freshly generated id
    fn insert(&self, record: NewBlobRecord) -> Result<BlobRecord, StorageError>;

    fn find(&self, id: &str) -> Result<Option<BlobRecord>, StorageError>;

    /// Remove a record. Removing an absent record succeeds.
    fn delete(&self, record: &BlobRecord) -> Result<(), StorageError>;

    fn count(&self) -> Result<usize, StorageError>;
}

enum InsertConflict {
    Id,
    StorageKey,
}

/// sled-backed [`RecordRepository`]
pub struct MetadataIndex {
    db: Db,
    records: Tree,
    storage_keys: Tree,
}

impl MetadataIndex {
    /// Open or create the index
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened metadata index");
        Self::from_db(db)
    }

    /// Open a throwaway index (for tests)
    pub fn open_temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let records = db.open_tree("records")?;
        let storage_keys = db.open_tree("storage_keys")?;
        Ok(Self {
            db,
            records,
            storage_keys,
        })
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn try_insert(
        &self,
        record: &BlobRecord,
        value: &[u8],
    ) -> Result<(), TransactionError<InsertConflict>> {
        (&self.records, &self.storage_keys).transaction(|(records, storage_keys)| {
            if storage_keys.get(record.storage_key.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(InsertConflict::StorageKey));
            }
            if records.get(record.id.as_bytes())?.is_some() {
                return Err(ConflictableTransactionError::Abort(InsertConflict::Id));
            }
            records.insert(record.id.as_bytes(), value)?;
            storage_keys.insert(record.storage_key.as_bytes(), record.id.as_bytes())?;
            Ok(())
        })
    }
}

impl RecordRepository for MetadataIndex {
    fn insert(&self, new: NewBlobRecord) -> Result<BlobRecord, StorageError> {
        if new.expires_at <= new.created_at {
            return Err(StorageError::Internal(format!(
                "Record for {} expires before it is created",
                new.storage_key
            )));
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let record = BlobRecord {
                id: Uuid::new_v4().to_string(),
                storage_key: new.storage_key.clone(),
                content_type: new.content_type.clone(),
                created_at: new.created_at,
                expires_at: new.expires_at,
            };

            let value = encode(&record)?;

            match self.try_insert(&record, &value) {
                Ok(()) => {
                    debug!(id = %record.id, storage_key = %record.storage_key, "Inserted record");
                    return Ok(record);
                }
                Err(TransactionError::Abort(InsertConflict::Id)) => {
                    warn!(id = %record.id, "Generated id already taken, retrying");
                }
                Err(TransactionError::Abort(InsertConflict::StorageKey)) => {
                    return Err(StorageError::Internal(format!(
                        "Storage key already indexed: {}",
                        record.storage_key
                    )));
                }
                Err(TransactionError::Storage(e)) => return Err(e.into()),
            }
        }

        Err(StorageError::Internal("Could not generate a unique record id".to_string()))
    }

    fn find(&self, id: &str) -> Result<Option<BlobRecord>, StorageError> {
        match self.records.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, record: &BlobRecord) -> Result<(), StorageError> {
        let result: Result<(), TransactionError<()>> =
            (&self.records, &self.storage_keys).transaction(|(records, storage_keys)| {
                records.remove(record.id.as_bytes())?;
                storage_keys.remove(record.storage_key.as_bytes())?;
                Ok(())
            });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Storage(e)) => Err(e.into()),
            Err(TransactionError::Abort(())) => {
                Err(StorageError::Internal("Record delete aborted".to_string()))
            }
        }
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(self.records.len())
    }
}

fn encode(record: &BlobRecord) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(record)
        .map_err(|e| StorageError::Internal(format!("Serialization error: {}", e)))
}

fn decode(value: &[u8]) -> Result<BlobRecord, StorageError> {
    rmp_serde::from_slice(value)
        .map_err(|e| StorageError::Internal(format!("Deserialization error: {}", e)))
}
