//! Upload coordinator
//!
//! Validates an upload, writes the blob, then the metadata record, and hands
//! back a locator. The blob is always written first: a failure after the blob
//! write leaves at most an orphaned object (reclaimed by the sweeper once it
//! expires), never a record pointing at nothing.

use crate::blob_store::{BlobStore, ByteStream};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{StorageError, ValidationError};
use crate::metadata::{NewBlobRecord, RecordRepository};
use crate::storage_key;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Path segment under the public base URL where records are served
pub const LOCATOR_PATH: &str = "images";

/// An upload as handed over by the transport layer
pub struct UploadRequest {
    pub data: ByteStream,
    /// Declared payload size in bytes
    pub size: u64,
    pub content_type: String,
    /// Requested TTL; `None` uses the configured default
    pub ttl_minutes: Option<i64>,
    /// Caller's filename, only used to make keys readable
    pub filename: Option<String>,
}

/// Result of a successful upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub id: String,
    #[serde(rename = "url")]
    pub locator: String,
    pub expires_at: DateTime<Utc>,
}

/// Acceptance rules for uploads
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub min_ttl_minutes: u32,
    pub max_ttl_minutes: u32,
    pub default_ttl_minutes: u32,
}

impl UploadPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bytes: config.max_upload_bytes,
            allowed_content_types: config.allowed_content_types.clone(),
            min_ttl_minutes: config.min_ttl_minutes,
            max_ttl_minutes: config.max_ttl_minutes,
            default_ttl_minutes: config.default_ttl_minutes,
        }
    }

    /// Check size, type and TTL; returns the TTL to apply.
    ///
    /// Out-of-range TTLs are rejected, never clamped.
    pub fn validate(
        &self,
        size: u64,
        content_type: &str,
        ttl_minutes: Option<i64>,
    ) -> Result<Duration, ValidationError> {
        if size == 0 {
            return Err(ValidationError::Empty);
        }
        if size > self.max_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_bytes,
            });
        }
        if !self.allows_content_type(content_type) {
            return Err(ValidationError::UnsupportedType(content_type.to_string()));
        }

        let minutes = ttl_minutes.unwrap_or(self.default_ttl_minutes as i64);
        if minutes < self.min_ttl_minutes as i64 || minutes > self.max_ttl_minutes as i64 {
            return Err(ValidationError::InvalidTtl {
                minutes,
                min: self.min_ttl_minutes,
                max: self.max_ttl_minutes,
            });
        }

        Ok(Duration::minutes(minutes))
    }

    /// Match against exact types and `family/*` patterns, ignoring parameters and case
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        let essence = essence(content_type);
        if essence.is_empty() || !essence.contains('/') {
            return false;
        }

        self.allowed_content_types.iter().any(|pattern| {
            let pattern = pattern.trim().to_ascii_lowercase();
            match pattern.strip_suffix("/*") {
                Some(family) => essence
                    .split_once('/')
                    .map(|(ty, sub)| ty == family && !sub.is_empty())
                    .unwrap_or(false),
                None => pattern == essence,
            }
        })
    }
}

/// `Image/PNG; charset=x` -> `image/png`
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Writes blob then metadata, returns a locator
pub struct UploadCoordinator {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn RecordRepository>,
    clock: Arc<dyn Clock>,
    policy: UploadPolicy,
    public_base_url: String,
}

impl UploadCoordinator {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn RecordRepository>,
        clock: Arc<dyn Clock>,
        policy: UploadPolicy,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            index,
            clock,
            policy,
            public_base_url: public_base_url.into(),
        }
    }

    /// Public locator for a record id
    pub fn locator_for(&self, id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.public_base_url.trim_end_matches('/'),
            LOCATOR_PATH,
            id
        )
    }

    pub async fn upload(&self, request: UploadRequest) -> Result<UploadReceipt, StorageError> {
        let UploadRequest {
            data,
            size,
            content_type,
            ttl_minutes,
            filename,
        } = request;

        let ttl = self.policy.validate(size, &content_type, ttl_minutes)?;
        let content_type = essence(&content_type);

        let key = storage_key::generate(filename.as_deref());
        let created_at = self.clock.now();
        let expires_at = created_at + ttl;

        // Refuse more bytes than were declared (and validated) as soon as they arrive
        let mut received = 0u64;
        let guarded = data
            .map(move |chunk: Result<Bytes, StorageError>| -> Result<Bytes, StorageError> {
                let chunk = chunk?;
                received += chunk.len() as u64;
                if received > size {
                    return Err(ValidationError::SizeMismatch {
                        declared: size,
                        received,
                    }
                    .into());
                }
                Ok(chunk)
            })
            .boxed();

        self.blobs
            .put(&key, guarded, size, &content_type, expires_at)
            .await?;

        let record = match self.index.insert(NewBlobRecord {
            storage_key: key.clone(),
            content_type,
            created_at,
            expires_at,
        }) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    storage_key = %key,
                    expires_at = %expires_at.to_rfc3339(),
                    error = %e,
                    "Metadata insert failed; blob left for the sweeper"
                );
                return Err(e);
            }
        };

        let locator = self.locator_for(&record.id);

        info!(
            id = %record.id,
            storage_key = %key,
            size = size,
            expires_at = %expires_at.to_rfc3339(),
            "Upload complete"
        );

        Ok(UploadReceipt {
            id: record.id,
            locator,
            expires_at,
        })
    }
}
