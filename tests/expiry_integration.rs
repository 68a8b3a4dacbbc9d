//! Integration tests for the upload / read / sweep lifecycle
//!
//! Run against the real filesystem blob store and sled index in temporary
//! directories, with a manual clock standing in for the passage of time.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use ephemeral_storage::blob_store::bytes_stream;
use ephemeral_storage::{
    BlobRecord, BlobStore, ByteStream, Clock, Config, ExpiringStore, FsBlobStore, ManualClock,
    MetadataIndex, NewBlobRecord, ObjectMetadata, RecordRepository, StorageError, Sweeper,
    UploadRequest, ValidationError,
};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    store: ExpiringStore,
    blobs: Arc<FsBlobStore>,
    index: Arc<MetadataIndex>,
    clock: Arc<ManualClock>,
    sweeper: Sweeper,
    temp: TempDir,
}

fn test_config() -> Config {
    Config {
        public_base_url: "https://share.example.com/".to_string(),
        max_upload_bytes: 64 * 1024,
        ..Config::default()
    }
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let config = test_config();
    let blobs = Arc::new(FsBlobStore::open(temp.path(), &config.bucket).await.unwrap());
    let index = Arc::new(MetadataIndex::open(temp.path().join("metadata.sled")).unwrap());
    let clock = Arc::new(ManualClock::starting_now());

    let store = ExpiringStore::new(blobs.clone(), index.clone(), clock.clone(), &config);
    let sweeper = store.sweeper(&config);

    Harness {
        store,
        blobs,
        index,
        clock,
        sweeper,
        temp,
    }
}

fn png_request(data: &[u8], minutes: i64) -> UploadRequest {
    UploadRequest {
        data: bytes_stream(data.to_vec()),
        size: data.len() as u64,
        content_type: "image/png".to_string(),
        ttl_minutes: Some(minutes),
        filename: Some("cat.png".to_string()),
    }
}

async fn read_all(stream: ByteStream) -> Vec<u8> {
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    chunks.concat()
}

async fn object_keys(blobs: &FsBlobStore) -> Vec<String> {
    blobs.list_all().try_collect().await.unwrap()
}

fn sample_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 256) as u8).collect()
}

#[tokio::test]
async fn test_read_before_expiry_returns_identical_bytes() {
    let h = harness().await;
    let data = sample_image(5000);

    for minutes in [1, 30, 10080] {
        let receipt = h.store.upload(png_request(&data, minutes)).await.unwrap();
        h.clock.advance(Duration::minutes(minutes) - Duration::seconds(1));

        let blob = h.store.open(&receipt.id).await.unwrap();
        assert_eq!(blob.content_type, "image/png");
        assert_eq!(blob.size_bytes, data.len() as u64);
        assert_eq!(read_all(blob.stream).await, data);

        h.clock.set(receipt.expires_at - Duration::minutes(minutes));
    }
}

#[tokio::test]
async fn test_locator_and_record_match_upload() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"img", 15)).await.unwrap();

    assert_eq!(
        receipt.locator,
        format!("https://share.example.com/images/{}", receipt.id)
    );
    assert_eq!(receipt.expires_at, h.clock.now() + Duration::minutes(15));

    let record = h.index.find(&receipt.id).unwrap().unwrap();
    assert_eq!(record.expires_at, receipt.expires_at);
    assert!(record.storage_key.ends_with("-cat.png"));

    // Object stamp and record agree
    let stamp = h.blobs.stat(&record.storage_key).await.unwrap();
    assert_eq!(
        stamp.expires_at.timestamp_millis(),
        record.expires_at.timestamp_millis()
    );
    assert_eq!(stamp.content_type, "image/png");
}

#[tokio::test]
async fn test_read_at_or_after_expiry_is_not_found_and_heals_record() {
    let h = harness().await;

    let at = h.store.upload(png_request(b"at", 5)).await.unwrap();
    let after = h.store.upload(png_request(b"after", 5)).await.unwrap();

    h.clock.set(at.expires_at);
    let err = h.store.open(&at.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(h.index.find(&at.id).unwrap().is_none());

    h.clock.advance(Duration::hours(3));
    let err = h.store.open(&after.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(h.index.find(&after.id).unwrap().is_none());

    // The read path leaves objects to the sweeper
    assert_eq!(object_keys(&h.blobs).await.len(), 2);
}

#[tokio::test]
async fn test_unknown_id_is_not_found() {
    let h = harness().await;
    let err = h.store.open("does-not-exist").await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn test_missing_blob_heals_record() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"gone soon", 60)).await.unwrap();
    let record = h.index.find(&receipt.id).unwrap().unwrap();

    h.blobs.delete(&record.storage_key).await.unwrap();

    let err = h.store.open(&receipt.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(h.index.find(&receipt.id).unwrap().is_none());
}

#[tokio::test]
async fn test_stamp_is_authoritative_over_record() {
    let h = harness().await;
    let now = h.clock.now();

    // Record still claims an hour, object stamp already passed
    let key = "0a0a-stale.png";
    h.blobs
        .put(key, bytes_stream(&b"x"[..]), 1, "image/png", now - Duration::seconds(1))
        .await
        .unwrap();
    let record = h
        .index
        .insert(NewBlobRecord {
            storage_key: key.to_string(),
            content_type: "image/png".to_string(),
            created_at: now - Duration::minutes(1),
            expires_at: now + Duration::hours(1),
        })
        .unwrap();

    let err = h.store.open(&record.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(h.index.find(&record.id).unwrap().is_none());
}

#[tokio::test]
async fn test_oversized_upload_writes_nothing() {
    let h = harness().await;
    let data = sample_image(64 * 1024 + 1);

    let err = h.store.upload(png_request(&data, 5)).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Validation(ValidationError::TooLarge { .. })
    ));
    assert!(object_keys(&h.blobs).await.is_empty());
    assert_eq!(h.index.count().unwrap(), 0);
}

#[tokio::test]
async fn test_understated_size_writes_nothing() {
    let h = harness().await;
    let mut request = png_request(&sample_image(2048), 5);
    request.size = 100;

    let err = h.store.upload(request).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Validation(ValidationError::SizeMismatch { .. })
    ));
    assert!(object_keys(&h.blobs).await.is_empty());
    assert_eq!(h.index.count().unwrap(), 0);
}

#[tokio::test]
async fn test_rejected_type_and_ttl_write_nothing() {
    let h = harness().await;

    let mut request = png_request(b"<html>", 5);
    request.content_type = "text/html".to_string();
    let err = h.store.upload(request).await.unwrap_err();
    assert!(matches!(
        err,
        StorageError::Validation(ValidationError::UnsupportedType(_))
    ));

    for minutes in [0, 10081] {
        let err = h.store.upload(png_request(b"img", minutes)).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::Validation(ValidationError::InvalidTtl { .. })
        ));
    }

    let err = h.store.upload(png_request(b"", 5)).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(ValidationError::Empty)));

    assert!(object_keys(&h.blobs).await.is_empty());
    assert_eq!(h.index.count().unwrap(), 0);
}

#[tokio::test]
async fn test_missing_ttl_uses_default() {
    let h = harness().await;
    let mut request = png_request(b"img", 0);
    request.ttl_minutes = None;

    let receipt = h.store.upload(request).await.unwrap();
    assert_eq!(receipt.expires_at, h.clock.now() + Duration::minutes(1440));
}

#[tokio::test]
async fn test_sweep_deletes_exactly_the_expired() {
    let h = harness().await;

    let mut expired = Vec::new();
    for i in 0..4 {
        let data = sample_image(100 + i);
        expired.push(h.store.upload(png_request(&data, 1)).await.unwrap());
    }
    let mut live = Vec::new();
    for i in 0..3 {
        let data = sample_image(200 + i);
        let receipt = h.store.upload(png_request(&data, 60)).await.unwrap();
        live.push((receipt, data));
    }

    h.clock.advance(Duration::minutes(2));
    let report = h.sweeper.sweep_once().await.unwrap();

    assert_eq!(report.scanned, 7);
    assert_eq!(report.deleted, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(object_keys(&h.blobs).await.len(), 3);

    for (receipt, data) in live {
        let blob = h.store.open(&receipt.id).await.unwrap();
        assert_eq!(read_all(blob.stream).await, data);
    }

    // The sweeper leaves records alone; reads drop them
    for receipt in expired {
        assert!(h.index.find(&receipt.id).unwrap().is_some());
        assert!(h.store.open(&receipt.id).await.is_err());
        assert!(h.index.find(&receipt.id).unwrap().is_none());
    }
}

#[tokio::test]
async fn test_read_and_sweep_race_on_expired_blob() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"racy", 1)).await.unwrap();
    h.clock.advance(Duration::minutes(1));

    let (read, sweep) = tokio::join!(h.store.open(&receipt.id), h.sweeper.sweep_once());

    assert!(matches!(read, Err(StorageError::NotFound(_))));
    let report = sweep.unwrap();
    assert_eq!(report.failed, 0);

    assert!(object_keys(&h.blobs).await.is_empty());
    assert!(h.index.find(&receipt.id).unwrap().is_none());
}

#[tokio::test]
async fn test_read_after_sweep_heals_record() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"img", 1)).await.unwrap();
    h.clock.advance(Duration::minutes(5));

    h.sweeper.sweep_once().await.unwrap();
    assert!(h.index.find(&receipt.id).unwrap().is_some());

    // Rewind so the record itself looks live: only the missing blob can tell
    h.clock.advance(Duration::minutes(-5));
    let err = h.store.open(&receipt.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(h.index.find(&receipt.id).unwrap().is_none());
}

#[tokio::test]
async fn test_double_delete_of_storage_key_succeeds() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"img", 5)).await.unwrap();
    let key = h.index.find(&receipt.id).unwrap().unwrap().storage_key;

    h.blobs.delete(&key).await.unwrap();
    h.blobs.delete(&key).await.unwrap();
}

#[tokio::test]
async fn test_explicit_delete_removes_both() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"img", 5)).await.unwrap();

    h.store.delete(&receipt.id).await.unwrap();

    assert!(h.index.find(&receipt.id).unwrap().is_none());
    assert!(object_keys(&h.blobs).await.is_empty());
    assert!(matches!(
        h.store.delete(&receipt.id).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_of_expired_upload_looks_like_unknown_id() {
    let h = harness().await;
    let receipt = h.store.upload(png_request(b"img", 1)).await.unwrap();
    h.clock.advance(Duration::minutes(5));

    let expired = h.store.delete(&receipt.id).await.unwrap_err();
    let unknown = h.store.delete("never-existed").await.unwrap_err();
    assert!(matches!(expired, StorageError::NotFound(_)));
    assert!(matches!(unknown, StorageError::NotFound(_)));

    assert!(h.index.find(&receipt.id).unwrap().is_none());
    // Reclaiming the object stays with the sweeper
    assert_eq!(object_keys(&h.blobs).await.len(), 1);
    assert_eq!(h.sweeper.sweep_once().await.unwrap().deleted, 1);
}

#[tokio::test]
async fn test_unstamped_blob_is_not_served_and_heals_record() {
    let h = harness().await;
    let now = h.clock.now();

    let key = "c0ffee-raw.png";
    let shard = h.temp.path().join("images").join(&key[..2]);
    std::fs::create_dir_all(&shard).unwrap();
    std::fs::write(shard.join(key), b"no header, just bytes").unwrap();

    let record = h
        .index
        .insert(NewBlobRecord {
            storage_key: key.to_string(),
            content_type: "image/png".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(1),
        })
        .unwrap();

    let err = h.store.open(&record.id).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
    assert!(h.index.find(&record.id).unwrap().is_none());

    // The lifecycle window decides when the object itself goes
    assert_eq!(object_keys(&h.blobs).await, vec![key.to_string()]);
}

#[tokio::test]
async fn test_cat_png_scenario() {
    let h = harness().await;
    let cat = sample_image(2048);

    let receipt = h.store.upload(png_request(&cat, 1)).await.unwrap();
    assert!(receipt.locator.ends_with(&receipt.id));
    let key = h.index.find(&receipt.id).unwrap().unwrap().storage_key;

    let blob = h.store.open(&receipt.id).await.unwrap();
    assert_eq!(blob.content_type, "image/png");
    assert_eq!(read_all(blob.stream).await, cat);

    h.clock.advance(Duration::seconds(61));
    assert!(matches!(
        h.store.open(&receipt.id).await,
        Err(StorageError::NotFound(_))
    ));
    assert!(h.index.find(&receipt.id).unwrap().is_none());

    // Record already healed; the sweep only reclaims the object
    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.failed, 0);
    assert!(h.blobs.stat(&key).await.unwrap_err().is_not_found());

    let report = h.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(report.deleted, 0);
}

/// Blob store that is down
struct UnavailableStore;

#[async_trait]
impl BlobStore for UnavailableStore {
    async fn put(
        &self,
        _key: &str,
        _data: ByteStream,
        _size: u64,
        _content_type: &str,
        _expires_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StorageError> {
        Err(StorageError::StorageUnavailable("connection refused".to_string()))
    }

    async fn stat(&self, _key: &str) -> Result<ObjectMetadata, StorageError> {
        Err(StorageError::StorageUnavailable("connection refused".to_string()))
    }

    async fn get_stream(&self, _key: &str) -> Result<ByteStream, StorageError> {
        Err(StorageError::StorageUnavailable("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::StorageUnavailable("connection refused".to_string()))
    }

    async fn last_modified(
        &self,
        _key: &str,
    ) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
        Err(StorageError::StorageUnavailable("connection refused".to_string()))
    }

    fn list_all(&self) -> BoxStream<'_, Result<String, StorageError>> {
        Box::pin(futures_util::stream::once(async {
            Err(StorageError::StorageUnavailable("connection refused".to_string()))
        }))
    }
}

#[tokio::test]
async fn test_failed_put_writes_no_metadata() {
    let index = Arc::new(MetadataIndex::open_temporary().unwrap());
    let clock = Arc::new(ManualClock::starting_now());
    let store = ExpiringStore::new(Arc::new(UnavailableStore), index.clone(), clock, &test_config());

    let err = store.upload(png_request(b"img", 5)).await.unwrap_err();
    assert!(matches!(err, StorageError::StorageUnavailable(_)));
    assert_eq!(index.count().unwrap(), 0);
}

#[tokio::test]
async fn test_backend_outage_on_read_keeps_record() {
    let index = Arc::new(MetadataIndex::open_temporary().unwrap());
    let clock = Arc::new(ManualClock::starting_now());
    let now = clock.now();
    let record = index
        .insert(NewBlobRecord {
            storage_key: "ab-x.png".to_string(),
            content_type: "image/png".to_string(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
        })
        .unwrap();
    let store = ExpiringStore::new(Arc::new(UnavailableStore), index.clone(), clock, &test_config());

    let err = store.open(&record.id).await.unwrap_err();
    assert!(matches!(err, StorageError::StorageUnavailable(_)));
    // A transient outage is not proof the blob is gone
    assert!(index.find(&record.id).unwrap().is_some());
}

/// Index that refuses writes
struct ReadOnlyIndex;

impl RecordRepository for ReadOnlyIndex {
    fn insert(&self, _record: NewBlobRecord) -> Result<BlobRecord, StorageError> {
        Err(StorageError::Internal("index is read-only".to_string()))
    }

    fn find(&self, _id: &str) -> Result<Option<BlobRecord>, StorageError> {
        Ok(None)
    }

    fn delete(&self, _record: &BlobRecord) -> Result<(), StorageError> {
        Ok(())
    }

    fn count(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_failed_insert_leaves_orphan_for_sweeper() {
    let temp = TempDir::new().unwrap();
    let config = test_config();
    let blobs = Arc::new(FsBlobStore::open(temp.path(), &config.bucket).await.unwrap());
    let clock = Arc::new(ManualClock::starting_now());
    let store = ExpiringStore::new(blobs.clone(), Arc::new(ReadOnlyIndex), clock.clone(), &config);

    assert!(store.upload(png_request(b"img", 1)).await.is_err());
    assert_eq!(object_keys(&blobs).await.len(), 1);

    let sweeper = store.sweeper(&config);
    assert_eq!(sweeper.sweep_once().await.unwrap().deleted, 0);

    clock.advance(Duration::minutes(1));
    assert_eq!(sweeper.sweep_once().await.unwrap().deleted, 1);
    assert!(object_keys(&blobs).await.is_empty());
}
