//! Ephemeral Storage - expiring blob storage
//!
//! Upload a binary object, get back a locator, and the object becomes
//! unreachable once its time-to-live runs out.
//!
//! ## Architecture
//!
//! - **Blob store**: objects on disk, each stamped with its own expiry
//! - **Metadata index**: sled database mapping record ids to objects
//! - **Read path**: refuses expired content and drops stale records
//! - **Sweeper**: background pass deleting expired objects
//!
//! The blob store and the index fail independently and are never written in a
//! shared transaction. Uploads write the blob before the record, so the index
//! never points at an object that was never written; everything else is healed
//! by the read path and the sweeper.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/ephemeral-storage/
//! ├── blobs/
//! │   └── images/            # Bucket
//! │       ├── 3f/            # First 2 chars of the key
//! │       │   └── 3fa2...-cat.png
//! │       └── c0/
//! ├── metadata.sled/         # Metadata index
//! └── config.toml            # Configuration
//! ```

pub mod blob_store;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metadata;
pub mod services;
pub mod storage_key;
pub mod sweeper;

// Re-exports
pub use blob_store::{BlobStore, ByteStream, FsBlobStore, ObjectMetadata};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{StorageError, ValidationError};
pub use http::HttpServer;
pub use metadata::{BlobRecord, MetadataIndex, NewBlobRecord, RecordRepository};
pub use services::{ExpiringStore, OpenedBlob, UploadReceipt, UploadRequest};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
