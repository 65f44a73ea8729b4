//! Narrow interfaces to the external services the worker consumes.
//!
//! The worker never implements these services itself; see `backends` for the
//! local stand-ins shipped with the library.

use crate::error::Result;
use crate::record::JobRecord;
use crate::types::{JobId, ObjectBlob, ReceiptHandle};
use async_trait::async_trait;

/// One message taken from the work queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub id: JobId,
    pub receipt: ReceiptHandle,
    pub body: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Take at most one message, `None` when the queue is empty.
    async fn receive_one(&self) -> Result<Option<Delivery>>;

    /// Acknowledge (delete) a received message.
    async fn ack(&self, receipt: &str) -> Result<()>;
}

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBlob>;
    async fn put(&self, bucket: &str, key: &str, blob: ObjectBlob) -> Result<()>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_id(&self, job_id: &str) -> Result<Option<JobRecord>>;

    /// Insert `record` unless one already exists for its job id, and return the stored record.
    async fn create(&self, record: JobRecord) -> Result<JobRecord>;

    /// Persist every field of `record`, inserting it if missing.
    async fn save(&self, record: &JobRecord) -> Result<()>;
}
