//! In-process stand-ins for the external services.

use crate::error::{Error, Result};
use crate::record::{JobRecord, JobStatus};
use crate::services::{Delivery, NotificationQueue, ObjectStore, RecordStore, WorkQueue};
use crate::types::{JobId, ObjectBlob, ReceiptHandle};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<ReceiptHandle, Delivery>,
}

/// A FIFO queue usable both as the work queue and as the notification queue.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    /// Enqueue a body under a fresh message id.
    pub fn push(&self, body: impl Into<String>) -> JobId {
        let id = Uuid::new_v4().to_string();
        self.push_with_id(id.clone(), body);
        id
    }

    pub fn push_with_id(&self, id: impl Into<JobId>, body: impl Into<String>) {
        self.state.lock().unwrap().ready.push_back(Delivery {
            id: id.into(),
            receipt: String::new(),
            body: body.into(),
        });
    }

    /// Bodies waiting to be received, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.ready.iter().map(|d| d.body.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Received but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn receive_one(&self) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().unwrap();
        let mut delivery = match state.ready.pop_front() {
            Some(delivery) => delivery,
            None => return Ok(None),
        };
        delivery.receipt = Uuid::new_v4().to_string();
        state
            .in_flight
            .insert(delivery.receipt.clone(), delivery.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| Error::Queue(format!("unknown receipt handle {}", receipt)))
    }
}

#[async_trait]
impl NotificationQueue for MemoryQueue {
    async fn send(&self, text: &str) -> Result<()> {
        self.push(text);
        Ok(())
    }
}

#[derive(Default)]
struct ObjectState {
    objects: BTreeMap<(String, String), ObjectBlob>,
    failing_keys: HashSet<String>,
    puts: usize,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<ObjectState>,
}

impl MemoryObjectStore {
    pub fn insert(&self, bucket: &str, key: &str, blob: impl Into<ObjectBlob>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((bucket.to_string(), key.to_string()), blob.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<ObjectBlob> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// All keys in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Make every `put` of `key` fail.
    pub fn fail_puts_for(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_keys
            .insert(key.to_string());
    }

    /// Number of successful puts.
    pub fn put_count(&self) -> usize {
        self.state.lock().unwrap().puts
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .keys(bucket)
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBlob> {
        self.object(bucket, key)
            .ok_or_else(|| Error::ObjectStore(format!("no such key {}/{}", bucket, key)))
    }

    async fn put(&self, bucket: &str, key: &str, blob: ObjectBlob) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_keys.contains(key) {
            return Err(Error::ObjectStore(format!("put {}/{} rejected", bucket, key)));
        }
        state
            .objects
            .insert((bucket.to_string(), key.to_string()), blob);
        state.puts += 1;
        Ok(())
    }
}

#[derive(Default)]
struct RecordState {
    records: HashMap<JobId, JobRecord>,
    history: HashMap<JobId, Vec<JobStatus>>,
}

impl RecordState {
    fn store(&mut self, record: JobRecord) {
        let history = self.history.entry(record.job_id.clone()).or_default();
        if history.last() != Some(&record.status) {
            history.push(record.status);
        }
        self.records.insert(record.job_id.clone(), record);
    }
}

/// Record store that also remembers every distinct status each job was saved with.
#[derive(Default)]
pub struct MemoryRecordStore {
    state: Mutex<RecordState>,
}

impl MemoryRecordStore {
    pub fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.state.lock().unwrap().records.get(job_id).cloned()
    }

    /// Statuses `job_id` was persisted with, consecutive duplicates collapsed.
    pub fn history(&self, job_id: &str) -> Vec<JobStatus> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_id(&self, job_id: &str) -> Result<Option<JobRecord>> {
        Ok(self.record(job_id))
    }

    async fn create(&self, record: JobRecord) -> Result<JobRecord> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.records.get(&record.job_id) {
            return Ok(existing.clone());
        }
        state.store(record.clone());
        Ok(record)
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        self.state.lock().unwrap().store(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_receives_in_order_and_acks() {
        let queue = MemoryQueue::default();
        let first = queue.push("one");
        queue.push("two");

        let delivery = queue.receive_one().await.unwrap().unwrap();
        assert_eq!(delivery.id, first);
        assert_eq!(delivery.body, "one");
        assert_eq!(queue.in_flight(), 1);

        queue.ack(&delivery.receipt).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert!(matches!(
            queue.ack(&delivery.receipt).await,
            Err(Error::Queue(_))
        ));

        assert_eq!(queue.receive_one().await.unwrap().unwrap().body, "two");
        assert!(queue.receive_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn object_store_lists_by_prefix() {
        let store = MemoryObjectStore::default();
        store.insert("b", "j1/a.txt", "a");
        store.insert("b", "j10/b.txt", "b");
        store.insert("other", "j1/c.txt", "c");
        assert_eq!(store.list("b", "j1/").await.unwrap(), vec!["j1/a.txt"]);
        assert!(matches!(
            store.get("b", "missing").await,
            Err(Error::ObjectStore(_))
        ));
    }

    #[tokio::test]
    async fn record_create_does_not_overwrite() {
        let store = MemoryRecordStore::default();
        store
            .create(JobRecord::new("j", JobStatus::Queued))
            .await
            .unwrap();
        let again = store
            .create(JobRecord::new("j", JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(again.status, JobStatus::Queued);
        assert_eq!(store.len(), 1);
        assert_eq!(store.history("j"), vec![JobStatus::Queued]);
    }
}
