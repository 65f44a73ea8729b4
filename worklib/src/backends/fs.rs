//! Directory-backed queue and object store for single-host deployments.
//!
//! Several worker processes may share one `DirQueue`: a message is claimed by
//! renaming it out of `ready/`, and only one rename of a given file can succeed.
//! Claimed messages come back only when the queue has a visibility timeout.

use crate::error::{Error, Result};
use crate::services::{Delivery, NotificationQueue, ObjectStore, WorkQueue};
use crate::types::ObjectBlob;
use async_trait::async_trait;
use chrono::Utc;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

const READY: &str = "ready";
const IN_FLIGHT: &str = "inflight";
const TMP: &str = "tmp";

fn queue_err(what: &str, path: &Path, err: io::Error) -> Error {
    Error::Queue(format!("{} {}: {}", what, path.display(), err))
}

/// A queue kept as one file per message.
///
/// `ready/<stamp>-<seq>-<id>` holds waiting messages, `inflight/<id>.<claimed>.<nonce>`
/// holds received ones until they are acknowledged. The in-flight name is the receipt
/// handle; `claimed` is the receive time in microseconds.
pub struct DirQueue {
    root: PathBuf,
    seq: AtomicU64,
    visibility_timeout: Option<Duration>,
}

impl DirQueue {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in [READY, IN_FLIGHT, TMP] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|err| queue_err("create", &path, err))?;
        }
        Ok(Self {
            root,
            seq: AtomicU64::new(0),
            visibility_timeout: None,
        })
    }

    /// Put received messages that stay unacknowledged for `timeout` back into `ready/`.
    /// Their old receipt handles stop working.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Enqueue `body` and return its message id.
    pub async fn push(&self, body: &str) -> Result<String> {
        let id = Uuid::new_v4().to_simple().to_string();
        let tmp = self.root.join(TMP).join(&id);
        fs::write(&tmp, body)
            .await
            .map_err(|err| queue_err("write", &tmp, err))?;
        self.make_ready(&tmp, &id).await?;
        Ok(id)
    }

    async fn make_ready(&self, from: &Path, id: &str) -> Result<()> {
        let name = format!(
            "{:020}-{:010}-{}",
            Utc::now().timestamp_micros(),
            self.seq.fetch_add(1, Ordering::Relaxed),
            id
        );
        let ready = self.root.join(READY).join(name);
        fs::rename(from, &ready)
            .await
            .map_err(|err| queue_err("publish", &ready, err))
    }

    /// Move in-flight messages claimed more than `timeout` ago back to `ready/`.
    async fn requeue_expired(&self, timeout: Duration) -> Result<()> {
        let now = Utc::now().timestamp_micros();
        let timeout = i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX);
        for receipt in self.names(IN_FLIGHT).await? {
            let (id, claimed) = match parse_receipt(&receipt) {
                Some(parsed) => parsed,
                None => continue,
            };
            if now.saturating_sub(claimed) < timeout {
                continue;
            }
            let from = self.root.join(IN_FLIGHT).join(&receipt);
            match self.make_ready(&from, id).await {
                Ok(()) => info!(%receipt, "visibility timeout expired, message requeued"),
                Err(err) => {
                    if fs::metadata(&from).await.is_ok() {
                        return Err(err);
                    }
                    debug!(%receipt, "message acked or requeued elsewhere");
                }
            }
        }
        Ok(())
    }

    async fn names(&self, sub: &str) -> Result<Vec<String>> {
        let dir = self.root.join(sub);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|err| queue_err("read", &dir, err))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| queue_err("read", &dir, err))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn message_id(ready_name: &str) -> Option<&str> {
    ready_name.rsplit('-').next().filter(|id| !id.is_empty())
}

/// Split `<id>.<claimed>.<nonce>` into the message id and its claim time.
fn parse_receipt(receipt: &str) -> Option<(&str, i64)> {
    let mut parts = receipt.rsplitn(3, '.');
    let _nonce = parts.next()?;
    let claimed = parts.next()?.parse().ok()?;
    let id = parts.next().filter(|id| !id.is_empty())?;
    Some((id, claimed))
}

#[async_trait]
impl WorkQueue for DirQueue {
    async fn receive_one(&self) -> Result<Option<Delivery>> {
        if let Some(timeout) = self.visibility_timeout {
            self.requeue_expired(timeout).await?;
        }
        for name in self.names(READY).await? {
            let id = match message_id(&name) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let receipt = format!(
                "{}.{}.{}",
                id,
                Utc::now().timestamp_micros(),
                Uuid::new_v4().to_simple()
            );
            let from = self.root.join(READY).join(&name);
            let to = self.root.join(IN_FLIGHT).join(&receipt);
            match fs::rename(&from, &to).await {
                Ok(()) => {}
                // claimed by another worker in the meantime
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(file = %name, "message already claimed");
                    continue;
                }
                Err(err) => return Err(queue_err("claim", &from, err)),
            }
            let body = fs::read(&to)
                .await
                .map_err(|err| queue_err("read", &to, err))?;
            return Ok(Some(Delivery {
                id,
                receipt,
                body: String::from_utf8_lossy(&body).into_owned(),
            }));
        }
        Ok(None)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        if !is_plain_name(receipt) {
            return Err(Error::Queue(format!("malformed receipt handle {:?}", receipt)));
        }
        let path = self.root.join(IN_FLIGHT).join(receipt);
        fs::remove_file(&path)
            .await
            .map_err(|err| queue_err("ack", &path, err))
    }
}

#[async_trait]
impl NotificationQueue for DirQueue {
    async fn send(&self, text: &str) -> Result<()> {
        self.push(text).await.map(|_| ())
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_relative_key(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Object store laid out as `<root>/<bucket>/<key>`.
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        if !is_plain_name(bucket) || !is_relative_key(key) {
            return Err(Error::ObjectStore(format!(
                "invalid object location {}/{}",
                bucket, key
            )));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

fn store_err(what: &str, path: &Path, err: io::Error) -> Error {
    Error::ObjectStore(format!("{} {}: {}", what, path.display(), err))
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        if !is_plain_name(bucket) {
            return Err(Error::ObjectStore(format!("invalid bucket {:?}", bucket)));
        }
        let bucket_dir = self.root.join(bucket);
        let mut keys = Vec::new();
        let mut pending = vec![(bucket_dir.clone(), String::new())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // a bucket nobody wrote to yet is empty
                Err(err) if err.kind() == io::ErrorKind::NotFound && dir == bucket_dir => {
                    return Ok(keys);
                }
                Err(err) => return Err(store_err("list", &dir, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| store_err("list", &dir, err))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}{}", key_prefix, name);
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| store_err("stat", &entry.path(), err))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), format!("{}/", key)));
                } else if file_type.is_file() && key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBlob> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path)
            .await
            .map(ObjectBlob::from)
            .map_err(|err| store_err("get", &path, err))
    }

    async fn put(&self, bucket: &str, key: &str, blob: ObjectBlob) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| store_err("create", parent, err))?;
        }
        fs::write(&path, &blob)
            .await
            .map_err(|err| store_err("put", &path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_queue_claims_and_acks() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = DirQueue::open(tmp.path()).await.unwrap();
        let first = queue.push(r#"{"a":1}"#).await.unwrap();
        let second = queue.push("second").await.unwrap();

        let delivery = queue.receive_one().await.unwrap().unwrap();
        assert_eq!(delivery.id, first);
        assert_eq!(delivery.body, r#"{"a":1}"#);
        assert!(tmp.path().join(IN_FLIGHT).join(&delivery.receipt).exists());

        queue.ack(&delivery.receipt).await.unwrap();
        assert!(!tmp.path().join(IN_FLIGHT).join(&delivery.receipt).exists());

        let next = queue.receive_one().await.unwrap().unwrap();
        assert_eq!(next.id, second);
        assert!(queue.receive_one().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_messages_stay_in_flight_without_a_visibility_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = DirQueue::open(tmp.path()).await.unwrap();
        queue.push("body").await.unwrap();
        let delivery = queue.receive_one().await.unwrap().unwrap();
        assert!(queue.receive_one().await.unwrap().is_none());
        assert!(tmp.path().join(IN_FLIGHT).join(&delivery.receipt).exists());
    }

    #[tokio::test]
    async fn unacked_messages_return_after_the_visibility_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = DirQueue::open(tmp.path())
            .await
            .unwrap()
            .with_visibility_timeout(Duration::from_millis(200));
        let id = queue.push("body").await.unwrap();

        let first = queue.receive_one().await.unwrap().unwrap();
        assert!(queue.receive_one().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let again = queue.receive_one().await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.body, "body");
        assert_ne!(again.receipt, first.receipt);

        assert!(matches!(queue.ack(&first.receipt).await, Err(Error::Queue(_))));
        queue.ack(&again.receipt).await.unwrap();
        assert!(queue.receive_one().await.unwrap().is_none());
    }

    #[test]
    fn receipts_carry_the_claim_time() {
        assert_eq!(parse_receipt("abc.1700.ff00"), Some(("abc", 1700)));
        assert_eq!(parse_receipt("a.b.1700.ff00"), Some(("a.b", 1700)));
        assert_eq!(parse_receipt("abc.ff00"), None);
        assert_eq!(parse_receipt("abc.later.ff00"), None);
    }

    #[tokio::test]
    async fn dir_queue_rejects_path_receipts() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = DirQueue::open(tmp.path()).await.unwrap();
        assert!(matches!(
            queue.ack("../ready/x").await,
            Err(Error::Queue(_))
        ));
    }

    #[tokio::test]
    async fn two_queues_on_one_directory_never_share_a_message() {
        let tmp = tempfile::tempdir().unwrap();
        let a = DirQueue::open(tmp.path()).await.unwrap();
        let b = DirQueue::open(tmp.path()).await.unwrap();
        a.push("only").await.unwrap();
        let got_a = a.receive_one().await.unwrap();
        let got_b = b.receive_one().await.unwrap();
        assert!(got_a.is_some());
        assert!(got_b.is_none());
    }

    #[tokio::test]
    async fn dir_object_store_round_trip_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirObjectStore::new(tmp.path());
        assert!(store.list("b1", "job/").await.unwrap().is_empty());

        store
            .put("b1", "job/in.txt", ObjectBlob::from_static(b"data"))
            .await
            .unwrap();
        store
            .put("b1", "job/nested/x", ObjectBlob::from_static(b"x"))
            .await
            .unwrap();
        store
            .put("b1", "other/y", ObjectBlob::from_static(b"y"))
            .await
            .unwrap();

        assert_eq!(
            store.list("b1", "job/").await.unwrap(),
            vec!["job/in.txt", "job/nested/x"]
        );
        assert_eq!(&store.get("b1", "job/in.txt").await.unwrap()[..], b"data");
        assert!(matches!(
            store.get("b1", "../escape").await,
            Err(Error::ObjectStore(_))
        ));
    }
}
