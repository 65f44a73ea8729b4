mod actor;
mod messages;

use crate::services::NotificationQueue;
use actor::Actor;
use chrono::{DateTime, SecondsFormat, Utc};
use messages::Message;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Fire-and-forget lifecycle notifications.
///
/// This struct is an actor handle. Texts are forwarded to the notification queue by the
/// actor spawned in `StatusReporter::spawn`, so sending never blocks the job pipeline and
/// a failed send is only logged.
#[derive(Clone)]
pub struct StatusReporter {
    sender: mpsc::UnboundedSender<Message>,
}

impl StatusReporter {
    /// Spawn the forwarding actor. Must be called from within a tokio runtime.
    pub fn spawn(queue: Arc<dyn NotificationQueue>) -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Actor::spawn(inbox, queue);
        Self { sender }
    }

    pub fn notify(&self, text: impl Into<String>) {
        let _ = self.sender.send(Message::Notify { text: text.into() });
    }

    pub fn received(&self, worker: &str, job_id: &str) {
        self.notify(format!("{} received {}", worker, job_id));
    }

    pub fn started(&self, job_id: &str, at: DateTime<Utc>) {
        self.notify(format!("{} started at {}", job_id, rfc3339(at)));
    }

    pub fn finished(&self, job_id: &str, at: DateTime<Utc>) {
        self.notify(format!("{} finished at {}", job_id, rfc3339(at)));
    }

    /// Wait until every notification sent so far has been handed to the queue.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Message::Flush { response: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
