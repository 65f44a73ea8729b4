use super::messages::Message;
use crate::services::NotificationQueue;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Actor {
    inbox: mpsc::UnboundedReceiver<Message>,
    queue: Arc<dyn NotificationQueue>,
}

impl Actor {
    pub fn spawn(inbox: mpsc::UnboundedReceiver<Message>, queue: Arc<dyn NotificationQueue>) {
        let actor = Actor { inbox, queue };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        use self::Message::*;
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                Notify { text } => self.notify(&text).await,
                Flush { response } => {
                    // everything sent before the flush has been forwarded by now
                    let _ = response.send(());
                }
            }
        }
    }

    async fn notify(&self, text: &str) {
        match self.queue.send(text).await {
            Ok(()) => debug!(%text, "status sent"),
            Err(err) => warn!(%text, error = %err, "failed to send status notification"),
        }
    }
}
