use tokio::sync::oneshot;

#[derive(Debug)]
pub enum Message {
    Notify { text: String },
    Flush { response: oneshot::Sender<()> },
}
