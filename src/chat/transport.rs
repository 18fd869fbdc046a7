// The physical transport seen as a black box.
// One `open` yields one link: a text sink, a text stream and the far end's session id.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    Refused(String),
}

/// An open bidirectional link. The link is dead once `incoming` yields `None`.
pub struct Link {
    pub session_id: String,
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<Link, TransportError>;
}
