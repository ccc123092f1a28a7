use super::message::{AckHandle, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Result of one pull against the source.
#[derive(Debug, Default)]
pub struct PullResponse {
    pub messages: Vec<Message>,
    /// "No message published before this time is still undelivered", if known
    pub low_watermark: Option<DateTime<Utc>>,
    /// The topic is finite and fully delivered
    pub end_of_stream: bool,
}

/// A durable, at-least-once publish/subscribe feed.
#[async_trait]
pub trait Source: Send + Sync {
    fn topic(&self) -> &str;

    /// Fetch up to `max_messages` messages. May return an empty response.
    async fn pull(&self, max_messages: usize) -> Result<PullResponse, SourceError>;

    /// Remove delivered messages from the topic.
    async fn ack(&self, handles: &[AckHandle]) -> Result<(), SourceError>;

    /// Request redelivery of delivered messages.
    async fn nack(&self, handles: &[AckHandle]) -> Result<(), SourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Worth retrying: network trouble, service restarts
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source error: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}
