use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Opaque acknowledgment token issued by the source for one delivery.
///
/// A redelivered message gets a fresh handle, so handles identify
/// deliveries rather than messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle(String);

impl AckHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// A fresh random handle, for sources without their own token scheme.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as delivered by the source.
#[derive(Debug, Clone)]
pub struct Message {
    /// Source-assigned message id, stable across redeliveries
    pub id: String,
    pub payload: Vec<u8>,
    /// Event time used for windowing
    pub publish_time: DateTime<Utc>,
    pub ack: AckHandle,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        publish_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            publish_time,
            ack: AckHandle::generate(),
        }
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.publish_time
    }
}
