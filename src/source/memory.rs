use super::message::{AckHandle, Message};
use super::traits::{PullResponse, Source, SourceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// In-process topic.
///
/// Used by tests and by callers embedding the pipeline. Supports scripted
/// unavailability, low-watermark hints and redelivery on nack, and records
/// every settlement so delivery guarantees can be asserted.
#[derive(Default)]
pub struct MemorySource {
    topic: String,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    queue: VecDeque<Message>,
    in_flight: HashMap<AckHandle, Message>,
    low_watermark: Option<DateTime<Utc>>,
    closed: bool,
    failing_pulls: usize,
    pull_attempts: usize,
    acked: Vec<String>,
    nacked: Vec<String>,
    ack_requests: usize,
}

impl MemorySource {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn publish(&self, message: Message) {
        self.with_state(|s| s.queue.push_back(message));
    }

    pub fn publish_all(&self, messages: impl IntoIterator<Item = Message>) {
        self.with_state(|s| s.queue.extend(messages));
    }

    /// No more messages will be published; pulls report end of stream once drained.
    pub fn close(&self) {
        self.with_state(|s| s.closed = true);
    }

    pub fn set_low_watermark(&self, hint: Option<DateTime<Utc>>) {
        self.with_state(|s| s.low_watermark = hint);
    }

    /// Make the next `count` pulls fail as unavailable.
    pub fn fail_next_pulls(&self, count: usize) {
        self.with_state(|s| s.failing_pulls = count);
    }

    pub fn pull_attempts(&self) -> usize {
        self.with_state(|s| s.pull_attempts)
    }

    /// Message ids in the order they were acked (one entry per ack forwarded).
    pub fn acked(&self) -> Vec<String> {
        self.with_state(|s| s.acked.clone())
    }

    /// Handles received by `ack`, including ones that were no longer in flight.
    pub fn ack_requests(&self) -> usize {
        self.with_state(|s| s.ack_requests)
    }

    pub fn nacked(&self) -> Vec<String> {
        self.with_state(|s| s.nacked.clone())
    }

    pub fn in_flight(&self) -> usize {
        self.with_state(|s| s.in_flight.len())
    }

    pub fn pending(&self) -> usize {
        self.with_state(|s| s.queue.len())
    }
}

#[async_trait]
impl Source for MemorySource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn pull(&self, max_messages: usize) -> Result<PullResponse, SourceError> {
        self.with_state(|s| {
            s.pull_attempts += 1;
            if s.failing_pulls > 0 {
                s.failing_pulls -= 1;
                return Err(SourceError::Unavailable("scripted outage".to_string()));
            }

            let take = max_messages.min(s.queue.len());
            let messages: Vec<Message> = s.queue.drain(..take).collect();
            for message in &messages {
                s.in_flight.insert(message.ack.clone(), message.clone());
            }

            Ok(PullResponse {
                end_of_stream: messages.is_empty() && s.closed,
                messages,
                low_watermark: s.low_watermark,
            })
        })
    }

    async fn ack(&self, handles: &[AckHandle]) -> Result<(), SourceError> {
        self.with_state(|s| {
            s.ack_requests += handles.len();
            for handle in handles {
                if let Some(message) = s.in_flight.remove(handle) {
                    s.acked.push(message.id);
                }
            }
        });
        Ok(())
    }

    async fn nack(&self, handles: &[AckHandle]) -> Result<(), SourceError> {
        self.with_state(|s| {
            for handle in handles {
                if let Some(mut message) = s.in_flight.remove(handle) {
                    s.nacked.push(message.id.clone());
                    message.ack = AckHandle::generate();
                    s.queue.push_back(message);
                }
            }
        });
        Ok(())
    }
}
