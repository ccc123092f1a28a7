use super::message::{AckHandle, Message};
use super::traits::{PullResponse, Source, SourceError};
use crate::commit::backoff::Backoff;
use crate::config::types::SourceConfig;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("source unavailable after {attempts} attempts: {last_error}")]
    SourceUnavailable { attempts: u32, last_error: String },

    #[error("source error: {0}")]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub pull_batch_size: usize,
    pub poll_interval: Duration,
    /// Retries after the first failed pull before giving up
    pub max_unavailable_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
}

impl From<&SourceConfig> for IntakeSettings {
    fn from(config: &SourceConfig) -> Self {
        Self {
            pull_batch_size: config.pull_batch_size,
            poll_interval: config.poll_interval,
            max_unavailable_retries: config.max_unavailable_retries,
            retry_backoff_base: config.retry_backoff_base,
            retry_backoff_cap: config.retry_backoff_cap,
        }
    }
}

/// Outcome of settling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Forwarded,
    /// The handle was already acked or nacked; nothing was sent
    AlreadySettled,
}

/// One item handed out by [`IntakeAdapter::next_event`].
#[derive(Debug, Clone)]
pub enum Pulled {
    Message(Message),
    /// The source reported a new low watermark. It precedes the messages
    /// of the pull that carried it.
    Hint(DateTime<Utc>),
}

/// Pulls messages from the source and hands them out one at a time.
///
/// Owns the pull loop; settlement goes through the [`Acknowledger`] so the
/// commit side can ack while intake keeps pulling.
pub struct IntakeAdapter {
    source: Arc<dyn Source>,
    settings: IntakeSettings,
    buffered: VecDeque<Message>,
    low_watermark: Option<DateTime<Utc>>,
    unreported_hint: Option<DateTime<Utc>>,
    end_of_stream: bool,
    acknowledger: Acknowledger,
}

impl IntakeAdapter {
    pub fn new(source: Arc<dyn Source>, settings: IntakeSettings) -> Self {
        let acknowledger = Acknowledger::new(Arc::clone(&source));
        Self {
            source,
            settings,
            buffered: VecDeque::new(),
            low_watermark: None,
            unreported_hint: None,
            end_of_stream: false,
            acknowledger,
        }
    }

    pub fn acknowledger(&self) -> Acknowledger {
        self.acknowledger.clone()
    }

    /// Latest low-watermark hint reported by the source.
    pub fn low_watermark_hint(&self) -> Option<DateTime<Utc>> {
        self.low_watermark
    }

    /// Next message, waiting for the source as long as needed.
    ///
    /// Returns `Ok(None)` once a finite source is exhausted. Hints are
    /// still recorded and available from [`Self::low_watermark_hint`].
    pub async fn next_message(&mut self) -> Result<Option<Message>, IntakeError> {
        loop {
            match self.next_event().await? {
                Some(Pulled::Message(message)) => return Ok(Some(message)),
                Some(Pulled::Hint(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Next message or low-watermark change.
    ///
    /// A hint that moves while the source is idle is handed out on its own,
    /// so the watermark keeps advancing without new messages.
    pub async fn next_event(&mut self) -> Result<Option<Pulled>, IntakeError> {
        loop {
            if let Some(hint) = self.unreported_hint.take() {
                return Ok(Some(Pulled::Hint(hint)));
            }
            if let Some(message) = self.buffered.pop_front() {
                return Ok(Some(Pulled::Message(message)));
            }
            if self.end_of_stream {
                return Ok(None);
            }

            let response = self.pull_with_retry().await?;
            if let Some(hint) = response.low_watermark {
                if self.low_watermark != Some(hint) {
                    debug!(hint = %hint, "Source low watermark moved");
                    self.low_watermark = Some(hint);
                    self.unreported_hint = Some(hint);
                }
            }

            if response.messages.is_empty() {
                if response.end_of_stream {
                    info!(topic = %self.source.topic(), "Source reported end of stream");
                    self.end_of_stream = true;
                } else if self.unreported_hint.is_none() {
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
                continue;
            }

            debug!(count = response.messages.len(), "Pulled messages");
            self.acknowledger
                .track(response.messages.iter().map(|m| m.ack.clone()));
            self.buffered.extend(response.messages);
        }
    }

    /// Nack everything pulled but not yet handed out.
    ///
    /// Called on shutdown so no delivery is left unsettled.
    pub async fn release_buffered(&mut self) -> Result<usize, IntakeError> {
        let handles: Vec<AckHandle> = self.buffered.drain(..).map(|m| m.ack).collect();
        if handles.is_empty() {
            return Ok(0);
        }
        let summary = self.acknowledger.negative_acknowledge_all(&handles).await?;
        info!(count = summary.forwarded, "Released buffered messages for redelivery");
        Ok(summary.forwarded)
    }

    async fn pull_with_retry(&self) -> Result<PullResponse, IntakeError> {
        let mut attempts = 0u32;
        let mut backoff = Backoff::new(
            self.settings.retry_backoff_base,
            self.settings.retry_backoff_cap,
        );

        loop {
            match self.source.pull(self.settings.pull_batch_size).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts > self.settings.max_unavailable_retries {
                        error!(
                            topic = %self.source.topic(),
                            attempts = attempts,
                            error = %e,
                            "Source unavailable, giving up"
                        );
                        return Err(IntakeError::SourceUnavailable {
                            attempts,
                            last_error: e.to_string(),
                        });
                    }

                    let delay = backoff.next_delay();
                    warn!(
                        topic = %self.source.topic(),
                        attempt = attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Pull failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Summary of a batch settlement.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SettlementSummary {
    pub forwarded: usize,
    pub already_settled: usize,
}

/// Cloneable handle for acking and nacking deliveries.
///
/// Tracks outstanding handles so each delivery is settled with the source
/// at most once, no matter how many times a commit is replayed.
#[derive(Clone)]
pub struct Acknowledger {
    source: Arc<dyn Source>,
    outstanding: Arc<Mutex<HashSet<AckHandle>>>,
}

impl Acknowledger {
    fn new(source: Arc<dyn Source>) -> Self {
        Self {
            source,
            outstanding: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn track(&self, handles: impl IntoIterator<Item = AckHandle>) {
        if let Ok(mut outstanding) = self.outstanding.lock() {
            outstanding.extend(handles);
        }
    }

    /// Removes the handles that are still outstanding and returns them.
    fn claim(&self, handles: &[AckHandle]) -> Vec<AckHandle> {
        let Ok(mut outstanding) = self.outstanding.lock() else {
            return Vec::new();
        };
        handles
            .iter()
            .filter(|h| outstanding.remove(*h))
            .cloned()
            .collect()
    }

    /// Deliveries handed out and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub async fn acknowledge(&self, handle: &AckHandle) -> Result<Settlement, IntakeError> {
        let summary = self.acknowledge_all(std::slice::from_ref(handle)).await?;
        Ok(settlement_of(summary))
    }

    pub async fn negative_acknowledge(&self, handle: &AckHandle) -> Result<Settlement, IntakeError> {
        let summary = self
            .negative_acknowledge_all(std::slice::from_ref(handle))
            .await?;
        Ok(settlement_of(summary))
    }

    pub async fn acknowledge_all(
        &self,
        handles: &[AckHandle],
    ) -> Result<SettlementSummary, IntakeError> {
        let claimed = self.claim(handles);
        let summary = SettlementSummary {
            forwarded: claimed.len(),
            already_settled: handles.len() - claimed.len(),
        };
        if summary.already_settled > 0 {
            debug!(count = summary.already_settled, "Skipped already settled handles");
        }
        if !claimed.is_empty() {
            self.source.ack(&claimed).await?;
        }
        Ok(summary)
    }

    pub async fn negative_acknowledge_all(
        &self,
        handles: &[AckHandle],
    ) -> Result<SettlementSummary, IntakeError> {
        let claimed = self.claim(handles);
        let summary = SettlementSummary {
            forwarded: claimed.len(),
            already_settled: handles.len() - claimed.len(),
        };
        if !claimed.is_empty() {
            self.source.nack(&claimed).await?;
        }
        Ok(summary)
    }
}

fn settlement_of(summary: SettlementSummary) -> Settlement {
    if summary.forwarded > 0 {
        Settlement::Forwarded
    } else {
        Settlement::AlreadySettled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;
    use chrono::TimeZone;

    fn settings() -> IntakeSettings {
        IntakeSettings {
            pull_batch_size: 2,
            poll_interval: Duration::from_millis(1),
            max_unavailable_retries: 3,
            retry_backoff_base: Duration::from_millis(1),
            retry_backoff_cap: Duration::from_millis(4),
        }
    }

    fn message(id: &str, secs: i64) -> Message {
        Message::new(id, id.as_bytes().to_vec(), Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[tokio::test]
    async fn test_delivers_in_order_then_ends() {
        let source = Arc::new(MemorySource::new("topic"));
        source.publish_all([message("a", 1), message("b", 2), message("c", 3)]);
        source.close();

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        let mut ids = Vec::new();
        while let Some(m) = intake.next_message().await.unwrap() {
            ids.push(m.id);
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(intake.acknowledger().outstanding(), 3);
    }

    #[tokio::test]
    async fn test_ack_is_forwarded_once() {
        let source = Arc::new(MemorySource::new("topic"));
        source.publish(message("a", 1));
        source.close();

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        let m = intake.next_message().await.unwrap().unwrap();
        let acker = intake.acknowledger();

        assert_eq!(acker.acknowledge(&m.ack).await.unwrap(), Settlement::Forwarded);
        assert_eq!(
            acker.acknowledge(&m.ack).await.unwrap(),
            Settlement::AlreadySettled
        );
        // A nack after the ack must not trigger redelivery either
        assert_eq!(
            acker.negative_acknowledge(&m.ack).await.unwrap(),
            Settlement::AlreadySettled
        );

        assert_eq!(source.ack_requests(), 1);
        assert!(source.nacked().is_empty());
        assert_eq!(acker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_source_recovers() {
        let source = Arc::new(MemorySource::new("topic"));
        source.publish(message("a", 1));
        source.fail_next_pulls(2);

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        let m = intake.next_message().await.unwrap().unwrap();
        assert_eq!(m.id, "a");
        assert_eq!(source.pull_attempts(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_source_becomes_fatal() {
        let source = Arc::new(MemorySource::new("topic"));
        source.fail_next_pulls(10);

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        let err = intake.next_message().await.unwrap_err();
        match err {
            IntakeError::SourceUnavailable { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
        // First attempt plus three retries
        assert_eq!(source.pull_attempts(), 4);
    }

    #[tokio::test]
    async fn test_low_watermark_hint_is_exposed() {
        let source = Arc::new(MemorySource::new("topic"));
        let hint = Utc.timestamp_opt(100, 0).unwrap();
        source.set_low_watermark(Some(hint));
        source.publish(message("a", 90));

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        intake.next_message().await.unwrap();
        assert_eq!(intake.low_watermark_hint(), Some(hint));
    }

    #[tokio::test]
    async fn test_hint_precedes_messages_of_its_pull() {
        let source = Arc::new(MemorySource::new("topic"));
        let hint = Utc.timestamp_opt(100, 0).unwrap();
        source.set_low_watermark(Some(hint));
        source.publish(message("a", 90));

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        assert!(matches!(intake.next_event().await.unwrap(), Some(Pulled::Hint(h)) if h == hint));
        assert!(matches!(intake.next_event().await.unwrap(), Some(Pulled::Message(m)) if m.id == "a"));
    }

    #[tokio::test]
    async fn test_hint_moves_while_source_idle() {
        let source = Arc::new(MemorySource::new("topic"));
        source.publish(message("a", 90));

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        assert!(matches!(intake.next_event().await.unwrap(), Some(Pulled::Message(_))));

        // Nothing left to pull; only the watermark moves
        let later = Utc.timestamp_opt(200, 0).unwrap();
        source.set_low_watermark(Some(later));
        let next = tokio::time::timeout(Duration::from_secs(2), intake.next_event())
            .await
            .expect("idle hint was not reported")
            .unwrap();
        assert!(matches!(next, Some(Pulled::Hint(h)) if h == later));

        // An unchanged hint is not reported again
        source.publish(message("b", 210));
        assert!(matches!(intake.next_event().await.unwrap(), Some(Pulled::Message(m)) if m.id == "b"));
    }

    #[tokio::test]
    async fn test_release_buffered_nacks_unhanded_messages() {
        let source = Arc::new(MemorySource::new("topic"));
        source.publish_all([message("a", 1), message("b", 2)]);

        let mut intake = IntakeAdapter::new(source.clone(), settings());
        let first = intake.next_message().await.unwrap().unwrap();
        assert_eq!(first.id, "a");

        assert_eq!(intake.release_buffered().await.unwrap(), 1);
        assert_eq!(source.nacked(), vec!["b"]);
    }
}
