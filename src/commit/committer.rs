use super::backoff::Backoff;
use crate::clock::Clock;
use crate::config::types::{CommitConfig, ExhaustedPolicy, SinkConfig};
use crate::pipeline::backpressure::{BackpressureGate, RetryGuard};
use crate::sink::{CreateDisposition, Sink, SinkError, TableRef, TableSchema};
use crate::source::{Acknowledger, AckHandle, IntakeError, Message};
use crate::transform::{
    DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink, Record, RecordTransformer,
};
use crate::window::{ClosedWindow, WindowId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("window {window} not committed after {attempts} attempts: {last_error}")]
    Exhausted {
        window: WindowId,
        attempts: u32,
        last_error: String,
        /// Messages moved to the dead-letter sink instead of being redelivered
        quarantined: usize,
    },

    #[error("window {window} hit a fatal sink error: {source}")]
    Fatal {
        window: WindowId,
        #[source]
        source: SinkError,
    },

    #[error("dead-letter sink failed: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("settling messages failed: {0}")]
    Settle(#[from] IntakeError),
}

/// Records of one closed window, ready for the sink.
#[derive(Debug)]
pub struct Batch {
    pub window: WindowId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    records: Vec<Record>,
    /// Every message of the window, dead-lettered ones included
    messages: Vec<Message>,
    dead_lettered: usize,
    rows_written: usize,
    attempts: u32,
    committed: bool,
}

impl Batch {
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn handles(&self) -> Vec<AckHandle> {
        self.messages.iter().map(|m| m.ack.clone()).collect()
    }

    pub fn dead_lettered(&self) -> usize {
        self.dead_lettered
    }

    /// Write attempts across every `commit` call.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub rows_written: usize,
    pub sub_batches: usize,
    pub attempts: u32,
    pub retries: u32,
    pub backoff_delays: Vec<Duration>,
    pub dead_lettered: usize,
    /// Settlements forwarded to the source
    pub acked: usize,
}

#[derive(Debug, Clone)]
pub struct CommitSettings {
    pub table: TableRef,
    pub create_disposition: CreateDisposition,
    pub max_rows_per_call: usize,
    pub max_retries: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    pub on_exhausted: ExhaustedPolicy,
}

impl CommitSettings {
    pub fn from_config(commit: &CommitConfig, sink: &SinkConfig) -> Self {
        Self {
            table: TableRef::new(sink.table.clone()),
            create_disposition: sink.create_disposition,
            max_rows_per_call: sink.max_rows_per_call,
            max_retries: commit.max_retries,
            retry_backoff_base: commit.retry_backoff_base,
            retry_backoff_cap: commit.retry_backoff_cap,
            on_exhausted: commit.on_exhausted,
        }
    }
}

/// Turns closed windows into sink writes and settles their messages.
///
/// Messages are acked only after every row of their batch is written. On
/// any failure they are nacked for redelivery, or quarantined when
/// configured to.
pub struct BatchCommitter {
    sink: Arc<dyn Sink>,
    dead_letter: Arc<dyn DeadLetterSink>,
    acknowledger: Acknowledger,
    transformer: RecordTransformer,
    clock: Arc<dyn Clock>,
    settings: CommitSettings,
    schema: TableSchema,
    table_ready: OnceCell<()>,
    backpressure: Option<BackpressureGate>,
}

impl BatchCommitter {
    pub fn new(
        sink: Arc<dyn Sink>,
        dead_letter: Arc<dyn DeadLetterSink>,
        acknowledger: Acknowledger,
        transformer: RecordTransformer,
        clock: Arc<dyn Clock>,
        settings: CommitSettings,
    ) -> Self {
        Self {
            sink,
            dead_letter,
            acknowledger,
            transformer,
            clock,
            settings,
            schema: TableSchema::cdc(),
            table_ready: OnceCell::new(),
            backpressure: None,
        }
    }

    /// Count retrying commits against `gate`.
    pub fn with_backpressure(mut self, gate: BackpressureGate) -> Self {
        self.backpressure = Some(gate);
        self
    }

    /// Transform a closed window, diverting malformed messages.
    pub async fn prepare(&self, window: ClosedWindow) -> Result<Batch, CommitError> {
        let mut records = Vec::with_capacity(window.messages.len());
        let mut letters = Vec::new();

        for message in &window.messages {
            match self.transformer.transform(message) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(message_id = %message.id, error = %e, "Malformed message");
                    letters.push(DeadLetter::new(
                        message,
                        DeadLetterReason::Malformed,
                        e.to_string(),
                        self.clock.now(),
                    ));
                }
            }
        }

        if !letters.is_empty() {
            if let Err(e) = self.dead_letter.divert(&letters).await {
                error!(window_start = %window.id, error = %e, "Dead-letter sink failed");
                if let Err(nack) = self.abandon(&window).await {
                    error!(window_start = %window.id, error = %nack, "Failed to nack window");
                }
                return Err(e.into());
            }
        }

        Ok(Batch {
            window: window.id,
            start: window.start,
            end: window.end,
            records,
            messages: window.messages,
            dead_lettered: letters.len(),
            rows_written: 0,
            attempts: 0,
            committed: false,
        })
    }

    /// Write the batch and settle its messages.
    ///
    /// Calling this again on a committed batch writes nothing and forwards
    /// no further acks.
    pub async fn commit(&self, batch: &mut Batch) -> Result<CommitReport, CommitError> {
        let mut report = CommitReport {
            dead_lettered: batch.dead_lettered,
            ..Default::default()
        };

        if batch.committed {
            debug!(window_start = %batch.window, "Batch already committed");
            report.acked = self.acknowledger.acknowledge_all(&batch.handles()).await?.forwarded;
            return Ok(report);
        }

        if !batch.is_empty() {
            self.write_with_retry(batch, &mut report).await?;
        }

        batch.committed = true;
        report.acked = self.acknowledger.acknowledge_all(&batch.handles()).await?.forwarded;
        info!(
            window_start = %batch.window,
            rows = report.rows_written,
            sub_batches = report.sub_batches,
            attempts = report.attempts,
            dead_lettered = report.dead_lettered,
            "Committed window"
        );
        Ok(report)
    }

    async fn write_with_retry(
        &self,
        batch: &mut Batch,
        report: &mut CommitReport,
    ) -> Result<(), CommitError> {
        let mut backoff = Backoff::new(
            self.settings.retry_backoff_base,
            self.settings.retry_backoff_cap,
        );
        let mut retrying: Option<RetryGuard> = None;
        let mut recreate_table = false;
        let mut table_recoveries = 0u32;

        loop {
            batch.attempts += 1;
            report.attempts += 1;

            let err = match self.write_remaining(batch, report, recreate_table).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            recreate_table = false;

            match err {
                SinkError::TableNotFound(ref table)
                    if self.settings.create_disposition == CreateDisposition::CreateIfNeeded
                        && table_recoveries <= self.settings.max_retries =>
                {
                    table_recoveries += 1;
                    warn!(
                        window_start = %batch.window,
                        table = %table,
                        "Table missing, recreating before retry"
                    );
                    recreate_table = true;
                }
                e if e.is_transient() => {
                    if report.retries >= self.settings.max_retries {
                        drop(retrying);
                        return Err(self.exhausted(batch, report.attempts, e).await);
                    }
                    if retrying.is_none() {
                        retrying = self.backpressure.as_ref().map(|g| g.enter_retry());
                    }

                    let delay = backoff.next_delay();
                    report.retries += 1;
                    report.backoff_delays.push(delay);
                    warn!(
                        window_start = %batch.window,
                        attempt = report.attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sink write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                e => {
                    error!(
                        window_start = %batch.window,
                        attempt = report.attempts,
                        error = %e,
                        "Fatal sink error"
                    );
                    self.release(batch).await;
                    return Err(CommitError::Fatal {
                        window: batch.window,
                        source: e,
                    });
                }
            }
        }
    }

    /// Write every sub-batch not yet written.
    async fn write_remaining(
        &self,
        batch: &mut Batch,
        report: &mut CommitReport,
        recreate_table: bool,
    ) -> Result<(), SinkError> {
        if recreate_table {
            self.sink
                .ensure_table(&self.settings.table, &self.schema, self.settings.create_disposition)
                .await?;
        } else {
            self.table_ready
                .get_or_try_init(|| async {
                    self.sink
                        .ensure_table(
                            &self.settings.table,
                            &self.schema,
                            self.settings.create_disposition,
                        )
                        .await
                })
                .await?;
        }

        let chunk = self
            .sink
            .max_rows_per_call()
            .min(self.settings.max_rows_per_call)
            .max(1);

        while batch.rows_written < batch.records.len() {
            let end = (batch.rows_written + chunk).min(batch.records.len());
            let rows: Vec<_> = batch.records[batch.rows_written..end]
                .iter()
                .map(Record::to_row)
                .collect();

            let written = self.sink.insert_batch(&self.settings.table, &rows).await?;
            batch.rows_written += written;
            report.rows_written += written;
            report.sub_batches += 1;
            debug!(
                window_start = %batch.window,
                rows = written,
                progress = batch.rows_written,
                total = batch.records.len(),
                "Sub-batch written"
            );
        }
        Ok(())
    }

    async fn exhausted(&self, batch: &Batch, attempts: u32, last_error: SinkError) -> CommitError {
        error!(
            window_start = %batch.window,
            attempts,
            error = %last_error,
            policy = ?self.settings.on_exhausted,
            "Commit retries exhausted"
        );

        let quarantined = match self.settings.on_exhausted {
            ExhaustedPolicy::Halt => {
                self.release(batch).await;
                0
            }
            ExhaustedPolicy::Quarantine => match self.quarantine(batch, &last_error).await {
                Ok(count) => count,
                Err(e) => {
                    error!(window_start = %batch.window, error = %e, "Quarantine failed");
                    self.release(batch).await;
                    0
                }
            },
        };

        CommitError::Exhausted {
            window: batch.window,
            attempts,
            last_error: last_error.to_string(),
            quarantined,
        }
    }

    /// Move the whole window to the dead-letter sink and ack it there.
    async fn quarantine(&self, batch: &Batch, cause: &SinkError) -> Result<usize, CommitError> {
        let now = self.clock.now();
        let letters: Vec<_> = batch
            .messages
            .iter()
            .map(|m| DeadLetter::new(m, DeadLetterReason::Quarantined, cause.to_string(), now))
            .collect();

        self.dead_letter.divert(&letters).await?;
        self.acknowledger.acknowledge_all(&batch.handles()).await?;
        warn!(
            window_start = %batch.window,
            messages = letters.len(),
            "Quarantined window"
        );
        Ok(letters.len())
    }

    /// Give a window back to the source without attempting a write.
    pub async fn abandon(&self, window: &ClosedWindow) -> Result<usize, CommitError> {
        let handles: Vec<_> = window.messages.iter().map(|m| m.ack.clone()).collect();
        let summary = self.acknowledger.negative_acknowledge_all(&handles).await?;
        warn!(
            window_start = %window.id,
            nacked = summary.forwarded,
            "Released window without writing"
        );
        Ok(summary.forwarded)
    }

    /// Nack every message so the source redelivers it.
    async fn release(&self, batch: &Batch) {
        match self
            .acknowledger
            .negative_acknowledge_all(&batch.handles())
            .await
        {
            Ok(summary) => debug!(
                window_start = %batch.window,
                nacked = summary.forwarded,
                "Released window for redelivery"
            ),
            Err(e) => error!(window_start = %batch.window, error = %e, "Failed to nack window"),
        }
    }
}
