use super::backpressure::BackpressureGate;
use super::channel::{create_channel, IntakeEvent, Receiver, Sender};
use crate::clock::Clock;
use crate::commit::{BatchCommitter, CommitError, CommitReport, CommitSettings};
use crate::config::types::{Config, ExhaustedPolicy};
use crate::sink::Sink;
use crate::source::{Acknowledger, IntakeAdapter, IntakeError, IntakeSettings, Pulled, Source};
use crate::transform::{
    DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink, RecordTransformer,
};
use crate::watermark::WatermarkTracker;
use crate::window::{ClosedWindow, LateMessage, WindowBuffer, WindowId};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("intake failed: {0}")]
    Intake(#[from] IntakeError),

    #[error("window {window} exhausted {attempts} commit attempts: {last_error}")]
    CommitExhausted {
        window: WindowId,
        attempts: u32,
        last_error: String,
    },

    #[error("commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("dead-letter sink failed: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("pipeline task failed: {0}")]
    Task(String),
}

/// Totals for one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub messages_received: u64,
    pub late: u64,
    pub malformed: u64,
    pub windows_committed: u64,
    pub windows_failed: u64,
    pub windows_quarantined: u64,
    pub windows_abandoned: u64,
    pub rows_written: u64,
    pub commit_retries: u64,
    pub watermark_regressions: u64,
}

/// The windowed ingestion pipeline: intake, windowing and commit tasks
/// joined by bounded channels.
pub struct Pipeline {
    config: Config,
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    dead_letter: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        dead_letter: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            dead_letter,
            clock,
        }
    }

    /// Run until the source ends, `shutdown` is cancelled, or a fatal error.
    ///
    /// On shutdown intake stops pulling first and nacks anything it pulled
    /// but never handed out. Every window already holding messages is then
    /// committed before returning, except after a halt on exhausted
    /// retries, where those windows are nacked instead.
    pub async fn run(self, shutdown: CancellationToken) -> Result<PipelineReport, PipelineError> {
        let config = self.config;
        let intake = IntakeAdapter::new(self.source, IntakeSettings::from(&config.source));
        let acknowledger = intake.acknowledger();
        let gate = BackpressureGate::new(config.commit.backpressure_threshold);

        let committer = Arc::new(
            BatchCommitter::new(
                self.sink,
                Arc::clone(&self.dead_letter),
                acknowledger.clone(),
                RecordTransformer::new(Arc::clone(&self.clock), config.transform.require_json),
                Arc::clone(&self.clock),
                CommitSettings::from_config(&config.commit, &config.sink),
            )
            .with_backpressure(gate.clone()),
        );

        let buffer = Arc::new(Mutex::new(WindowBuffer::new(
            config.window.duration,
            config.window.allowed_lateness,
        )));
        let tracker = WatermarkTracker::new(
            Arc::clone(&self.clock),
            config.watermark.safety_margin,
            config.watermark.degraded_mode,
        );

        // Cancelled by the caller or by a fatal error inside the pipeline
        let stop = shutdown.child_token();
        let (event_tx, event_rx) = create_channel(config.pipeline.channel_capacity);
        let (window_tx, window_rx) = create_channel(config.pipeline.channel_capacity);

        info!(
            window = ?config.window.duration,
            allowed_lateness = ?config.window.allowed_lateness,
            max_concurrent = config.commit.max_concurrent,
            "Pipeline starting"
        );

        let intake_handle = tokio::spawn(run_intake(intake, event_tx, gate.clone(), stop.clone()));

        let windowing = Windowing {
            buffer: Arc::clone(&buffer),
            tracker,
            dead_letter: self.dead_letter,
            acknowledger,
            clock: self.clock,
            gate,
            poll_interval: config.pipeline.poll_interval,
        };
        let windowing_handle = tokio::spawn(windowing.run(event_rx, window_tx, stop.clone()));

        let committing = Committing {
            committer,
            buffer,
            policy: config.commit.on_exhausted,
            max_concurrent: config.commit.max_concurrent.max(1),
        };
        let commit_handle = tokio::spawn(committing.run(window_rx, stop));

        let (intake, windowing, committing) =
            tokio::join!(intake_handle, windowing_handle, commit_handle);
        let intake = intake.map_err(|e| PipelineError::Task(e.to_string()))?;
        let windowing = windowing.map_err(|e| PipelineError::Task(e.to_string()))?;
        let committing = committing.map_err(|e| PipelineError::Task(e.to_string()))?;

        let mut report = committing.report;
        report.messages_received = windowing.received;
        report.late = windowing.late;
        report.watermark_regressions = windowing.regressions;

        info!(
            messages = report.messages_received,
            windows_committed = report.windows_committed,
            windows_failed = report.windows_failed,
            rows = report.rows_written,
            late = report.late,
            malformed = report.malformed,
            "Pipeline stopped"
        );

        // Exhaustion under halt is the most specific cause, then intake
        if let Some(e) = committing.error {
            return Err(e);
        }
        intake?;
        if let Some(e) = windowing.error {
            return Err(e);
        }
        Ok(report)
    }
}

fn lock(buffer: &Mutex<WindowBuffer>) -> MutexGuard<'_, WindowBuffer> {
    match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pull messages and forward them with any new watermark hints.
async fn run_intake(
    mut intake: IntakeAdapter,
    tx: Sender<IntakeEvent>,
    gate: BackpressureGate,
    stop: CancellationToken,
) -> Result<(), PipelineError> {
    let mut result = Ok(());

    info!("Intake started");
    loop {
        if gate.is_engaged() {
            debug!("Intake waiting on backpressure");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = gate.released() => {}
            }
        }

        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = intake.next_event() => next,
        };

        match next {
            Ok(Some(Pulled::Hint(hint))) => {
                if tx.send(IntakeEvent::Hint(hint)).await.is_err() {
                    break;
                }
            }
            Ok(Some(Pulled::Message(message))) => {
                if let Err(unsent) = tx.send(IntakeEvent::Message(message)).await {
                    if let IntakeEvent::Message(message) = unsent.0 {
                        let _ = intake
                            .acknowledger()
                            .negative_acknowledge(&message.ack)
                            .await;
                    }
                    warn!("Windowing stage gone, intake stopping");
                    break;
                }
            }
            Ok(None) => {
                let _ = tx.send(IntakeEvent::EndOfStream).await;
                break;
            }
            Err(e) => {
                error!(stage = "intake", error = %e, "Fatal intake error");
                stop.cancel();
                result = Err(e.into());
                break;
            }
        }
    }

    if let Err(e) = intake.release_buffered().await {
        warn!(error = %e, "Failed to release buffered messages");
    }
    info!("Intake stopped");
    result
}

struct WindowingOutcome {
    received: u64,
    late: u64,
    regressions: u64,
    error: Option<PipelineError>,
}

struct Windowing {
    buffer: Arc<Mutex<WindowBuffer>>,
    tracker: WatermarkTracker,
    dead_letter: Arc<dyn DeadLetterSink>,
    acknowledger: Acknowledger,
    clock: Arc<dyn Clock>,
    gate: BackpressureGate,
    poll_interval: Duration,
}

impl Windowing {
    async fn run(
        mut self,
        mut rx: Receiver<IntakeEvent>,
        tx: Sender<ClosedWindow>,
        stop: CancellationToken,
    ) -> WindowingOutcome {
        let mut outcome = WindowingOutcome {
            received: 0,
            late: 0,
            regressions: 0,
            error: None,
        };

        if let Err(e) = self.assign_until_closed(&mut rx, &tx, &mut outcome).await {
            error!(stage = "windowing", error = %e, "Fatal windowing error");
            stop.cancel();
            outcome.error = Some(e);
            // Keep intake from blocking on a full channel
            rx.close();
            while let Some(event) = rx.recv().await {
                if let IntakeEvent::Message(m) = event {
                    let _ = self.acknowledger.negative_acknowledge(&m.ack).await;
                }
            }
        }

        // Shutdown or end of stream: everything still open gets a final commit
        let drained = lock(&self.buffer).drain();
        for window in drained {
            if tx.send(window).await.is_err() {
                warn!("Commit stage gone while draining");
                break;
            }
        }

        outcome.regressions = self.tracker.regressions();
        info!(received = outcome.received, late = outcome.late, "Windowing stopped");
        outcome
    }

    async fn assign_until_closed(
        &mut self,
        rx: &mut Receiver<IntakeEvent>,
        tx: &Sender<ClosedWindow>,
        outcome: &mut WindowingOutcome,
    ) -> Result<(), PipelineError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut gate_changes = self.gate.subscribe();

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(IntakeEvent::Message(message)) => {
                        outcome.received += 1;
                        self.tracker.observe(message.event_time());
                        let watermark = self.tracker.current_watermark();
                        let assigned = lock(&self.buffer).assign(message, watermark);
                        if let Err(late) = assigned {
                            outcome.late += 1;
                            self.divert_late(late).await?;
                        }
                    }
                    Some(IntakeEvent::Hint(hint)) => self.tracker.observe_hint(hint),
                    Some(IntakeEvent::EndOfStream) => {
                        info!("End of stream, closing remaining windows");
                        self.tracker.advance_to_end();
                    }
                    None => return Ok(()),
                },
                _ = ticker.tick() => {}
                changed = gate_changes.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }

            self.forward_closed(tx).await;
        }
    }

    async fn forward_closed(&mut self, tx: &Sender<ClosedWindow>) {
        let watermark = self.tracker.current_watermark();
        let closed = {
            let mut buffer = lock(&self.buffer);
            if self.gate.is_engaged() {
                buffer.pause();
            } else {
                buffer.resume();
            }
            buffer.poll_closed_windows(watermark)
        };

        for window in closed {
            debug!(
                window_start = %window.id,
                messages = window.len(),
                watermark = ?watermark,
                "Forwarding closed window"
            );
            if tx.send(window).await.is_err() {
                warn!("Commit stage gone");
                return;
            }
        }
    }

    async fn divert_late(&self, late: LateMessage) -> Result<(), PipelineError> {
        let detail = format!(
            "window {} {} (watermark {:?})",
            late.window_id, late.reason, late.watermark
        );
        let letter = DeadLetter::new(
            &late.message,
            DeadLetterReason::Late,
            detail,
            self.clock.now(),
        );
        if let Err(e) = self.dead_letter.divert(&[letter]).await {
            // Redeliver rather than drop it
            self.acknowledger
                .negative_acknowledge(&late.message.ack)
                .await?;
            return Err(e.into());
        }
        self.acknowledger.acknowledge(&late.message.ack).await?;
        Ok(())
    }
}

struct CommittingOutcome {
    report: PipelineReport,
    error: Option<PipelineError>,
}

struct Committing {
    committer: Arc<BatchCommitter>,
    buffer: Arc<Mutex<WindowBuffer>>,
    policy: ExhaustedPolicy,
    max_concurrent: usize,
}

async fn commit_window(
    committer: Arc<BatchCommitter>,
    window: ClosedWindow,
) -> (WindowId, Result<CommitReport, CommitError>) {
    let id = window.id;
    let result = async {
        let mut batch = committer.prepare(window).await?;
        committer.commit(&mut batch).await
    }
    .await;
    (id, result)
}

impl Committing {
    async fn run(self, mut rx: Receiver<ClosedWindow>, stop: CancellationToken) -> CommittingOutcome {
        let mut outcome = CommittingOutcome {
            report: PipelineReport::default(),
            error: None,
        };
        let mut in_flight = FuturesUnordered::new();
        let mut accepting = true;

        info!(max_concurrent = self.max_concurrent, "Committer started");
        loop {
            tokio::select! {
                window = rx.recv(), if accepting && in_flight.len() < self.max_concurrent => {
                    match window {
                        Some(window) if outcome.error.is_some() => self.abandon(window, &mut outcome).await,
                        Some(window) => in_flight.push(commit_window(Arc::clone(&self.committer), window)),
                        None => accepting = false,
                    }
                }
                Some((id, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    self.settle(id, result, &mut outcome, &stop);
                }
                else => break,
            }
        }

        info!(
            committed = outcome.report.windows_committed,
            failed = outcome.report.windows_failed,
            "Committer stopped"
        );
        outcome
    }

    fn settle(
        &self,
        id: WindowId,
        result: Result<CommitReport, CommitError>,
        outcome: &mut CommittingOutcome,
        stop: &CancellationToken,
    ) {
        let report = &mut outcome.report;
        let mut buffer = lock(&self.buffer);

        match result {
            Ok(commit) => {
                report.windows_committed += 1;
                report.rows_written += commit.rows_written as u64;
                report.malformed += commit.dead_lettered as u64;
                report.commit_retries += commit.retries as u64;
                if let Err(e) = buffer.mark_committed(id) {
                    warn!(window_start = %id, error = %e, "Committed window missing from buffer");
                }
            }
            Err(CommitError::Exhausted {
                quarantined,
                attempts,
                last_error,
                ..
            }) => {
                report.windows_failed += 1;
                let _ = buffer.mark_failed(id);

                if self.policy == ExhaustedPolicy::Quarantine && quarantined > 0 {
                    report.windows_quarantined += 1;
                    let _ = buffer.discard(id);
                    return;
                }

                error!(
                    stage = "commit",
                    window_start = %id,
                    attempts,
                    error = %last_error,
                    "Halting pipeline after exhausted retries"
                );
                stop.cancel();
                if outcome.error.is_none() {
                    outcome.error = Some(PipelineError::CommitExhausted {
                        window: id,
                        attempts,
                        last_error,
                    });
                }
            }
            Err(e) => {
                report.windows_failed += 1;
                let _ = buffer.mark_failed(id);
                error!(stage = "commit", window_start = %id, error = %e, "Fatal commit error");
                stop.cancel();
                if outcome.error.is_none() {
                    outcome.error = Some(e.into());
                }
            }
        }
    }

    async fn abandon(&self, window: ClosedWindow, outcome: &mut CommittingOutcome) {
        let id = window.id;
        if let Err(e) = self.committer.abandon(&window).await {
            error!(window_start = %id, error = %e, "Failed to release window");
        }
        let _ = lock(&self.buffer).mark_failed(id);
        outcome.report.windows_abandoned += 1;
    }
}
