#![allow(dead_code)]

use async_trait::async_trait;
use cdcsink::clock::{Clock, ManualClock};
use cdcsink::config::types::Config;
use cdcsink::sink::{CreateDisposition, Sink, SinkError, SinkRow, TableRef, TableSchema};
use cdcsink::source::{MemorySource, Message};
use cdcsink::transform::{DeadLetter, DeadLetterError, DeadLetterSink};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 2026-01-28T10:00:00Z, aligned to a 2s window boundary.
pub const BASE_MS: i64 = 1_769_594_400_000;

pub fn at(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(BASE_MS + offset_ms).unwrap()
}

pub fn msg(id: &str, offset_ms: i64, payload: &[u8]) -> Message {
    Message::new(id, payload.to_vec(), at(offset_ms))
}

pub fn json_msg(id: &str, offset_ms: i64) -> Message {
    let payload = format!(r#"{{"id":"{}","op":"c"}}"#, id);
    msg(id, offset_ms, payload.as_bytes())
}

/// Processing time pinned to a different day than the event times.
pub fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ))
}

/// Defaults with short intervals so tests finish quickly.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.source.poll_interval = Duration::from_millis(5);
    config.source.retry_backoff_base = Duration::from_millis(1);
    config.source.retry_backoff_cap = Duration::from_millis(4);
    config.commit.retry_backoff_base = Duration::from_millis(1);
    config.commit.retry_backoff_cap = Duration::from_millis(4);
    config.pipeline.poll_interval = Duration::from_millis(10);
    config
}

pub fn memory_source(messages: Vec<Message>, closed: bool) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new("dbserver1.inventory.customers"));
    source.publish_all(messages);
    if closed {
        source.close();
    }
    source
}

#[derive(Default)]
struct ScriptState {
    transient_failures: usize,
    poison: Option<String>,
    calls: usize,
    batches: Vec<Vec<SinkRow>>,
    acked_during_calls: Vec<usize>,
    tables_ensured: usize,
}

/// In-memory sink with scripted failures.
pub struct ScriptedSink {
    state: Mutex<ScriptState>,
    ack_watch: Option<Arc<MemorySource>>,
}

impl ScriptedSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            ack_watch: None,
        }
    }

    /// The first `count` insert calls fail with a transient error.
    pub fn failing(count: usize) -> Self {
        let sink = Self::new();
        sink.state.lock().unwrap().transient_failures = count;
        sink
    }

    /// Calls containing a row with `marker` in its payload always fail transiently.
    pub fn poisoned(marker: &str) -> Self {
        let sink = Self::new();
        sink.state.lock().unwrap().poison = Some(marker.to_string());
        sink
    }

    /// Record how many messages `source` had acked at each insert call.
    pub fn with_ack_watch(mut self, source: Arc<MemorySource>) -> Self {
        self.ack_watch = Some(source);
        self
    }

    pub fn batches(&self) -> Vec<Vec<SinkRow>> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn rows(&self) -> Vec<SinkRow> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn acked_during_calls(&self) -> Vec<usize> {
        self.state.lock().unwrap().acked_during_calls.clone()
    }

    pub fn tables_ensured(&self) -> usize {
        self.state.lock().unwrap().tables_ensured
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    async fn ensure_table(
        &self,
        _table: &TableRef,
        _schema: &TableSchema,
        _disposition: CreateDisposition,
    ) -> Result<(), SinkError> {
        self.state.lock().unwrap().tables_ensured += 1;
        Ok(())
    }

    async fn insert_batch(&self, _table: &TableRef, rows: &[SinkRow]) -> Result<usize, SinkError> {
        let acked = self.ack_watch.as_ref().map(|s| s.acked().len()).unwrap_or(0);
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.acked_during_calls.push(acked);

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(SinkError::Transient("scripted timeout".to_string()));
        }
        if let Some(marker) = &state.poison {
            if rows.iter().any(|r| r.json_dat.contains(marker.as_str())) {
                return Err(SinkError::Transient("scripted outage".to_string()));
            }
        }

        state.batches.push(rows.to_vec());
        Ok(rows.len())
    }

    fn max_rows_per_call(&self) -> usize {
        1_000
    }
}

/// Sink whose writes take `delay`, recording how many overlap.
pub struct SlowSink {
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    rows: AtomicUsize,
}

impl SlowSink {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            rows: AtomicUsize::new(0),
        }
    }

    /// Most `insert_batch` calls seen running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for SlowSink {
    async fn ensure_table(
        &self,
        _table: &TableRef,
        _schema: &TableSchema,
        _disposition: CreateDisposition,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn insert_batch(&self, _table: &TableRef, rows: &[SinkRow]) -> Result<usize, SinkError> {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.rows.fetch_add(rows.len(), Ordering::SeqCst);
        Ok(rows.len())
    }

    fn max_rows_per_call(&self) -> usize {
        1_000
    }
}

/// Dead-letter sink that rejects every write.
pub struct UnreachableDeadLetter;

#[async_trait]
impl DeadLetterSink for UnreachableDeadLetter {
    async fn divert(&self, _letters: &[DeadLetter]) -> Result<(), DeadLetterError> {
        Err(DeadLetterError::Io(std::io::Error::other("dead-letter store down")))
    }

    fn diverted(&self) -> u64 {
        0
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
