use super::message::{AckHandle, Message};
use super::timestamp::{TimestampError, TimestampExtractor};
use super::traits::{PullResponse, Source, SourceError};
use crate::clock::Clock;
use crate::config::types::TimestampConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A newline-delimited file read as a finite topic.
///
/// Each non-empty line is one message. Lines are read as raw bytes so
/// undecodable payloads reach the transformer intact. Nacked lines are
/// queued for redelivery ahead of unread ones.
pub struct FileSource {
    topic: String,
    path: PathBuf,
    extractor: Option<TimestampExtractor>,
    clock: Arc<dyn Clock>,
    state: Mutex<FileState>,
}

#[derive(Default)]
struct FileState {
    reader: Option<BufReader<File>>,
    offset: u64,
    eof: bool,
    in_flight: HashMap<AckHandle, PendingLine>,
    redeliver: VecDeque<PendingLine>,
}

#[derive(Debug, Clone)]
struct PendingLine {
    id: String,
    bytes: Vec<u8>,
    publish_time: DateTime<Utc>,
}

impl FileSource {
    pub fn new(
        topic: impl Into<String>,
        path: impl AsRef<Path>,
        timestamp: Option<&TimestampConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TimestampError> {
        let extractor = timestamp
            .map(|ts| TimestampExtractor::new(&ts.pattern, &ts.format))
            .transpose()?;

        Ok(Self {
            topic: topic.into(),
            path: path.as_ref().to_path_buf(),
            extractor,
            clock,
            state: Mutex::new(FileState::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines handed out and not yet acked or nacked.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    fn open(&self, state: &mut FileState) -> Result<(), SourceError> {
        let file = File::open(&self.path).map_err(|e| {
            SourceError::Fatal(format!("failed to open '{}': {}", self.path.display(), e))
        })?;
        info!(path = %self.path.display(), "Opened input file");
        state.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn read_line(&self, state: &mut FileState) -> Result<Option<PendingLine>, SourceError> {
        loop {
            let Some(reader) = state.reader.as_mut() else {
                return Ok(None);
            };

            let start_offset = state.offset;
            let mut buf = Vec::new();
            let bytes_read = reader.read_until(b'\n', &mut buf)?;
            if bytes_read == 0 {
                state.eof = true;
                return Ok(None);
            }
            state.offset += bytes_read as u64;

            while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }

            let publish_time = self.publish_time_for(&buf, start_offset);
            return Ok(Some(PendingLine {
                id: format!("{}:{}", self.path.display(), start_offset),
                bytes: buf,
                publish_time,
            }));
        }
    }

    fn publish_time_for(&self, bytes: &[u8], offset: u64) -> DateTime<Utc> {
        let Some(extractor) = &self.extractor else {
            return self.clock.now();
        };

        match extractor.extract(&String::from_utf8_lossy(bytes)) {
            Ok(Some(ts)) => ts,
            Ok(None) => {
                debug!(offset, "No event time in line, using read time");
                self.clock.now()
            }
            Err(e) => {
                warn!(offset, error = %e, "Unparseable event time, using read time");
                self.clock.now()
            }
        }
    }

    fn deliver(state: &mut FileState, line: PendingLine) -> Message {
        let ack = AckHandle::generate();
        let message = Message {
            id: line.id.clone(),
            payload: line.bytes.clone(),
            publish_time: line.publish_time,
            ack: ack.clone(),
        };
        state.in_flight.insert(ack, line);
        message
    }
}

#[async_trait]
impl Source for FileSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn pull(&self, max_messages: usize) -> Result<PullResponse, SourceError> {
        let mut state = self.state.lock().await;
        if state.reader.is_none() && !state.eof {
            self.open(&mut state)?;
        }

        let mut messages = Vec::with_capacity(max_messages);
        while messages.len() < max_messages {
            let next = match state.redeliver.pop_front() {
                Some(line) => Some(line),
                None if state.eof => None,
                None => self.read_line(&mut state)?,
            };
            let Some(line) = next else {
                break;
            };
            messages.push(Self::deliver(&mut state, line));
        }

        // Lines still in flight may be nacked later; this run will not see them again
        let end_of_stream = messages.is_empty() && state.eof && state.redeliver.is_empty();

        Ok(PullResponse {
            messages,
            low_watermark: None,
            end_of_stream,
        })
    }

    async fn ack(&self, handles: &[AckHandle]) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        for handle in handles {
            if state.in_flight.remove(handle).is_none() {
                debug!(handle = %handle, "Ack for unknown delivery ignored");
            }
        }
        Ok(())
    }

    async fn nack(&self, handles: &[AckHandle]) -> Result<(), SourceError> {
        let mut state = self.state.lock().await;
        for handle in handles {
            if let Some(line) = state.in_flight.remove(handle) {
                if state.eof && state.redeliver.is_empty() {
                    warn!(message_id = %line.id, "Nacked after end of input, line will be re-read on next run");
                }
                state.redeliver.push_back(line);
            }
        }
        Ok(())
    }
}
