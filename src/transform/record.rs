use crate::clock::Clock;
use crate::sink::SinkRow;
use crate::source::Message;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("payload is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("payload is not valid JSON: {reason}")]
    InvalidJson { reason: String },
}

/// A message ready for the sink. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    ingest_date: NaiveDate,
    payload: String,
    event_time: DateTime<Utc>,
}

impl Record {
    /// Processing date the record was produced on (not the event date).
    pub fn ingest_date(&self) -> NaiveDate {
        self.ingest_date
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    pub fn to_row(&self) -> SinkRow {
        SinkRow {
            insert_date: self.ingest_date,
            json_dat: self.payload.clone(),
        }
    }
}

/// Turns raw messages into records. Pure apart from reading the clock.
#[derive(Clone)]
pub struct RecordTransformer {
    clock: Arc<dyn Clock>,
    require_json: bool,
}

impl RecordTransformer {
    pub fn new(clock: Arc<dyn Clock>, require_json: bool) -> Self {
        Self {
            clock,
            require_json,
        }
    }

    pub fn transform(&self, message: &Message) -> Result<Record, TransformError> {
        let payload = std::str::from_utf8(&message.payload).map_err(|e| {
            TransformError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            }
        })?;

        if self.require_json {
            serde_json::from_str::<serde::de::IgnoredAny>(payload).map_err(|e| {
                TransformError::InvalidJson {
                    reason: e.to_string(),
                }
            })?;
        }

        Ok(Record {
            ingest_date: self.clock.now().date_naive(),
            payload: payload.to_string(),
            event_time: message.event_time(),
        })
    }
}
