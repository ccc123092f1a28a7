use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("pattern missing 'ts' capture group")]
    MissingTsGroup,

    #[error("failed to parse timestamp '{value}' with format '{format}': {reason}")]
    Parse {
        value: String,
        format: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub enum TimestampFormat {
    Strptime(String),
    Iso8601,
    Epoch,
    EpochMs,
}

impl TimestampFormat {
    fn name(&self) -> &str {
        match self {
            TimestampFormat::Strptime(fmt) => fmt,
            TimestampFormat::Iso8601 => "iso8601",
            TimestampFormat::Epoch => "epoch",
            TimestampFormat::EpochMs => "epoch_ms",
        }
    }
}

/// Pulls an event time out of a message payload.
///
/// CDC envelopes usually carry the change time inline (Debezium's `ts_ms`),
/// which is a better windowing key than the time the line was read.
#[derive(Debug)]
pub struct TimestampExtractor {
    pattern: Regex,
    format: TimestampFormat,
}

impl TimestampExtractor {
    /// # Arguments
    /// * `pattern` - Regex with a named capture group `ts`
    /// * `format` - One of: strptime format string, `iso8601`, `epoch`, `epoch_ms`
    pub fn new(pattern: &str, format: &str) -> Result<Self, TimestampError> {
        let pattern = Regex::new(pattern)?;
        if pattern.capture_names().all(|name| name != Some("ts")) {
            return Err(TimestampError::MissingTsGroup);
        }

        let format = match format {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => TimestampFormat::Strptime(other.to_string()),
        };

        Ok(Self { pattern, format })
    }

    /// Returns `Ok(None)` when the pattern does not match the payload.
    pub fn extract(&self, payload: &str) -> Result<Option<DateTime<Utc>>, TimestampError> {
        let Some(value) = self
            .pattern
            .captures(payload)
            .and_then(|caps| caps.name("ts"))
            .map(|m| m.as_str())
        else {
            return Ok(None);
        };

        let parsed = match &self.format {
            TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| self.parse_error(value, e)),
            TimestampFormat::Epoch => value
                .parse::<i64>()
                .map_err(|e| self.parse_error(value, e))
                .and_then(|secs| {
                    DateTime::from_timestamp(secs, 0)
                        .ok_or_else(|| self.parse_error(value, "timestamp out of range"))
                }),
            TimestampFormat::EpochMs => value
                .parse::<i64>()
                .map_err(|e| self.parse_error(value, e))
                .and_then(|millis| {
                    DateTime::from_timestamp_millis(millis)
                        .ok_or_else(|| self.parse_error(value, "timestamp out of range"))
                }),
            TimestampFormat::Strptime(fmt) if has_zone(fmt) => {
                DateTime::parse_from_str(value, fmt)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| self.parse_error(value, e))
            }
            // Zone-less formats are taken as UTC
            TimestampFormat::Strptime(fmt) => NaiveDateTime::parse_from_str(value, fmt)
                .map(|ndt| Utc.from_utc_datetime(&ndt))
                .map_err(|e| self.parse_error(value, e)),
        }?;

        Ok(Some(parsed))
    }

    fn parse_error(&self, value: &str, reason: impl std::fmt::Display) -> TimestampError {
        TimestampError::Parse {
            value: value.to_string(),
            format: self.format.name().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn has_zone(format: &str) -> bool {
    format.contains("%z") || format.contains("%Z") || format.contains("%:z")
}
