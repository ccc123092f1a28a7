use crate::source::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode dead letter: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Payload could not be turned into a record
    Malformed,
    /// Arrived after its window's lateness allowance
    Late,
    /// Part of a window whose commit retries were exhausted
    Quarantined,
}

/// One diverted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub reason: DeadLetterReason,
    pub detail: String,
    /// Payload decoded lossily so undecodable bytes remain inspectable
    pub payload: String,
    pub publish_time: DateTime<Utc>,
    pub diverted_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        message: &Message,
        reason: DeadLetterReason,
        detail: impl Into<String>,
        diverted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            reason,
            detail: detail.into(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            publish_time: message.publish_time,
            diverted_at,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn divert(&self, letters: &[DeadLetter]) -> Result<(), DeadLetterError>;

    /// Total letters accepted so far.
    fn diverted(&self) -> u64;
}

/// Drops diverted messages after logging them.
#[derive(Debug, Default)]
pub struct LogDeadLetter {
    count: AtomicU64,
}

impl LogDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterSink for LogDeadLetter {
    async fn divert(&self, letters: &[DeadLetter]) -> Result<(), DeadLetterError> {
        for letter in letters {
            warn!(
                message_id = %letter.message_id,
                reason = ?letter.reason,
                detail = %letter.detail,
                "Dropped message"
            );
        }
        self.count.fetch_add(letters.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn diverted(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Appends diverted messages to a JSON-lines file for later replay.
pub struct JsonLinesDeadLetter {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    count: AtomicU64,
}

impl JsonLinesDeadLetter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Dead letters go to file");

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            count: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for JsonLinesDeadLetter {
    async fn divert(&self, letters: &[DeadLetter]) -> Result<(), DeadLetterError> {
        if letters.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for letter in letters {
            serde_json::to_writer(&mut buf, letter)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;

        self.count.fetch_add(letters.len() as u64, Ordering::Relaxed);
        warn!(
            count = letters.len(),
            path = %self.path.display(),
            "Diverted messages to dead-letter file"
        );
        Ok(())
    }

    fn diverted(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Keeps diverted messages in memory. For tests and embedding callers.
#[derive(Debug, Default)]
pub struct MemoryDeadLetter {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        match self.letters.lock() {
            Ok(letters) => letters.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn divert(&self, letters: &[DeadLetter]) -> Result<(), DeadLetterError> {
        let mut guard = match self.letters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend_from_slice(letters);
        Ok(())
    }

    fn diverted(&self) -> u64 {
        self.letters().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn letter(id: &str, reason: DeadLetterReason) -> DeadLetter {
        let message = Message::new(
            id,
            vec![b'{', 0xff, b'}'],
            Utc.with_ymd_and_hms(2026, 1, 28, 10, 0, 0).unwrap(),
        );
        DeadLetter::new(
            &message,
            reason,
            "test",
            Utc.with_ymd_and_hms(2026, 1, 28, 10, 0, 5).unwrap(),
        )
    }

    #[test]
    fn test_payload_is_lossy() {
        let letter = letter("m1", DeadLetterReason::Malformed);
        assert_eq!(letter.payload, "{\u{fffd}}");
    }

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dlq/dead.jsonl");

        let sink = JsonLinesDeadLetter::open(&path).await.unwrap();
        sink.divert(&[letter("m1", DeadLetterReason::Malformed)])
            .await
            .unwrap();
        sink.divert(&[letter("m2", DeadLetterReason::Late)])
            .await
            .unwrap();
        assert_eq!(sink.diverted(), 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<DeadLetter> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].message_id, "m1");
        assert_eq!(parsed[1].reason, DeadLetterReason::Late);
        assert!(content.contains(r#""reason":"late""#));
    }

    #[tokio::test]
    async fn test_log_and_memory_count() {
        let log = LogDeadLetter::new();
        log.divert(&[letter("a", DeadLetterReason::Quarantined)])
            .await
            .unwrap();
        assert_eq!(log.diverted(), 1);

        let memory = MemoryDeadLetter::new();
        memory
            .divert(&[letter("a", DeadLetterReason::Late), letter("b", DeadLetterReason::Late)])
            .await
            .unwrap();
        assert_eq!(memory.diverted(), 2);
        assert_eq!(memory.letters()[1].message_id, "b");
    }
}
