use super::traits::{CreateDisposition, Sink, SinkError, SinkRow, TableRef, TableSchema};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

const DEFAULT_MAX_ROWS_PER_CALL: usize = 50_000;

/// Appends rows to a JSON-lines file, one object per row.
///
/// The file stands in for the table; `TableRef` names are not used.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
    max_rows_per_call: usize,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
            max_rows_per_call: DEFAULT_MAX_ROWS_PER_CALL,
        }
    }

    pub fn with_max_rows_per_call(mut self, max_rows: usize) -> Self {
        self.max_rows_per_call = max_rows.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    async fn ensure_table(
        &self,
        _table: &TableRef,
        _schema: &TableSchema,
        disposition: CreateDisposition,
    ) -> Result<(), SinkError> {
        let mut file = self.file.lock().await;
        if file.is_some() {
            return Ok(());
        }

        let exists = tokio::fs::try_exists(&self.path).await?;
        if !exists && disposition == CreateDisposition::CreateNever {
            return Err(SinkError::TableNotFound(self.path.display().to_string()));
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        info!(path = %self.path.display(), "Opened JSON-lines sink");
        *file = Some(opened);
        Ok(())
    }

    async fn insert_batch(&self, _table: &TableRef, rows: &[SinkRow]) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if rows.len() > self.max_rows_per_call {
            return Err(SinkError::Permanent(format!(
                "{} rows exceeds the per-call limit of {}",
                rows.len(),
                self.max_rows_per_call
            )));
        }

        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)
                .map_err(|e| SinkError::Permanent(format!("failed to encode row: {}", e)))?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return Err(SinkError::TableNotFound(self.path.display().to_string()));
        };
        // One write per batch keeps a batch contiguous in the file
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(rows.len())
    }

    fn max_rows_per_call(&self) -> usize {
        self.max_rows_per_call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn row(json: &str) -> SinkRow {
        SinkRow {
            insert_date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            json_dat: json.to_string(),
        }
    }

    #[tokio::test]
    async fn test_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output.txt");
        let sink = JsonLinesSink::new(&path);
        let table = TableRef::new("ignored");

        sink.ensure_table(&table, &TableSchema::cdc(), CreateDisposition::CreateIfNeeded)
            .await
            .unwrap();
        sink.insert_batch(&table, &[row(r#"{"op":"c"}"#), row("plain")])
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"insert_date":"2026-03-01","json_dat":"{\"op\":\"c\"}"}"#
        );
        let parsed: SinkRow = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, row("plain"));
    }

    #[tokio::test]
    async fn test_insert_before_ensure_is_table_not_found() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("out.txt"));
        let err = sink
            .insert_batch(&TableRef::new("t"), &[row("{}")])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn test_create_never_requires_existing_file() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("absent.txt"));
        let err = sink
            .ensure_table(&TableRef::new("t"), &TableSchema::cdc(), CreateDisposition::CreateNever)
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::TableNotFound(_)));
    }
}
