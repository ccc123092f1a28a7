use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use crate::config::types::CreateDisposition;

/// Row shape written to the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRow {
    pub insert_date: NaiveDate,
    pub json_dat: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Date,
    String,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Date => "DATE",
            ColumnType::String => "VARCHAR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// `{insert_date: DATE, json_dat: STRING}`
    pub fn cdc() -> Self {
        Self {
            columns: vec![
                Column {
                    name: "insert_date",
                    kind: ColumnType::Date,
                },
                Column {
                    name: "json_dat",
                    kind: ColumnType::String,
                },
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    /// Timeouts, throttling, lock contention: worth retrying
    #[error("transient sink error: {0}")]
    Transient(String),

    #[error("permanent sink error: {0}")]
    Permanent(String),

    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_) | SinkError::Io(_))
    }
}

impl From<duckdb::Error> for SinkError {
    fn from(e: duckdb::Error) -> Self {
        let msg = e.to_string();
        if msg.contains("Catalog Error") && msg.contains("does not exist") {
            SinkError::TableNotFound(msg)
        } else if msg.contains("Could not set lock")
            || msg.contains("Conflict")
            || msg.contains("database is locked")
        {
            SinkError::Transient(msg)
        } else {
            SinkError::Permanent(msg)
        }
    }
}

/// Append-only table store taking batched inserts.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn ensure_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        disposition: CreateDisposition,
    ) -> Result<(), SinkError>;

    /// Write every row or none of them.
    async fn insert_batch(&self, table: &TableRef, rows: &[SinkRow]) -> Result<usize, SinkError>;

    /// Largest number of rows accepted by one `insert_batch` call.
    fn max_rows_per_call(&self) -> usize;
}
