pub mod duckdb;
pub mod file;
pub mod traits;

pub use self::duckdb::DuckDbSink;
pub use file::JsonLinesSink;
pub use traits::{
    Column, ColumnType, CreateDisposition, Sink, SinkError, SinkRow, TableRef, TableSchema,
};

use std::path::Path;
use std::sync::Arc;

/// Pick a sink for an output identifier: `.duckdb`/`.db` files are DuckDB
/// databases, anything else is a JSON-lines file.
pub fn open_sink(output: &Path) -> Result<Arc<dyn Sink>, SinkError> {
    let is_database = output
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "duckdb" | "db"))
        .unwrap_or(false);

    if is_database {
        Ok(Arc::new(DuckDbSink::open(output)?))
    } else {
        Ok(Arc::new(JsonLinesSink::new(output)))
    }
}
