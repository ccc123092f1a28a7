use super::traits::{CreateDisposition, Sink, SinkError, SinkRow, TableRef, TableSchema};
use async_trait::async_trait;
use chrono::NaiveDate;
use duckdb::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const DEFAULT_MAX_ROWS_PER_CALL: usize = 10_000;

fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        std::process::Command::new("ps")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// DuckDB reports the holder of a file lock as "(PID 12345)".
fn lock_holder_pid(error_msg: &str) -> Option<u32> {
    let start = error_msg.find("(PID ")? + "(PID ".len();
    let end = error_msg[start..].find(')')?;
    error_msg[start..start + end].parse().ok()
}

fn remove_stale_lock_files(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["wal", "lock"] {
        let stale = PathBuf::from(format!("{}.{}", db_path.display(), suffix));
        if stale.exists() {
            std::fs::remove_file(&stale)?;
            info!(path = %stale.display(), "Removed stale DuckDB file");
        }
    }
    Ok(())
}

/// DuckDB-backed table store.
pub struct DuckDbSink {
    conn: Arc<Mutex<Connection>>,
    max_rows_per_call: usize,
}

impl DuckDbSink {
    /// Open (or create) the database at `path`.
    ///
    /// A lock left behind by a process that no longer runs is cleared once.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match Connection::open(path) {
            Ok(conn) => conn,
            Err(e) => {
                let msg = e.to_string();
                let Some(pid) = msg
                    .contains("Could not set lock")
                    .then(|| lock_holder_pid(&msg))
                    .flatten()
                else {
                    return Err(e.into());
                };

                if is_process_running(pid) {
                    error!(pid, path = %path.display(), "Database locked by a running process");
                    return Err(SinkError::Permanent(msg));
                }

                warn!(pid, path = %path.display(), "Lock holder is gone, clearing stale lock");
                remove_stale_lock_files(path)?;
                Connection::open(path)?
            }
        };

        info!(path = %path.display(), "Opened DuckDB sink");
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            max_rows_per_call: DEFAULT_MAX_ROWS_PER_CALL,
        }
    }

    pub fn with_max_rows_per_call(mut self, max_rows: usize) -> Self {
        self.max_rows_per_call = max_rows.max(1);
        self
    }

    /// Rows currently in `table`.
    pub async fn count_rows(&self, table: &TableRef) -> Result<usize, SinkError> {
        let conn = Arc::clone(&self.conn);
        let sql = format!("SELECT COUNT(*) FROM {}", table.name);
        run_blocking(move || {
            let conn = lock(&conn)?;
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    /// Every row of `table` in insertion order.
    pub async fn read_rows(&self, table: &TableRef) -> Result<Vec<SinkRow>, SinkError> {
        let conn = Arc::clone(&self.conn);
        let sql = format!(
            "SELECT CAST(insert_date AS VARCHAR), json_dat FROM {} ORDER BY rowid",
            table.name
        );
        run_blocking(move || {
            let conn = lock(&conn)?;
            let mut stmt = conn.prepare(&sql)?;
            let raw = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(date, json_dat)| {
                    let insert_date = date.parse::<NaiveDate>().map_err(|e| {
                        SinkError::Permanent(format!("bad insert_date '{}': {}", date, e))
                    })?;
                    Ok(SinkRow {
                        insert_date,
                        json_dat,
                    })
                })
                .collect()
        })
        .await
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, SinkError> {
    conn.lock()
        .map_err(|_| SinkError::Permanent("connection mutex poisoned".to_string()))
}

async fn run_blocking<T, F>(f: F) -> Result<T, SinkError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SinkError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SinkError::Permanent(format!("task join error: {}", e)))?
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, SinkError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
        duckdb::params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

#[async_trait]
impl Sink for DuckDbSink {
    async fn ensure_table(
        &self,
        table: &TableRef,
        schema: &TableSchema,
        disposition: CreateDisposition,
    ) -> Result<(), SinkError> {
        let conn = Arc::clone(&self.conn);
        let name = table.name.clone();
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("{} {} NOT NULL", c.name, c.kind.sql()))
            .collect::<Vec<_>>()
            .join(", ");

        run_blocking(move || {
            let conn = lock(&conn)?;
            match disposition {
                CreateDisposition::CreateIfNeeded => {
                    conn.execute(
                        &format!("CREATE TABLE IF NOT EXISTS {} ({})", name, columns),
                        [],
                    )?;
                    debug!(table = %name, "Table ensured");
                    Ok(())
                }
                CreateDisposition::CreateNever if table_exists(&conn, &name)? => Ok(()),
                CreateDisposition::CreateNever => Err(SinkError::TableNotFound(name)),
            }
        })
        .await
    }

    async fn insert_batch(&self, table: &TableRef, rows: &[SinkRow]) -> Result<usize, SinkError> {
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

        let conn = Arc::clone(&self.conn);
        let sql = format!(
            "INSERT INTO {} (insert_date, json_dat) VALUES (CAST(? AS DATE), ?)",
            table.name
        );
        let rows = rows.to_vec();

        run_blocking(move || {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&sql)?;
                for row in &rows {
                    stmt.execute(duckdb::params![row.insert_date.to_string(), row.json_dat])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
        .await
    }

    fn max_rows_per_call(&self) -> usize {
        self.max_rows_per_call
    }
}
