//! Per-input batch ledger.
//!
//! Every input file `X` gets a SQLite database `X.db` with one `batches`
//! table, one row per generated batch script. Rows survive across
//! invocations; the sentinel reconciliation pass at the start of each run
//! re-derives `Finished`/`Pending` from the on-disk `*.sign` markers, which
//! are the authoritative success record.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tracing::info;

use crate::memstr::ledger_now;

/// Execution backend recorded on each row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    QsubSge,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::QsubSge => "qsubsge",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Backend::Local),
            "qsubsge" => Ok(Backend::QsubSge),
            other => Err(anyhow!("unknown backend: {other}")),
        }
    }
}

/// Batch lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Running,
    Failed,
    Finished,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Pending => "Pending",
            BatchState::Running => "Running",
            BatchState::Failed => "Failed",
            BatchState::Finished => "Finished",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One batch row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BatchRow {
    pub batch_num: i64,
    pub script_path: String,
    pub state: String,
    pub exit_code: Option<i64>,
    pub retry: i64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub backend: String,
    pub cpu: i64,
    pub mem: f64,
    pub h_vmem: f64,
    pub task_id: Option<String>,
    pub host: Option<String>,
}

/// Aggregate counts over all batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub total: i64,
    pub pending: i64,
    pub failed: i64,
    pub running: i64,
    pub finished: i64,
}

/// Sentinel marker path for a batch script.
pub fn sentinel_path(script_path: &str) -> PathBuf {
    PathBuf::from(format!("{script_path}.sign"))
}

const BATCH_COLUMNS: &str = "batch_num, script_path, state, exit_code, retry, start_time, \
                             end_time, backend, cpu, mem, h_vmem, task_id, host";

#[derive(Clone)]
pub struct Ledger {
    pool: SqlitePool,
    path: PathBuf,
}

impl Ledger {
    /// Open (creating if necessary) the ledger at `path` and bring the schema
    /// up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open batch ledger {}", path.display()))?;

        let ledger = Self {
            pool,
            path: path.to_path_buf(),
        };
        ledger.migrate().await?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches(
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                batch_num INTEGER UNIQUE NOT NULL,
                script_path TEXT,
                state TEXT,
                exit_code INTEGER,
                retry INTEGER DEFAULT 0,
                start_time TEXT,
                end_time TEXT,
                backend TEXT DEFAULT 'local',
                cpu INTEGER DEFAULT 1,
                mem REAL DEFAULT 1,
                h_vmem REAL DEFAULT 1,
                task_id TEXT,
                host TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create batches table")?;

        // Older ledgers predate some columns; add them with safe defaults.
        let additions: &[(&str, &str)] = &[
            ("backend", "TEXT DEFAULT 'local'"),
            ("cpu", "INTEGER DEFAULT 1"),
            ("mem", "REAL DEFAULT 1"),
            ("h_vmem", "REAL DEFAULT 1"),
            ("task_id", "TEXT"),
            ("host", "TEXT"),
        ];
        for (name, definition) in additions {
            let present: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM pragma_table_info('batches') WHERE name = ?",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
            if present == 0 {
                sqlx::query(&format!("ALTER TABLE batches ADD COLUMN {name} {definition}"))
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("failed to add column {name}"))?;
            }
        }
        Ok(())
    }

    /// True when a row for `batch` already exists (resume case).
    pub async fn has_batch(&self, batch: i64) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batches WHERE batch_num = ?")
            .bind(batch)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Insert a fresh Pending row for a newly generated batch script.
    pub async fn register_batch(
        &self,
        batch: i64,
        script_path: &str,
        backend: Backend,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO batches(batch_num, script_path, state, retry, backend) \
             VALUES(?, ?, ?, 0, ?)",
        )
        .bind(batch)
        .bind(script_path)
        .bind(BatchState::Pending.as_str())
        .bind(backend.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp the current backend on every row that has not finished, so a
    /// rerun may switch modes without touching completed work.
    pub async fn update_backend_for_unfinished(&self, backend: Backend) -> Result<()> {
        sqlx::query("UPDATE batches SET backend = ? WHERE state != ?")
            .bind(backend.as_str())
            .bind(BatchState::Finished.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Force every row into agreement with its on-disk sentinel: present means
    /// Finished with exit code 0, absent means Pending with the attempt
    /// columns cleared. Runs in one transaction and is idempotent.
    pub async fn reconcile_from_sentinels(&self) -> Result<(u64, u64)> {
        let rows: Vec<(i64, String, String)> =
            sqlx::query_as("SELECT batch_num, script_path, state FROM batches")
                .fetch_all(&self.pool)
                .await?;

        let now = ledger_now();
        let mut finished = 0u64;
        let mut pending = 0u64;

        let mut tx = self.pool.begin().await?;
        for (batch, script_path, state) in rows {
            if sentinel_path(&script_path).exists() {
                if state != BatchState::Finished.as_str() {
                    sqlx::query(
                        "UPDATE batches SET state = ?, end_time = ?, exit_code = 0 \
                         WHERE batch_num = ?",
                    )
                    .bind(BatchState::Finished.as_str())
                    .bind(&now)
                    .bind(batch)
                    .execute(&mut *tx)
                    .await?;
                    finished += 1;
                }
            } else if state != BatchState::Pending.as_str() {
                sqlx::query(
                    "UPDATE batches SET state = ?, end_time = NULL, exit_code = NULL, \
                     task_id = NULL WHERE batch_num = ?",
                )
                .bind(BatchState::Pending.as_str())
                .bind(batch)
                .execute(&mut *tx)
                .await?;
                pending += 1;
            }
        }
        tx.commit().await?;

        if finished > 0 || pending > 0 {
            info!(finished, pending, "reconciled batch states from sentinel files");
        }
        Ok((finished, pending))
    }

    /// Indices of every batch that still needs a run attempt, ascending.
    pub async fn unfinished_indices(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT batch_num FROM batches WHERE state != ? ORDER BY batch_num ASC",
        )
        .bind(BatchState::Finished.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    pub async fn row(&self, batch: i64) -> Result<BatchRow> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE batch_num = ?"
        ))
        .bind(batch)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("no ledger row for batch {batch}"))?;
        Ok(row)
    }

    pub async fn snapshot_rows(&self) -> Result<Vec<BatchRow>> {
        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches ORDER BY batch_num ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_by_state(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM batches GROUP BY state")
                .fetch_all(&self.pool)
                .await?;
        let mut counts = StateCounts::default();
        for (state, n) in rows {
            counts.total += n;
            match state.as_str() {
                "Pending" => counts.pending = n,
                "Failed" => counts.failed = n,
                "Running" => counts.running = n,
                "Finished" => counts.finished = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Highest retry count over all rows, or -1 when the table is empty.
    pub async fn max_retry(&self) -> Result<i64> {
        let max: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(retry), -1) FROM batches")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    pub async fn claim_running(
        &self,
        batch: i64,
        backend: Backend,
        cpu: i64,
        mem: f64,
        h_vmem: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET state = ?, start_time = ?, backend = ?, cpu = ?, mem = ?, \
             h_vmem = ? WHERE batch_num = ?",
        )
        .bind(BatchState::Running.as_str())
        .bind(ledger_now())
        .bind(backend.as_str())
        .bind(cpu)
        .bind(mem)
        .bind(h_vmem)
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_id(&self, batch: i64, task_id: &str) -> Result<()> {
        sqlx::query("UPDATE batches SET task_id = ? WHERE batch_num = ?")
            .bind(task_id)
            .bind(batch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_host(&self, batch: i64, host: &str) -> Result<()> {
        sqlx::query("UPDATE batches SET host = ? WHERE batch_num = ?")
            .bind(host)
            .bind(batch)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_finished(
        &self,
        batch: i64,
        exit_code: i64,
        host: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET state = ?, end_time = ?, exit_code = ?, \
             host = COALESCE(?, host) WHERE batch_num = ?",
        )
        .bind(BatchState::Finished.as_str())
        .bind(ledger_now())
        .bind(exit_code)
        .bind(host)
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_failed(
        &self,
        batch: i64,
        exit_code: i64,
        retry: i64,
        mem: Option<f64>,
        h_vmem: Option<f64>,
        host: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET state = ?, end_time = ?, exit_code = ?, retry = ?, \
             mem = COALESCE(?, mem), h_vmem = COALESCE(?, h_vmem), \
             host = COALESCE(?, host) WHERE batch_num = ?",
        )
        .bind(BatchState::Failed.as_str())
        .bind(ledger_now())
        .bind(exit_code)
        .bind(retry)
        .bind(mem)
        .bind(h_vmem)
        .bind(host)
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// (successes, errors) over rows with a recorded exit code.
    pub async fn success_error_counts(&self) -> Result<(i64, i64)> {
        let success: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batches WHERE exit_code = 0")
                .fetch_one(&self.pool)
                .await?;
        let errors: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM batches WHERE exit_code != 0")
                .fetch_one(&self.pool)
                .await?;
        Ok((success, errors))
    }

    /// Batches whose last attempt failed, with their script paths.
    pub async fn failed_scripts(&self) -> Result<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT batch_num, script_path FROM batches WHERE exit_code != 0 \
             ORDER BY batch_num ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Running batches that have a backend task id (grid cancellation input).
    pub async fn running_with_task_ids(&self) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT batch_num, task_id FROM batches WHERE state = ? \
             AND task_id IS NOT NULL AND task_id != ''",
        )
        .bind(BatchState::Running.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>(0), r.get::<String, _>(1)))
            .collect())
    }

    /// Mark one batch Failed with exit code 1, without touching its retry
    /// count (used by `delete` after cancelling its grid job).
    pub async fn fail_batch(&self, batch: i64) -> Result<()> {
        sqlx::query(
            "UPDATE batches SET state = ?, end_time = ?, exit_code = 1 WHERE batch_num = ?",
        )
        .bind(BatchState::Failed.as_str())
        .bind(ledger_now())
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every Running row Failed with exit code 1 (used by `delete`).
    pub async fn mark_running_failed(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE batches SET state = ?, end_time = ?, exit_code = 1 WHERE state = ?",
        )
        .bind(BatchState::Failed.as_str())
        .bind(ledger_now())
        .bind(BatchState::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
