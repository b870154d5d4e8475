//! Shared cross-run ledger.
//!
//! One SQLite database at a well-known path (from configuration) holds a
//! `runs` table with one row per (user, project, module, start-time) tuple.
//! Writers on different hosts race freely; the UPDATE-then-INSERT-OR-REPLACE
//! upsert inside one transaction keeps the tuple unique without native MERGE
//! support.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::warn;

use crate::ledger::StateCounts;

/// Identity of a run in the global ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKey {
    pub user: String,
    pub project: String,
    pub module: String,
    pub start_time: String,
}

/// Aggregate run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Derive the status a fresh row should carry from its counts.
    pub fn from_counts(counts: &StateCounts) -> Self {
        if counts.failed == 0
            && counts.running == 0
            && counts.pending == 0
            && counts.total > 0
        {
            RunStatus::Completed
        } else if counts.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Running
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One global run row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRow {
    pub id: i64,
    pub user: String,
    pub project: String,
    pub module: String,
    pub backend: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub script_path: String,
    pub total: i64,
    pub pending: i64,
    pub failed: i64,
    pub running: i64,
    pub finished: i64,
    pub status: Option<String>,
    pub host: Option<String>,
    pub pid: Option<i64>,
}

impl RunRow {
    pub fn key(&self) -> RunKey {
        RunKey {
            user: self.user.clone(),
            project: self.project.clone(),
            module: self.module.clone(),
            start_time: self.start_time.clone(),
        }
    }
}

const RUN_COLUMNS: &str = "id, user, project, module, backend, start_time, end_time, \
                           script_path, total, pending, failed, running, finished, status, \
                           host, pid";

#[derive(Clone)]
pub struct GlobalLedger {
    pool: SqlitePool,
    path: PathBuf,
}

impl GlobalLedger {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open global ledger {}", path.display()))?;

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
            CREATE TABLE IF NOT EXISTS runs(
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                project TEXT NOT NULL,
                module TEXT NOT NULL,
                backend TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                script_path TEXT NOT NULL,
                total INTEGER DEFAULT 0,
                pending INTEGER DEFAULT 0,
                failed INTEGER DEFAULT 0,
                running INTEGER DEFAULT 0,
                finished INTEGER DEFAULT 0,
                status TEXT DEFAULT 'running',
                host TEXT,
                pid INTEGER,
                UNIQUE(user, project, module, start_time)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create runs table")?;

        // Legacy databases used `mode` for the backend column; rename once.
        let legacy: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info('runs') WHERE name = 'mode'",
        )
        .fetch_one(&self.pool)
        .await?;
        if legacy > 0 {
            if let Err(err) = sqlx::query("ALTER TABLE runs RENAME COLUMN mode TO backend")
                .execute(&self.pool)
                .await
            {
                warn!(%err, "could not rename legacy mode column");
            }
        }

        let additions: &[(&str, &str)] = &[
            ("status", "TEXT DEFAULT 'running'"),
            ("host", "TEXT"),
            ("pid", "INTEGER"),
        ];
        for (name, definition) in additions {
            let present: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM pragma_table_info('runs') WHERE name = ?",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
            if present == 0 {
                sqlx::query(&format!("ALTER TABLE runs ADD COLUMN {name} {definition}"))
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("failed to add column {name}"))?;
            }
        }
        Ok(())
    }

    /// Record current counts for a run, creating the row when absent.
    ///
    /// One transaction: an UPDATE on the tuple key, then INSERT OR REPLACE
    /// when nothing matched. Concurrent upserters for the same tuple converge
    /// on a single row.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_run(
        &self,
        key: &RunKey,
        counts: &StateCounts,
        backend: &str,
        script_path: &str,
        host: &str,
        pid: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE runs SET pending = ?, failed = ?, running = ?, finished = ?, total = ?, \
             host = ?, pid = ? \
             WHERE user = ? AND project = ? AND module = ? AND start_time = ?",
        )
        .bind(counts.pending)
        .bind(counts.failed)
        .bind(counts.running)
        .bind(counts.finished)
        .bind(counts.total)
        .bind(host)
        .bind(pid)
        .bind(&key.user)
        .bind(&key.project)
        .bind(&key.module)
        .bind(&key.start_time)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let status = RunStatus::from_counts(counts);
            sqlx::query(
                "INSERT OR REPLACE INTO runs(user, project, module, backend, start_time, \
                 script_path, total, pending, failed, running, finished, status, host, pid) \
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&key.user)
            .bind(&key.project)
            .bind(&key.module)
            .bind(backend)
            .bind(&key.start_time)
            .bind(script_path)
            .bind(counts.total)
            .bind(counts.pending)
            .bind(counts.failed)
            .bind(counts.running)
            .bind(counts.finished)
            .bind(status.as_str())
            .bind(host)
            .bind(pid)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn set_status(&self, key: &RunKey, status: RunStatus) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET status = ? \
             WHERE user = ? AND project = ? AND module = ? AND start_time = ?",
        )
        .bind(status.as_str())
        .bind(&key.user)
        .bind(&key.project)
        .bind(&key.module)
        .bind(&key.start_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_end_time(&self, key: &RunKey, end_time: &str) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET end_time = ? \
             WHERE user = ? AND project = ? AND module = ? AND start_time = ?",
        )
        .bind(end_time)
        .bind(&key.user)
        .bind(&key.project)
        .bind(&key.module)
        .bind(&key.start_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All runs for a user, newest first within each project.
    pub async fn runs_for_user(&self, user: &str) -> Result<Vec<RunRow>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE user = ? \
             ORDER BY project ASC, start_time DESC"
        ))
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn runs_for_project(&self, user: &str, project: &str) -> Result<Vec<RunRow>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE user = ? AND project = ? \
             ORDER BY start_time DESC"
        ))
        .bind(user)
        .bind(project)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Rows matched by a delete request: by row id, by (project, module), or
    /// by project alone.
    pub async fn runs_matching(
        &self,
        user: &str,
        project: Option<&str>,
        module: Option<&str>,
        run_id: Option<i64>,
    ) -> Result<Vec<RunRow>> {
        let rows = match (run_id, project, module) {
            (Some(id), _, _) => {
                sqlx::query_as::<_, RunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE user = ? AND id = ?"
                ))
                .bind(user)
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(project), Some(module)) => {
                sqlx::query_as::<_, RunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs \
                     WHERE user = ? AND project = ? AND module = ?"
                ))
                .bind(user)
                .bind(project)
                .bind(module)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(project), None) => {
                sqlx::query_as::<_, RunRow>(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE user = ? AND project = ?"
                ))
                .bind(user)
                .bind(project)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None, _) => Vec::new(),
        };
        Ok(rows)
    }

    /// Remove matched rows in a single statement; returns rows deleted.
    pub async fn delete_runs(
        &self,
        user: &str,
        project: Option<&str>,
        module: Option<&str>,
        run_id: Option<i64>,
    ) -> Result<u64> {
        let result = match (run_id, project, module) {
            (Some(id), _, _) => {
                sqlx::query("DELETE FROM runs WHERE user = ? AND id = ?")
                    .bind(user)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            (None, Some(project), Some(module)) => {
                sqlx::query("DELETE FROM runs WHERE user = ? AND project = ? AND module = ?")
                    .bind(user)
                    .bind(project)
                    .bind(module)
                    .execute(&self.pool)
                    .await?
            }
            (None, Some(project), None) => {
                sqlx::query("DELETE FROM runs WHERE user = ? AND project = ?")
                    .bind(user)
                    .bind(project)
                    .execute(&self.pool)
                    .await?
            }
            (None, None, _) => return Ok(0),
        };
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(project: &str, module: &str) -> RunKey {
        RunKey {
            user: "alice".to_string(),
            project: project.to_string(),
            module: module.to_string(),
            start_time: "2025-03-07 09:00:00".to_string(),
        }
    }

    fn counts(pending: i64, running: i64, failed: i64, finished: i64) -> StateCounts {
        StateCounts {
            total: pending + running + failed + finished,
            pending,
            failed,
            running,
            finished,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_one_row() {
        let dir = TempDir::new().unwrap();
        let ledger = GlobalLedger::open(&dir.path().join("global.db")).await.unwrap();
        let key = key("proj", "work");

        ledger
            .upsert_run(&key, &counts(3, 0, 0, 0), "local", "/tmp/work.sh", "host-1", 42)
            .await
            .unwrap();
        ledger
            .upsert_run(&key, &counts(0, 1, 0, 2), "local", "/tmp/work.sh", "host-1", 42)
            .await
            .unwrap();

        let rows = ledger.runs_for_user("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].finished, 2);
        assert_eq!(rows[0].running, 1);
        assert_eq!(rows[0].pid, Some(42));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_unchanged_counts() {
        let dir = TempDir::new().unwrap();
        let ledger = GlobalLedger::open(&dir.path().join("global.db")).await.unwrap();
        let key = key("proj", "work");
        let c = counts(0, 0, 0, 3);

        ledger
            .upsert_run(&key, &c, "local", "/tmp/work.sh", "host-1", 42)
            .await
            .unwrap();
        let first = ledger.runs_for_user("alice").await.unwrap();
        ledger
            .upsert_run(&key, &c, "local", "/tmp/work.sh", "host-1", 42)
            .await
            .unwrap();
        let second = ledger.runs_for_user("alice").await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].finished, second[0].finished);
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn concurrent_upserts_of_distinct_tuples_both_land() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("global.db");
        let a = GlobalLedger::open(&path).await.unwrap();
        let b = GlobalLedger::open(&path).await.unwrap();

        let ka = key("proj", "alpha");
        let kb = key("proj", "beta");
        let ca = counts(1, 1, 0, 1);
        let cb = counts(0, 2, 1, 0);

        let ha = tokio::spawn(async move {
            for _ in 0..20 {
                a.upsert_run(&ka, &ca, "local", "/tmp/alpha.sh", "host-1", 1)
                    .await
                    .unwrap();
            }
        });
        let hb = tokio::spawn(async move {
            for _ in 0..20 {
                b.upsert_run(&kb, &cb, "qsubsge", "/tmp/beta.sh", "host-2", 2)
                    .await
                    .unwrap();
            }
        });
        ha.await.unwrap();
        hb.await.unwrap();

        let ledger = GlobalLedger::open(&path).await.unwrap();
        let rows = ledger.runs_for_project("alice", "proj").await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn status_derivation_from_counts() {
        assert_eq!(RunStatus::from_counts(&counts(0, 0, 0, 3)), RunStatus::Completed);
        assert_eq!(RunStatus::from_counts(&counts(0, 0, 1, 2)), RunStatus::Failed);
        assert_eq!(RunStatus::from_counts(&counts(1, 1, 0, 1)), RunStatus::Running);
        assert_eq!(RunStatus::from_counts(&counts(0, 0, 0, 0)), RunStatus::Running);
    }

    #[tokio::test]
    async fn delete_by_project_and_module() {
        let dir = TempDir::new().unwrap();
        let ledger = GlobalLedger::open(&dir.path().join("global.db")).await.unwrap();
        let c = counts(0, 0, 0, 1);
        ledger
            .upsert_run(&key("proj", "alpha"), &c, "local", "/tmp/alpha.sh", "h", 1)
            .await
            .unwrap();
        ledger
            .upsert_run(&key("proj", "beta"), &c, "local", "/tmp/beta.sh", "h", 1)
            .await
            .unwrap();

        let deleted = ledger
            .delete_runs("alice", Some("proj"), Some("alpha"), None)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        let rows = ledger.runs_for_project("alice", "proj").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].module, "beta");
    }
}
