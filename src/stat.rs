//! Status inspection (`stat` verb).
//!
//! Before printing, every matching run's counts are refreshed from its batch
//! ledger so the tables reflect reality even while another invocation is
//! mid-run on a different host.

use std::path::PathBuf;

use anyhow::Result;
use tracing::warn;

use crate::config::{current_user, local_hostname, Config};
use crate::global::{GlobalLedger, RunRow};
use crate::ledger::Ledger;
use crate::memstr::format_time_short;

/// Print run tables for the invoking user, optionally scoped to a project.
pub async fn run_stat(config: &Config, project: Option<&str>) -> Result<()> {
    let global = GlobalLedger::open(&config.db).await?;
    let user = current_user();

    let rows = match project {
        Some(project) => global.runs_for_project(&user, project).await?,
        None => global.runs_for_user(&user).await?,
    };
    refresh_counts(&global, &rows).await;

    match project {
        Some(project) => {
            let rows = global.runs_for_project(&user, project).await?;
            print_project_table(&rows);
        }
        None => {
            let rows = global.runs_for_user(&user).await?;
            print_overview_table(&rows);
        }
    }
    Ok(())
}

/// Re-read each run's batch ledger and push current counts into the global
/// ledger. Missing or unreadable ledgers are skipped.
async fn refresh_counts(global: &GlobalLedger, rows: &[RunRow]) {
    let hostname = local_hostname();
    for row in rows {
        let db_path = PathBuf::from(format!("{}.db", row.script_path));
        if !db_path.exists() {
            continue;
        }
        let ledger = match Ledger::open(&db_path).await {
            Ok(ledger) => ledger,
            Err(_) => continue,
        };
        let counts = match ledger.count_by_state().await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(script = %row.script_path, %err, "failed to read batch counts");
                continue;
            }
        };

        // Local runs execute where stat runs; grid rows keep their recorded
        // submission host.
        let host = if row.backend == "local" {
            hostname.clone()
        } else {
            row.host.clone().unwrap_or_else(|| "-".to_string())
        };
        let pid = row.pid.unwrap_or(0);

        if let Err(err) = global
            .upsert_run(
                &row.key(),
                &counts,
                &row.backend,
                &row.script_path,
                &host,
                pid,
            )
            .await
        {
            warn!(script = %row.script_path, %err, "failed to refresh run record");
        }
    }
}

fn print_overview_table(rows: &[RunRow]) {
    println!(
        "{:<15} {:<20} {:<10} {:<10} {:<15} {:<12} {:<12}",
        "project", "module", "backend", "status", "finished/total", "stime", "etime"
    );
    for row in rows {
        let status = row.status.as_deref().unwrap_or("-");
        let progress = format!("{}/{}", row.finished, row.total);
        let stime = format_time_short(&row.start_time);
        let etime = row
            .end_time
            .as_deref()
            .map(format_time_short)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<15} {:<20} {:<10} {:<10} {:<15} {:<12} {:<12}",
            row.project, row.module, row.backend, status, progress, stime, etime
        );
    }
}

fn print_project_table(rows: &[RunRow]) {
    println!(
        "{:<6} {:<20} {:<8} {:<8} {:<8} {:<9} {:<12} {:<12}",
        "id", "module", "pending", "running", "failed", "finished", "stime", "etime"
    );
    for row in rows {
        let stime = format_time_short(&row.start_time);
        let etime = row
            .end_time
            .as_deref()
            .map(format_time_short)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<20} {:<8} {:<8} {:<8} {:<9} {:<12} {:<12}",
            row.id, row.module, row.pending, row.running, row.failed, row.finished, stime, etime
        );
    }

    if !rows.is_empty() {
        println!();
        for row in rows {
            println!("{} {}", row.id, row.script_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::RunKey;
    use crate::ledger::{Backend, StateCounts};
    use tempfile::TempDir;

    #[tokio::test]
    async fn refresh_pulls_counts_from_batch_ledger() {
        let dir = TempDir::new().unwrap();
        let global = GlobalLedger::open(&dir.path().join("global.db")).await.unwrap();

        // A run whose global row is stale: the batch ledger has moved on.
        let script_path = dir.path().join("work.sh").display().to_string();
        let ledger = Ledger::open(&PathBuf::from(format!("{script_path}.db")))
            .await
            .unwrap();
        for n in 1..=3 {
            let script = format!("{script_path}.shell/work_{n:04}.sh");
            ledger.register_batch(n, &script, Backend::Local).await.unwrap();
        }
        ledger.record_finished(1, 0, None).await.unwrap();
        ledger.record_finished(2, 0, None).await.unwrap();

        let key = RunKey {
            user: "alice".to_string(),
            project: "proj".to_string(),
            module: "work".to_string(),
            start_time: "2025-03-07 09:00:00".to_string(),
        };
        let stale = StateCounts {
            total: 3,
            pending: 3,
            ..Default::default()
        };
        global
            .upsert_run(&key, &stale, "local", &script_path, "host-1", 10)
            .await
            .unwrap();

        let rows = global.runs_for_user("alice").await.unwrap();
        refresh_counts(&global, &rows).await;

        let rows = global.runs_for_user("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].finished, 2);
        assert_eq!(rows[0].pending, 1);
    }

    #[tokio::test]
    async fn refresh_skips_runs_without_a_ledger() {
        let dir = TempDir::new().unwrap();
        let global = GlobalLedger::open(&dir.path().join("global.db")).await.unwrap();
        let key = RunKey {
            user: "alice".to_string(),
            project: "proj".to_string(),
            module: "gone".to_string(),
            start_time: "2025-03-07 09:00:00".to_string(),
        };
        let counts = StateCounts {
            total: 2,
            pending: 2,
            ..Default::default()
        };
        global
            .upsert_run(&key, &counts, "local", "/nonexistent/gone.sh", "h", 1)
            .await
            .unwrap();

        let rows = global.runs_for_user("alice").await.unwrap();
        refresh_counts(&global, &rows).await;

        // No ledger file: counts stay as recorded, and no db was created.
        let rows = global.runs_for_user("alice").await.unwrap();
        assert_eq!(rows[0].pending, 2);
        assert!(!PathBuf::from("/nonexistent/gone.sh.db").exists());
    }
}
