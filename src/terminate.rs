//! Coordinated run termination (`delete` verb).
//!
//! A delete request selects global rows by project, (project, module), or row
//! id, then resolves each into per-run actions:
//!
//! - running local run on this host: kill the recorded pid and its
//!   descendants, mark running ledger rows failed
//! - running local run on another host: perform the same over ssh, including
//!   the ledger update via the remote `sqlite3`
//! - running grid run submitted from this host: `qdel` every running task id,
//!   mark those rows failed
//! - grid run submitted from another host: hard error, grid deletions must
//!   start on the submission host
//! - anything else: drop the global row only
//!
//! Per-run actions are best-effort (warnings), the final global deletion is a
//! single statement.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::warn;

use crate::config::{current_user, local_hostname, Config};
use crate::global::{GlobalLedger, RunRow};
use crate::ledger::Ledger;

/// What the user asked to delete.
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub project: Option<String>,
    pub module: Option<String>,
    pub run_id: Option<i64>,
}

/// Rows partitioned by the action they need.
#[derive(Debug, Default)]
struct Partitioned {
    same_host: Vec<RunRow>,
    remote_local: Vec<RunRow>,
    grid_remote: Vec<RunRow>,
    drop_only: Vec<RunRow>,
}

fn partition_runs(rows: Vec<RunRow>, current_host: &str) -> Partitioned {
    let mut parts = Partitioned::default();
    for row in rows {
        let row_host = row.host.clone().unwrap_or_default();
        let host_matches = row_host.is_empty() || row_host == current_host;
        let running = row
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("running"))
            .unwrap_or(false);

        if row.backend == "qsubsge" && !host_matches {
            // Even a finished grid run must be deleted from its submission
            // host, where the engine and the ledger live.
            parts.grid_remote.push(row);
        } else if running && host_matches {
            parts.same_host.push(row);
        } else if running && row.backend == "local" {
            parts.remote_local.push(row);
        } else {
            parts.drop_only.push(row);
        }
    }
    parts
}

/// Execute a delete request to completion. Not cancellable.
pub async fn run_delete(config: &Config, request: &DeleteRequest) -> Result<()> {
    if request.run_id.is_none() && request.project.is_none() {
        bail!("project name is required when no run id is given");
    }

    let global = GlobalLedger::open(&config.db).await?;
    let user = current_user();
    let rows = global
        .runs_matching(
            &user,
            request.project.as_deref(),
            request.module.as_deref(),
            request.run_id,
        )
        .await?;

    let current_host = local_hostname();
    let parts = partition_runs(rows, &current_host);

    if !parts.grid_remote.is_empty() {
        eprintln!("Error: cannot delete qsubsge runs from a different host.");
        eprintln!("Current host: {current_host}");
        for row in &parts.grid_remote {
            eprintln!(
                "  {} was submitted from host: {}",
                row.module,
                row.host.as_deref().unwrap_or("unknown")
            );
        }
        eprintln!("Run `belay delete` on the host where `belay qsubsge` was started.");
        bail!("host mismatch: grid runs must be deleted from their submission host");
    }

    for row in &parts.remote_local {
        let host = match row.host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => {
                warn!(module = %row.module, "run has no recorded host, skipping remote delete");
                continue;
            }
        };
        println!("Run is active on host '{host}', deleting over ssh...");
        match remote_delete(host, row).await {
            Ok(()) => println!("Remote delete on '{host}' done"),
            Err(err) => warn!(%host, %err, "remote delete failed"),
        }
    }

    for row in &parts.same_host {
        if let Some(pid) = row.pid.filter(|&p| p > 0) {
            let pid = pid as i32;
            if process_exists(pid) {
                match kill_process_tree(pid).await {
                    Ok(()) => println!(
                        "Terminated driver process (pid {pid}) and its children for module '{}'",
                        row.module
                    ),
                    Err(err) => warn!(pid, %err, "failed to kill process tree"),
                }
            }
        }

        match row.backend.as_str() {
            "qsubsge" => {
                if let Err(err) = cancel_grid_batches(&row.script_path).await {
                    warn!(script = %row.script_path, %err, "failed to cancel grid batches");
                }
            }
            _ => {
                if let Err(err) = fail_running_batches(&row.script_path).await {
                    warn!(script = %row.script_path, %err, "failed to update batch ledger");
                }
            }
        }
    }

    let deleted = global
        .delete_runs(
            &user,
            request.project.as_deref(),
            request.module.as_deref(),
            request.run_id,
        )
        .await?;

    match (request.run_id, request.module.as_deref()) {
        (Some(id), _) => println!("Deleted {deleted} run record(s) with id {id}"),
        (None, Some(module)) => println!(
            "Deleted {deleted} run record(s) for project '{}' and module '{module}'",
            request.project.as_deref().unwrap_or_default()
        ),
        (None, None) => println!(
            "Deleted {deleted} run record(s) for project '{}'",
            request.project.as_deref().unwrap_or_default()
        ),
    }
    Ok(())
}

/// Cancel every running grid task recorded in the run's batch ledger, then
/// mark those rows failed.
async fn cancel_grid_batches(script_path: &str) -> Result<()> {
    let ledger = Ledger::open(&PathBuf::from(format!("{script_path}.db"))).await?;
    let running = ledger.running_with_task_ids().await?;
    for (batch, task_id) in running {
        let status = Command::new("qdel")
            .arg(&task_id)
            .status()
            .await
            .context("failed to run qdel")?;
        if status.success() {
            println!("Cancelled grid job {task_id} (batch {batch})");
        } else {
            warn!(%task_id, batch, "qdel reported failure");
        }
        ledger.fail_batch(batch).await?;
    }
    Ok(())
}

/// Mark every running batch of a local run failed.
async fn fail_running_batches(script_path: &str) -> Result<()> {
    let ledger = Ledger::open(&PathBuf::from(format!("{script_path}.db"))).await?;
    let changed = ledger.mark_running_failed().await?;
    if changed > 0 {
        println!("Marked {changed} running batch(es) as Failed");
    }
    Ok(())
}

/// True when a process with this pid exists (signal 0 probe).
pub fn process_exists(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn send_signal(pid: i32, signal: i32) {
    unsafe {
        let _ = libc::kill(pid, signal);
    }
}

/// Kill a process and its descendants: children first (recursively, at most
/// 10 levels), parent last, SIGTERM then SIGKILL each.
pub async fn kill_process_tree(pid: i32) -> Result<()> {
    kill_children(pid, 10).await;

    send_signal(pid, libc::SIGTERM);
    tokio::time::sleep(Duration::from_millis(200)).await;
    if process_exists(pid) {
        send_signal(pid, libc::SIGKILL);
    }
    Ok(())
}

async fn kill_children(pid: i32, depth: u32) {
    if depth == 0 {
        return;
    }
    let output = Command::new("pgrep")
        .arg("-P")
        .arg(pid.to_string())
        .output()
        .await;
    let output = match output {
        Ok(output) => output,
        Err(_) => return,
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let child = match line.trim().parse::<i32>() {
            Ok(child) => child,
            Err(_) => continue,
        };
        Box::pin(kill_children(child, depth - 1)).await;
        send_signal(child, libc::SIGTERM);
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_signal(child, libc::SIGKILL);
    }
}

/// Kill a run on another host over ssh, with the same signal sequence plus a
/// direct update of the remote batch ledger. Relies on the invoking user's
/// key material; host key checking is disabled the way cluster-internal
/// tooling expects.
async fn remote_delete(host: &str, row: &RunRow) -> Result<()> {
    let mut snippet = String::new();

    if let Some(pid) = row.pid.filter(|&p| p > 0) {
        snippet.push_str(&format!(
            "if kill -0 {pid} 2>/dev/null; then\n\
             \tpkill -P {pid} 2>/dev/null || true\n\
             \tkill -TERM {pid} 2>/dev/null || true\n\
             \tsleep 0.2\n\
             \tkill -KILL {pid} 2>/dev/null || true\n\
             \techo \"terminated process {pid} and its children\"\n\
             fi\n"
        ));
    }

    let db_path = format!("{}.db", row.script_path);
    let escaped = db_path.replace('\'', "'\"'\"'");
    snippet.push_str(&format!(
        "if [ -f '{escaped}' ]; then\n\
         \tnow=$(date '+%Y-%m-%d %H:%M:%S')\n\
         \tsqlite3 '{escaped}' \"UPDATE batches SET state='Failed', end_time='$now', \
         exit_code=1 WHERE state='Running'\" 2>/dev/null || true\n\
         \techo \"updated remote batch ledger\"\n\
         fi\n"
    ));

    let status = Command::new("ssh")
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg(host)
        .arg(snippet)
        .status()
        .await
        .with_context(|| format!("failed to run ssh to {host}"))?;
    if !status.success() {
        // Individual kill steps may legitimately fail (process already gone);
        // only report, do not abort the rest of the delete.
        warn!(%host, code = status.code(), "remote delete exited non-zero");
    }
    Ok(())
}
