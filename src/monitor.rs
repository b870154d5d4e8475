//! Per-run status monitor.
//!
//! One task per run with two independent timers: a fast one appending
//! human-readable state changes to `<input>.log`, and a slow one upserting
//! aggregate counts into the global ledger. Read or write glitches are
//! warnings; the run never stops because of the monitor.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;

use crate::global::{GlobalLedger, RunKey};
use crate::ledger::{BatchRow, Ledger};
use crate::memstr::format_time_short;

const LOG_TICK: Duration = Duration::from_secs(2);

/// Everything the monitor needs to observe one run.
pub struct MonitorContext {
    pub ledger: Ledger,
    pub global: GlobalLedger,
    pub key: RunKey,
    pub backend: String,
    pub script_path: String,
    pub host: String,
    pub pid: i64,
    pub max_retries: i64,
    pub log_path: PathBuf,
    /// Full command line, echoed at the top of each invocation's log stanza.
    pub command_line: String,
    pub global_interval: Duration,
}

/// Fields whose change makes a row worth re-printing.
type ChangeKey = (String, i64, Option<String>, Option<String>);

pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Open the log file, write the command stanza, and start the monitor.
    pub fn spawn(ctx: MonitorContext) -> Result<Self> {
        let existed = ctx.log_path.exists();
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&ctx.log_path)
            .with_context(|| format!("failed to open log file {}", ctx.log_path.display()))?;

        if !ctx.command_line.is_empty() {
            if existed {
                let _ = writeln!(log);
            }
            let _ = writeln!(log, "{}\n", ctx.command_line);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = MonitorTask {
            ctx,
            log: Arc::new(Mutex::new(log)),
            last: HashMap::new(),
            header_printed: false,
            shutdown_rx,
        };
        let handle = tokio::spawn(task.run());
        Ok(Self {
            shutdown_tx,
            handle,
        })
    }

    /// Stop the monitor and wait for it to finish its current tick.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.handle
            .await
            .map_err(|err| anyhow!("monitor task panicked: {err}"))
    }
}

struct MonitorTask {
    ctx: MonitorContext,
    log: Arc<Mutex<File>>,
    last: HashMap<i64, ChangeKey>,
    header_printed: bool,
    shutdown_rx: watch::Receiver<bool>,
}

impl MonitorTask {
    async fn run(mut self) {
        let mut log_ticker = interval(LOG_TICK);
        log_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut global_ticker = interval(self.ctx.global_interval.max(Duration::from_secs(1)));
        global_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Both intervals fire immediately on first tick, which gives the
        // required initial log and global updates.
        loop {
            tokio::select! {
                _ = log_ticker.tick() => {
                    if let Err(err) = self.update_log().await {
                        warn!(%err, "monitor log update failed");
                    }
                }
                _ = global_ticker.tick() => {
                    if let Err(err) = self.update_global().await {
                        warn!(%err, "global ledger update failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn update_log(&mut self) -> Result<()> {
        let round = self.ctx.ledger.max_retry().await? + 1;
        let rows = self.ctx.ledger.snapshot_rows().await?;

        if !self.header_printed {
            let mut log = self.log.lock().expect("log file lock poisoned");
            let _ = writeln!(
                log,
                "{:<6} {:<6} {:<10} {:<10} {:<8} {:<12}",
                "try", "task", "status", "taskid", "exitcode", "time"
            );
            self.header_printed = true;
        }

        let mut current: HashMap<i64, ChangeKey> = HashMap::with_capacity(rows.len());
        for row in &rows {
            let key = (
                row.state.clone(),
                row.retry,
                row.task_id.clone(),
                row.end_time.clone(),
            );
            current.insert(row.batch_num, key.clone());

            if row.state == "Pending" {
                continue;
            }
            let changed = match self.last.get(&row.batch_num) {
                None => true,
                Some(last) => *last != key,
            };
            if changed {
                self.print_row(row, round);
            }
        }
        self.last = current;
        Ok(())
    }

    fn print_row(&self, row: &BatchRow, round: i64) {
        let time = row
            .end_time
            .as_deref()
            .or(row.start_time.as_deref())
            .map(format_time_short)
            .unwrap_or_else(|| "-".to_string());
        let exit_code = row
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let task_id = row.task_id.clone().unwrap_or_else(|| "-".to_string());

        let mut log = self.log.lock().expect("log file lock poisoned");
        let _ = writeln!(
            log,
            "{:<6} {:<6} {:<10} {:<10} {:<8} {:<12}",
            format!("{}:{}", round, self.ctx.max_retries),
            format!("{:04}", row.batch_num),
            row.state,
            task_id,
            exit_code,
            time
        );
    }

    async fn update_global(&self) -> Result<()> {
        let counts = self.ctx.ledger.count_by_state().await?;
        self.ctx
            .global
            .upsert_run(
                &self.ctx.key,
                &counts,
                &self.ctx.backend,
                &self.ctx.script_path,
                &self.ctx.host,
                self.ctx.pid,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Backend;
    use tempfile::TempDir;

    #[tokio::test]
    async fn logs_changes_once_and_skips_pending() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&dir.path().join("work.db")).await.unwrap();
        for n in 1..=3 {
            let script = dir.path().join(format!("work_{n:04}.sh")).display().to_string();
            ledger.register_batch(n, &script, Backend::Local).await.unwrap();
        }
        ledger.claim_running(1, Backend::Local, 1, 1.0, 1.0).await.unwrap();
        ledger.record_finished(1, 0, None).await.unwrap();

        let global = GlobalLedger::open(&dir.path().join("global.db")).await.unwrap();
        let key = RunKey {
            user: "alice".to_string(),
            project: "proj".to_string(),
            module: "work".to_string(),
            start_time: "2025-03-07 09:00:00".to_string(),
        };
        let log_path = dir.path().join("work.sh.log");
        let monitor = MonitorHandle::spawn(MonitorContext {
            ledger: ledger.clone(),
            global: global.clone(),
            key: key.clone(),
            backend: "local".to_string(),
            script_path: "/tmp/work.sh".to_string(),
            host: "host-1".to_string(),
            pid: 4242,
            max_retries: 3,
            log_path: log_path.clone(),
            command_line: "belay local -i work.sh".to_string(),
            global_interval: Duration::from_millis(50),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        monitor.shutdown().await.unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.starts_with("belay local -i work.sh\n"));
        assert_eq!(log.matches("try    task   status").count(), 1);
        assert_eq!(log.matches("Finished").count(), 1);
        assert!(!log.contains("Pending"));

        // The slow timer upserted the aggregate row.
        let rows = global.runs_for_user("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].finished, 1);
        assert_eq!(rows[0].pending, 2);
        assert_eq!(rows[0].pid, Some(4242));
    }
}
