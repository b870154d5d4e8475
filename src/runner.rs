//! Run driver.
//!
//! Owns the lifecycle of one invocation: ledger setup, batch generation,
//! sentinel reconciliation, bounded-concurrency dispatch, the grid retry
//! loop, and the strict shutdown order (drain writes, stop the monitor, then
//! finalize the global row).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::batch::generate_batches;
use crate::config::{current_user, local_hostname, Config};
use crate::global::{GlobalLedger, RunKey, RunStatus};
use crate::grid::{self, GridSession, GridSubmitOptions, PeMode};
use crate::ledger::{Backend, Ledger};
use crate::local_exec::run_local_batch;
use crate::memstr::ledger_now;
use crate::monitor::{MonitorContext, MonitorHandle};
use crate::writer::{WriteHandle, WriteSerializer};

/// Everything one invocation needs, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub infile: PathBuf,
    pub line: usize,
    pub threads: usize,
    pub project: String,
    pub backend: Backend,
    pub cpu: i64,
    pub mem: f64,
    pub h_vmem: f64,
    pub user_set_mem: bool,
    pub user_set_hvmem: bool,
    pub queue: String,
    pub sge_project: String,
    pub pe_mode: PeMode,
    /// Full command line, echoed into the run log.
    pub command_line: String,
}

/// Execute a run to completion and return the process exit code: 0 when every
/// batch finished, 1 when failures remain.
pub async fn run_tasks(config: &Config, opts: RunOptions) -> Result<i32> {
    let global = GlobalLedger::open(&config.db).await?;

    let infile = opts
        .infile
        .canonicalize()
        .with_context(|| format!("input file not found: {}", opts.infile.display()))?;
    let ledger = Ledger::open(&PathBuf::from(format!("{}.db", infile.display()))).await?;

    let plan = generate_batches(&ledger, &infile, opts.line, opts.backend).await?;
    info!(
        total = plan.total,
        module = %plan.module,
        backend = %opts.backend,
        "batches ready"
    );

    // On-disk sentinels are the authoritative success record; bring the
    // ledger into agreement before selecting work.
    if let Err(err) = ledger.reconcile_from_sentinels().await {
        warn!(%err, "sentinel reconciliation failed");
    }
    let mut need_to_run = ledger.unfinished_indices().await?;
    info!(count = need_to_run.len(), "batches to run");

    let start_time = ledger_now();
    let key = RunKey {
        user: current_user(),
        project: opts.project.clone(),
        module: plan.module.clone(),
        start_time,
    };
    let host = local_hostname();
    let pid = std::process::id() as i64;

    let monitor = MonitorHandle::spawn(MonitorContext {
        ledger: ledger.clone(),
        global: global.clone(),
        key: key.clone(),
        backend: opts.backend.as_str().to_string(),
        script_path: infile.display().to_string(),
        host: host.clone(),
        pid,
        max_retries: config.retry.max as i64,
        log_path: PathBuf::from(format!("{}.log", infile.display())),
        command_line: opts.command_line.clone(),
        global_interval: Duration::from_secs(config.monitor_update_interval.max(1)),
    })?;

    let (serializer, writes) = WriteSerializer::start(ledger.clone());

    // Root cancellation: Ctrl-C stops the grid poll loops and the retry
    // driver, but never the pool join. In-flight local children finish;
    // in-flight grid jobs stay on the cluster for the next invocation's
    // reconciliation to find.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight work settle");
            let _ = cancel_tx.send(true);
        }
    });

    // Grid submissions run with the script directory as the working
    // directory so `-cwd` drops the engine output files next to the scripts.
    let mut restore_dir = None;
    let session = if opts.backend == Backend::QsubSge {
        let session = grid::global_session(&config.settings).await?;
        let original = std::env::current_dir().context("failed to read working directory")?;
        std::env::set_current_dir(&plan.script_dir).with_context(|| {
            format!(
                "failed to enter script directory {}",
                plan.script_dir.display()
            )
        })?;
        restore_dir = Some(original);
        Some(session)
    } else {
        None
    };

    let grid_opts = GridSubmitOptions {
        cpu: opts.cpu,
        mem: opts.mem,
        h_vmem: opts.h_vmem,
        user_set_mem: opts.user_set_mem,
        user_set_hvmem: opts.user_set_hvmem,
        queue: opts.queue.clone(),
        sge_project: opts.sge_project.clone(),
        pe_mode: opts.pe_mode,
        host_filter: config.node.join(","),
        ..GridSubmitOptions::default()
    };

    let dispatch_result = match opts.backend {
        Backend::Local => {
            // Local failures are terminal for this invocation; a rerun
            // resumes only the unfinished batches.
            dispatch_round(
                &ledger,
                &writes,
                None,
                &need_to_run,
                opts.threads,
                &grid_opts,
                &cancel_rx,
            )
            .await
        }
        Backend::QsubSge => {
            let mut result = Ok(());
            for round in 0..config.retry.max {
                result = dispatch_round(
                    &ledger,
                    &writes,
                    session.clone(),
                    &need_to_run,
                    opts.threads,
                    &grid_opts,
                    &cancel_rx,
                )
                .await;
                if result.is_err() {
                    break;
                }
                need_to_run = ledger.unfinished_indices().await?;
                if need_to_run.is_empty() || *cancel_rx.borrow() {
                    break;
                }
                info!(
                    round = round + 1,
                    remaining = need_to_run.len(),
                    "retrying failed batches"
                );
                sleep(Duration::from_secs(2)).await;
            }
            result
        }
    };

    if let Some(dir) = restore_dir {
        if let Err(err) = std::env::set_current_dir(&dir) {
            warn!(%err, "failed to restore working directory");
        }
    }

    // Shutdown order matters: every writer is gone before the serializer is
    // drained, and the serializer is drained before the monitor stops.
    drop(writes);
    serializer.drain().await?;
    monitor.shutdown().await?;
    dispatch_result?;

    // Final global record with end-of-run counts and status.
    let counts = ledger.count_by_state().await?;
    global
        .upsert_run(
            &key,
            &counts,
            opts.backend.as_str(),
            &infile.display().to_string(),
            &host,
            pid,
        )
        .await?;
    global.set_end_time(&key, &ledger_now()).await?;

    let (successes, errors) = ledger.success_error_counts().await?;
    let status = if errors > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    global.set_status(&key, status).await?;

    if opts.backend == Backend::QsubSge {
        grid::close_global_session().await;
    }

    eprintln!("All works: {}", successes + errors);
    eprintln!("Successed: {successes}");
    eprintln!("Error: {errors}");
    if errors > 0 {
        eprintln!("Err Shells:");
        for (batch, script) in ledger.failed_scripts().await? {
            eprintln!("{batch}\t{script}");
        }
        return Ok(1);
    }
    Ok(0)
}

/// Run one bounded-concurrency pass over `indices` and wait for every
/// dispatched batch to reach a terminal state.
async fn dispatch_round(
    ledger: &Ledger,
    writes: &WriteHandle,
    session: Option<Arc<dyn GridSession>>,
    indices: &[i64],
    threads: usize,
    grid_opts: &GridSubmitOptions,
    cancel_rx: &watch::Receiver<bool>,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let mut join_set = JoinSet::new();

    for &batch in indices {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("worker semaphore closed"))?;
        let ledger = ledger.clone();
        let writes = writes.clone();
        let session = session.clone();
        let grid_opts = grid_opts.clone();
        let cancel_rx = cancel_rx.clone();

        join_set.spawn(async move {
            let _permit = permit;
            match session {
                Some(session) => {
                    grid::run_grid_batch(&ledger, &writes, session, batch, &grid_opts, cancel_rx)
                        .await
                }
                None => run_local_batch(&ledger, &writes, batch).await,
            }
        });
    }

    while let Some(result) = join_set.join_next().await {
        result.map_err(|err| anyhow!("worker task panicked: {err}"))??;
    }
    Ok(())
}
