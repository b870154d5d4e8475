//! SGE grid backend.
//!
//! Submission goes through a DRMAA-style session abstraction
//! ([`GridSession`]) so the poll loop and outcome interpretation stay
//! testable without a cluster. The production implementation ([`SgeCli`])
//! drives the engine through `qsub`/`qstat`/`qdel`/`qacct` with the
//! environment obtained by sourcing the engine's `settings.sh` once per
//! process.
//!
//! Outcome interpretation order for a finished job:
//! 1. sentinel file present -> success, exit 0
//! 2. engine stderr file mentions an OOM kill -> exit 137, escalate user-set
//!    memory knobs by 1.25x (rounded up) for the next attempt
//! 3. engine reports failure -> exit 1
//! 4. engine reports a normal exit -> that exit status
//! 5. otherwise -> exit 1

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{watch, OnceCell};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::ledger::{sentinel_path, Backend, Ledger};
use crate::memstr::format_memory_gb;
use crate::writer::{WriteHandle, WriteOp};

/// How the CPU request is expressed in the native specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeMode {
    /// `-pe smp <cpu>`
    PeSmp,
    /// `p=<cpu>` inside the `-l` resource list
    NumProc,
}

impl FromStr for PeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pe_smp" => Ok(PeMode::PeSmp),
            "num_proc" => Ok(PeMode::NumProc),
            other => Err(anyhow!(
                "invalid parallel environment mode: {other} (expected pe_smp or num_proc)"
            )),
        }
    }
}

impl fmt::Display for PeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeMode::PeSmp => f.write_str("pe_smp"),
            PeMode::NumProc => f.write_str("num_proc"),
        }
    }
}

/// Engine-visible state of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridJobState {
    Queued,
    Running,
    Done,
    Failed,
    Unknown,
}

/// One submission request.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Absolute path of the batch script.
    pub script: PathBuf,
    /// Job name; the engine derives its output file names from this.
    pub name: String,
    /// Space-joined native specification.
    pub native_spec: String,
}

/// Post-mortem information for a finished job.
#[derive(Debug, Clone, Default)]
pub struct WaitInfo {
    pub exec_host: Option<String>,
    pub exit_status: Option<i64>,
    pub exited: bool,
}

/// DRMAA-style session surface.
#[async_trait]
pub trait GridSession: Send + Sync {
    async fn run_job(&self, request: &JobRequest) -> Result<String>;
    async fn job_state(&self, job_id: &str) -> Result<GridJobState>;
    async fn wait_info(&self, job_id: &str) -> Result<WaitInfo>;
    /// Execution host of a still-running job, when the engine knows it.
    async fn exec_host(&self, job_id: &str) -> Result<Option<String>>;
    async fn delete_job(&self, job_id: &str) -> Result<()>;
    /// Release engine resources. Called exactly once at program exit.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Resource request shaping one submission round.
#[derive(Debug, Clone)]
pub struct GridSubmitOptions {
    pub cpu: i64,
    pub mem: f64,
    pub h_vmem: f64,
    pub user_set_mem: bool,
    pub user_set_hvmem: bool,
    pub queue: String,
    pub sge_project: String,
    pub pe_mode: PeMode,
    /// Comma-separated host filter for `-l h=`; empty or "none" disables it.
    pub host_filter: String,
    /// Poll cadence; 5 s in production, shortened in tests.
    pub poll_interval: Duration,
}

impl Default for GridSubmitOptions {
    fn default() -> Self {
        Self {
            cpu: 1,
            mem: 0.0,
            h_vmem: 0.0,
            user_set_mem: false,
            user_set_hvmem: false,
            queue: String::new(),
            sge_project: String::new(),
            pe_mode: PeMode::PeSmp,
            host_filter: String::new(),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Assemble the engine's native specification string.
///
/// Shape: `[-pe smp N] -cwd -b n [-l vf=..,h_vmem=..,p=..,h=..] [-q ..] [-P ..]`
pub fn build_native_spec(opts: &GridSubmitOptions, mem: f64, h_vmem: f64) -> String {
    let mut resources: Vec<String> = Vec::new();
    if opts.user_set_mem {
        resources.push(format!("vf={}", format_memory_gb(mem)));
    }
    if opts.user_set_hvmem {
        resources.push(format!("h_vmem={}", format_memory_gb(h_vmem)));
    }
    let host_filter = opts.host_filter.trim();
    if !host_filter.is_empty() && !host_filter.eq_ignore_ascii_case("none") {
        resources.push(format!("h={host_filter}"));
    }

    let mut parts: Vec<String> = Vec::new();
    match opts.pe_mode {
        PeMode::PeSmp => parts.push(format!("-pe smp {}", opts.cpu)),
        PeMode::NumProc => resources.push(format!("p={}", opts.cpu)),
    }
    parts.push("-cwd".to_string());
    parts.push("-b n".to_string());
    if !resources.is_empty() {
        parts.push(format!("-l {}", resources.join(",")));
    }

    let queue = opts.queue.trim().trim_end_matches(',').trim();
    if !queue.is_empty() {
        parts.push(format!("-q {queue}"));
    }
    if !opts.sge_project.is_empty() {
        parts.push(format!("-P {}", opts.sge_project));
    }

    parts.join(" ")
}

/// Memory escalation applied after an OOM kill.
pub fn escalate_memory_gb(gb: f64) -> f64 {
    (gb * 1.25).ceil()
}

const OOM_MARKERS: &[&str] = &["killed", "memory", "h_vmem", "out of memory", "oom"];

/// True when engine stderr output looks like a memory kill.
pub fn stderr_indicates_oom(text: &str) -> bool {
    let lower = text.to_lowercase();
    OOM_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Engine stderr file for a job, trying the dotted layout first
/// (`name.e.<id>`), then the undotted one some engine versions produce.
fn engine_stderr_path(script: &Path, job_id: &str) -> Option<PathBuf> {
    let dir = script.parent()?;
    let name = script.file_name()?.to_string_lossy();
    let dotted = dir.join(format!("{name}.e.{job_id}"));
    if dotted.exists() {
        return Some(dotted);
    }
    let undotted = dir.join(format!("{name}.e{job_id}"));
    if undotted.exists() {
        return Some(undotted);
    }
    None
}

/// Process-wide session handle, created on first use.
static GRID_SESSION: OnceCell<Arc<dyn GridSession>> = OnceCell::const_new();

/// Get (creating on first call) the shared grid session.
pub async fn global_session(settings: &Path) -> Result<Arc<dyn GridSession>> {
    let session = GRID_SESSION
        .get_or_try_init(|| async {
            let cli = SgeCli::bootstrap(settings).await?;
            Ok::<_, anyhow::Error>(Arc::new(cli) as Arc<dyn GridSession>)
        })
        .await?;
    Ok(session.clone())
}

/// Close the shared session if it was ever created.
pub async fn close_global_session() {
    if let Some(session) = GRID_SESSION.get() {
        if let Err(err) = session.close().await {
            warn!(%err, "failed to close grid session");
        }
    }
}

/// CLI-backed session implementation.
pub struct SgeCli {
    env: HashMap<String, String>,
}

impl SgeCli {
    /// Source the engine's `settings.sh` and capture the resulting
    /// environment for every subsequent engine command. Fails when the file
    /// is unusable or leaves `SGE_ROOT` unset.
    pub async fn bootstrap(settings: &Path) -> Result<Self> {
        if !settings.exists() {
            bail!(
                "grid engine settings file not found: {} (set `settings` in belay.yaml)",
                settings.display()
            );
        }
        let output = Command::new("sh")
            .arg("-c")
            .arg(format!(". {} >/dev/null 2>&1; env", settings.display()))
            .output()
            .await
            .context("failed to source grid engine settings")?;
        if !output.status.success() {
            bail!("sourcing {} failed", settings.display());
        }

        let mut env = HashMap::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some((key, value)) = line.split_once('=') {
                env.insert(key.to_string(), value.to_string());
            }
        }
        if !env.contains_key("SGE_ROOT") {
            bail!(
                "SGE_ROOT not set after sourcing {}",
                settings.display()
            );
        }
        info!(settings = %settings.display(), "grid engine environment loaded");
        Ok(Self { env })
    }

    fn engine_command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.envs(&self.env);
        cmd
    }
}

#[async_trait]
impl GridSession for SgeCli {
    async fn run_job(&self, request: &JobRequest) -> Result<String> {
        let mut cmd = self.engine_command("qsub");
        cmd.arg("-terse").arg("-N").arg(&request.name);
        cmd.args(request.native_spec.split_whitespace());
        cmd.arg(&request.script);

        let output = cmd.output().await.context("failed to run qsub")?;
        if !output.status.success() {
            bail!(
                "qsub rejected the job: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .lines()
            .filter_map(|l| {
                let l = l.trim();
                // -terse prints the bare id; array jobs append `.first-last:step`.
                let id: String = l.chars().take_while(|c| c.is_ascii_digit()).collect();
                (!id.is_empty()).then_some(id)
            })
            .next()
            .ok_or_else(|| anyhow!("qsub produced no job id: {stdout}"))?;
        Ok(job_id)
    }

    async fn job_state(&self, job_id: &str) -> Result<GridJobState> {
        let output = self
            .engine_command("qstat")
            .output()
            .await
            .context("failed to run qstat")?;
        if !output.status.success() {
            bail!(
                "qstat failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut fields = line.split_whitespace();
            if fields.next() != Some(job_id) {
                continue;
            }
            // job-ID prior name user state ...
            let state = fields.nth(3).unwrap_or("");
            if state.contains('E') {
                return Ok(GridJobState::Failed);
            }
            if state.contains('r') || state.contains('t') {
                return Ok(GridJobState::Running);
            }
            if state.contains('q') || state.contains('w') || state.contains('h') {
                return Ok(GridJobState::Queued);
            }
            return Ok(GridJobState::Unknown);
        }
        // Not listed any more: the engine is done with it.
        Ok(GridJobState::Done)
    }

    async fn wait_info(&self, job_id: &str) -> Result<WaitInfo> {
        let output = self
            .engine_command("qacct")
            .arg("-j")
            .arg(job_id)
            .output()
            .await
            .context("failed to run qacct")?;
        if !output.status.success() {
            // Accounting records can lag; treat as unknown rather than failing.
            return Ok(WaitInfo::default());
        }
        let mut info = WaitInfo::default();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("hostname") => {
                    info.exec_host = fields.next().map(|s| s.to_string());
                }
                Some("exit_status") => {
                    if let Some(code) = fields.next().and_then(|s| s.parse::<i64>().ok()) {
                        info.exit_status = Some(code);
                        info.exited = true;
                    }
                }
                _ => {}
            }
        }
        Ok(info)
    }

    async fn exec_host(&self, job_id: &str) -> Result<Option<String>> {
        let output = self
            .engine_command("qstat")
            .arg("-j")
            .arg(job_id)
            .output()
            .await
            .context("failed to run qstat -j")?;
        if !output.status.success() {
            return Ok(None);
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.starts_with("exec_host") {
                // exec_host   node1/1
                if let Some(value) = line.split_whitespace().last() {
                    let host = value.split('/').next().unwrap_or(value);
                    return Ok(Some(host.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let output = self
            .engine_command("qdel")
            .arg(job_id)
            .output()
            .await
            .context("failed to run qdel")?;
        if !output.status.success() {
            bail!(
                "qdel {job_id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Submit one batch to the grid and watch it to a terminal state.
///
/// Submission failures become row state (exit 1, retry incremented); only
/// ledger errors propagate. On cancellation the poll loop exits without
/// touching the job: the next invocation's sentinel reconciliation will pick
/// up whatever it did.
pub async fn run_grid_batch(
    ledger: &Ledger,
    writes: &WriteHandle,
    session: Arc<dyn GridSession>,
    batch: i64,
    opts: &GridSubmitOptions,
    mut cancel: watch::Receiver<bool>,
) -> Result<()> {
    let row = ledger.row(batch).await?;
    let retry = row.retry;

    // A retry reuses the stored request, which a previous OOM may have
    // escalated. Only knobs the user set participate.
    let mut mem = opts.mem;
    let mut h_vmem = opts.h_vmem;
    if retry > 0 {
        if opts.user_set_mem && row.mem > 0.0 {
            mem = row.mem;
        }
        if opts.user_set_hvmem && row.h_vmem > 0.0 {
            h_vmem = row.h_vmem;
        }
    }

    writes
        .apply(WriteOp::ClaimRunning {
            batch,
            backend: Backend::QsubSge,
            cpu: opts.cpu,
            mem,
            h_vmem,
        })
        .await?;

    let script = PathBuf::from(&row.script_path);
    let name = script
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| row.script_path.clone());
    let request = JobRequest {
        script: script.clone(),
        name,
        native_spec: build_native_spec(opts, mem, h_vmem),
    };

    let job_id = match session.run_job(&request).await {
        Ok(id) => id,
        Err(err) => {
            warn!(batch, %err, native_spec = %request.native_spec, "grid submission failed");
            writes
                .apply(WriteOp::Failed {
                    batch,
                    exit_code: 1,
                    retry: retry + 1,
                    mem: None,
                    h_vmem: None,
                    host: None,
                })
                .await?;
            return Ok(());
        }
    };

    writes
        .apply(WriteOp::SetTaskId {
            batch,
            task_id: job_id.clone(),
        })
        .await?;
    debug!(batch, job_id = %job_id, "grid job submitted");

    let mut host_recorded = false;
    loop {
        if *cancel.borrow() {
            info!(
                batch,
                job_id = %job_id,
                "cancelled while polling; job stays on the cluster"
            );
            return Ok(());
        }
        sleep(opts.poll_interval).await;
        if cancel.has_changed().unwrap_or(false) && *cancel.borrow_and_update() {
            info!(
                batch,
                job_id = %job_id,
                "cancelled while polling; job stays on the cluster"
            );
            return Ok(());
        }

        let state = match session.job_state(&job_id).await {
            Ok(state) => state,
            Err(err) => {
                warn!(batch, job_id = %job_id, %err, "job state query failed");
                GridJobState::Done
            }
        };

        match state {
            GridJobState::Running => {
                if !host_recorded {
                    if let Ok(Some(host)) = session.exec_host(&job_id).await {
                        writes
                            .apply(WriteOp::SetHost {
                                batch,
                                host: host.clone(),
                            })
                            .await?;
                        host_recorded = true;
                    }
                }
            }
            GridJobState::Done | GridJobState::Failed => {
                return finish_grid_batch(
                    writes,
                    session.as_ref(),
                    batch,
                    &job_id,
                    &script,
                    state,
                    retry,
                    mem,
                    h_vmem,
                    opts,
                )
                .await;
            }
            GridJobState::Queued | GridJobState::Unknown => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_grid_batch(
    writes: &WriteHandle,
    session: &dyn GridSession,
    batch: i64,
    job_id: &str,
    script: &Path,
    state: GridJobState,
    retry: i64,
    mem: f64,
    h_vmem: f64,
    opts: &GridSubmitOptions,
) -> Result<()> {
    let wait = session.wait_info(job_id).await.unwrap_or_default();
    let exec_host = match wait.exec_host.clone() {
        Some(host) => Some(host),
        None => session.exec_host(job_id).await.unwrap_or(None),
    };

    let mut is_oom = false;
    if let Some(err_file) = engine_stderr_path(script, job_id) {
        if let Ok(text) = std::fs::read_to_string(&err_file) {
            if stderr_indicates_oom(&text) {
                is_oom = true;
            }
        }
    }

    // The sentinel outranks everything, including an OOM-looking stderr.
    let script_str = script.display().to_string();
    let exit_code: i64 = if sentinel_path(&script_str).exists() {
        0
    } else if is_oom {
        137
    } else if state == GridJobState::Failed {
        1
    } else if wait.exited {
        wait.exit_status.unwrap_or(1)
    } else {
        1
    };

    if exit_code == 0 {
        writes
            .apply(WriteOp::Finished {
                batch,
                exit_code: 0,
                host: exec_host,
            })
            .await?;
        return Ok(());
    }

    let mut new_mem = None;
    let mut new_hvmem = None;
    if is_oom {
        if opts.user_set_mem {
            new_mem = Some(escalate_memory_gb(mem));
        }
        if opts.user_set_hvmem {
            new_hvmem = Some(escalate_memory_gb(h_vmem));
        }
        if new_mem.is_none() && new_hvmem.is_none() {
            warn!(
                batch,
                job_id,
                "job looks memory-killed but no --mem/--h_vmem was given, nothing to escalate"
            );
        }
    }

    writes
        .apply(WriteOp::Failed {
            batch,
            exit_code,
            retry: retry + 1,
            mem: new_mem,
            h_vmem: new_hvmem,
            host: exec_host,
        })
        .await?;
    Ok(())
}
