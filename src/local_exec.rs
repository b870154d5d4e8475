//! Local process backend.
//!
//! Runs a batch script as `sh <script>` on this host, with stdout and stderr
//! appended to `<script>.o` and `<script>.e`. The child's process id is
//! recorded as the batch task id so `delete` can reach it later.

use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ledger::{Backend, Ledger};
use crate::writer::{WriteHandle, WriteOp};

/// Execute one batch locally and record its terminal state.
///
/// Backend failures become row state; only ledger errors propagate.
pub async fn run_local_batch(ledger: &Ledger, writes: &WriteHandle, batch: i64) -> Result<()> {
    let row = ledger.row(batch).await?;
    let retry = row.retry;

    writes
        .apply(WriteOp::ClaimRunning {
            batch,
            backend: Backend::Local,
            cpu: row.cpu,
            mem: row.mem,
            h_vmem: row.h_vmem,
        })
        .await?;

    let mut child = match spawn_batch(&row.script_path) {
        Ok(child) => child,
        Err(err) => {
            warn!(batch, %err, "failed to start batch script");
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
    if let Some(pid) = child.id() {
        writes
            .apply(WriteOp::SetTaskId {
                batch,
                task_id: pid.to_string(),
            })
            .await?;
    }

    let status = child.wait().await;
    let exit_code = match status {
        Ok(status) => exit_code_of(status),
        Err(err) => {
            warn!(batch, %err, "failed to wait on batch script");
            1
        }
    };

    debug!(batch, exit_code, "local batch finished");
    if exit_code == 0 {
        writes
            .apply(WriteOp::Finished {
                batch,
                exit_code: 0,
                host: None,
            })
            .await?;
    } else {
        writes
            .apply(WriteOp::Failed {
                batch,
                exit_code,
                retry: retry + 1,
                mem: None,
                h_vmem: None,
                host: None,
            })
            .await?;
    }
    Ok(())
}

fn spawn_batch(script_path: &str) -> Result<tokio::process::Child> {
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(format!("{script_path}.o"))
        .with_context(|| format!("failed to open {script_path}.o"))?;
    let stderr = OpenOptions::new()
        .create(true)
        .append(true)
        .open(format!("{script_path}.e"))
        .with_context(|| format!("failed to open {script_path}.e"))?;

    let child = Command::new("sh")
        .arg(script_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .with_context(|| format!("failed to spawn sh {script_path}"))?;
    Ok(child)
}

/// Map a platform wait status to a ledger exit code: the exit status when the
/// child exited, 128 + signal when it was killed, 1 otherwise.
fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    if let Some(signal) = status.signal() {
        return 128 + signal as i64;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::WriteSerializer;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    async fn fixture(dir: &TempDir, body: &str) -> (Ledger, String) {
        let script = dir.path().join("job_0001.sh");
        fs::write(&script, body).unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        let ledger = Ledger::open(&dir.path().join("batches.db")).await.unwrap();
        let script = script.display().to_string();
        ledger.register_batch(1, &script, Backend::Local).await.unwrap();
        (ledger, script)
    }

    #[tokio::test]
    async fn successful_batch_records_finished_and_captures_output() {
        let dir = TempDir::new().unwrap();
        let (ledger, script) = fixture(&dir, "#!/bin/bash\necho hello\n").await;
        let (serializer, writes) = WriteSerializer::start(ledger.clone());

        run_local_batch(&ledger, &writes, 1).await.unwrap();
        drop(writes);
        serializer.drain().await.unwrap();

        let row = ledger.row(1).await.unwrap();
        assert_eq!(row.state, "Finished");
        assert_eq!(row.exit_code, Some(0));
        assert!(row.task_id.is_some());
        let stdout = fs::read_to_string(format!("{script}.o")).unwrap();
        assert!(stdout.contains("hello"));
    }

    #[tokio::test]
    async fn failing_batch_records_exit_code_and_bumps_retry() {
        let dir = TempDir::new().unwrap();
        let (ledger, _script) = fixture(&dir, "#!/bin/bash\nexit 7\n").await;
        let (serializer, writes) = WriteSerializer::start(ledger.clone());

        run_local_batch(&ledger, &writes, 1).await.unwrap();
        drop(writes);
        serializer.drain().await.unwrap();

        let row = ledger.row(1).await.unwrap();
        assert_eq!(row.state, "Failed");
        assert_eq!(row.exit_code, Some(7));
        assert_eq!(row.retry, 1);
    }

    #[test]
    fn signal_death_maps_above_128() {
        let status = std::process::ExitStatus::from_raw(9); // killed by SIGKILL
        assert_eq!(exit_code_of(status), 128 + 9);
    }
}
