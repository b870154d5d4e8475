//! Single-consumer write serializer for the batch ledger.
//!
//! Backend completions race each other and the monitor; funnelling every
//! mutation through one queue keeps SQLite down to a single writer while the
//! busy timeout absorbs the rest. The serializer task must outlive all
//! workers: drop every [`WriteHandle`] first, then await
//! [`WriteSerializer::drain`], and only then cancel the monitor.

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::error;

use crate::ledger::{Backend, Ledger};

/// A ledger mutation routed through the serializer.
#[derive(Debug)]
pub enum WriteOp {
    ClaimRunning {
        batch: i64,
        backend: Backend,
        cpu: i64,
        mem: f64,
        h_vmem: f64,
    },
    SetTaskId {
        batch: i64,
        task_id: String,
    },
    SetHost {
        batch: i64,
        host: String,
    },
    Finished {
        batch: i64,
        exit_code: i64,
        host: Option<String>,
    },
    Failed {
        batch: i64,
        exit_code: i64,
        retry: i64,
        mem: Option<f64>,
        h_vmem: Option<f64>,
        host: Option<String>,
    },
}

type Envelope = (WriteOp, oneshot::Sender<Result<()>>);

/// Cloneable submission side of the serializer.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<Envelope>,
}

impl WriteHandle {
    /// Apply one mutation and wait for it to be durable.
    pub async fn apply(&self, op: WriteOp) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((op, ack_tx))
            .await
            .map_err(|_| anyhow!("write serializer is gone"))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("write serializer dropped the acknowledgement"))?
    }
}

/// The consumer task owning all ledger writes.
pub struct WriteSerializer {
    handle: JoinHandle<()>,
}

impl WriteSerializer {
    pub fn start(ledger: Ledger) -> (Self, WriteHandle) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(256);
        let handle = tokio::spawn(async move {
            while let Some((op, ack)) = rx.recv().await {
                let result = apply_op(&ledger, op).await;
                if let Err(err) = &result {
                    error!(%err, "ledger write failed");
                }
                let _ = ack.send(result);
            }
        });
        (Self { handle }, WriteHandle { tx })
    }

    /// Wait for the queue to empty and the task to exit. Every
    /// [`WriteHandle`] must have been dropped already, otherwise this waits
    /// forever.
    pub async fn drain(self) -> Result<()> {
        self.handle
            .await
            .map_err(|err| anyhow!("write serializer panicked: {err}"))
    }
}

async fn apply_op(ledger: &Ledger, op: WriteOp) -> Result<()> {
    match op {
        WriteOp::ClaimRunning {
            batch,
            backend,
            cpu,
            mem,
            h_vmem,
        } => ledger.claim_running(batch, backend, cpu, mem, h_vmem).await,
        WriteOp::SetTaskId { batch, task_id } => ledger.set_task_id(batch, &task_id).await,
        WriteOp::SetHost { batch, host } => ledger.set_host(batch, &host).await,
        WriteOp::Finished {
            batch,
            exit_code,
            host,
        } => ledger.record_finished(batch, exit_code, host.as_deref()).await,
        WriteOp::Failed {
            batch,
            exit_code,
            retry,
            mem,
            h_vmem,
            host,
        } => {
            ledger
                .record_failed(batch, exit_code, retry, mem, h_vmem, host.as_deref())
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn serializes_interleaved_writers() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::open(&dir.path().join("batches.db")).await.unwrap();
        for n in 1..=8 {
            let script = dir.path().join(format!("job_{n:04}.sh")).display().to_string();
            ledger.register_batch(n, &script, Backend::Local).await.unwrap();
        }

        let (serializer, handle) = WriteSerializer::start(ledger.clone());
        let mut tasks = Vec::new();
        for n in 1..=8i64 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .apply(WriteOp::ClaimRunning {
                        batch: n,
                        backend: Backend::Local,
                        cpu: 1,
                        mem: 1.0,
                        h_vmem: 1.0,
                    })
                    .await
                    .unwrap();
                handle
                    .apply(WriteOp::Finished {
                        batch: n,
                        exit_code: 0,
                        host: None,
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        drop(handle);
        serializer.drain().await.unwrap();

        let counts = ledger.count_by_state().await.unwrap();
        assert_eq!(counts.finished, 8);
        assert_eq!(counts.running, 0);
    }
}
