//! Belay - a parallel shell-batch task runner.
//!
//! Belay splits a file of shell commands into batch scripts, runs the batches
//! under a bounded concurrency budget, and tracks per-batch state in a durable
//! SQLite ledger so interrupted runs can resume without repeating finished
//! work. The key components are:
//!
//! ## Execution
//!
//! - [`runner`]: run driver (worker pool, retry rounds, shutdown ordering)
//! - [`local_exec`]: local process backend
//! - [`grid`]: SGE grid backend behind a DRMAA-style session trait
//!
//! ## State
//!
//! - [`ledger`]: per-input batch ledger (`<input>.db`)
//! - [`global`]: shared cross-run ledger keyed by (user, project, module, start-time)
//! - [`writer`]: single-consumer write serializer for all ledger mutations
//!
//! ## Verbs
//!
//! - [`stat`]: tabulate run progress from the global ledger
//! - [`terminate`]: coordinated deletion of runs, including process-tree and
//!   grid-job teardown

pub mod batch;
pub mod config;
pub mod global;
pub mod grid;
pub mod ledger;
pub mod local_exec;
pub mod memstr;
pub mod monitor;
pub mod runner;
pub mod stat;
pub mod terminate;
pub mod writer;

// Configuration
pub use config::{current_user, local_hostname, Config};

// Ledgers
pub use global::{GlobalLedger, RunKey, RunRow, RunStatus};
pub use ledger::{Backend, BatchRow, BatchState, Ledger, StateCounts};
pub use writer::{WriteHandle, WriteOp, WriteSerializer};

// Batch generation
pub use batch::{generate_batches, BatchPlan};

// Execution
pub use grid::{GridJobState, GridSession, GridSubmitOptions, JobRequest, PeMode, SgeCli, WaitInfo};
pub use runner::{run_tasks, RunOptions};

// Monitoring
pub use monitor::MonitorHandle;
