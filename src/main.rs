//! Belay CLI.
//!
//! Verbs: `local` (default when the first argument is a flag), `qsubsge`,
//! `stat`, `delete`.
//!
//! Usage:
//!   belay -i commands.sh -l 2 -p 8
//!   belay qsubsge -i commands.sh --cpu 4 --mem 8G --queue all.q
//!   belay stat -p myproject
//!   belay delete -p myproject -m commands

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use belay::config::{local_hostname, Config};
use belay::grid::PeMode;
use belay::ledger::Backend;
use belay::memstr::parse_memory_gb;
use belay::runner::{run_tasks, RunOptions};
use belay::stat::run_stat;
use belay::terminate::{run_delete, DeleteRequest};

#[derive(Parser, Debug)]
#[command(
    name = "belay",
    version,
    about = "Parallel shell-batch task runner with local and SGE backends"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run batches locally (the default verb when a flag leads)
    Local(CommonArgs),
    /// Submit batches to an SGE-compatible grid engine
    Qsubsge(QsubSgeArgs),
    /// Tabulate run progress from the global ledger
    Stat(StatArgs),
    /// Delete run records, terminating running work first
    Delete(DeleteArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Input shell command file, one command per line
    #[arg(short = 'i', long)]
    infile: PathBuf,

    /// Number of lines grouped into one batch
    #[arg(short = 'l', long)]
    line: Option<usize>,

    /// Max batches running concurrently
    #[arg(short = 'p', long)]
    thread: Option<usize>,

    /// Project name for the global ledger
    #[arg(long)]
    project: Option<String>,
}

#[derive(Args, Debug)]
struct QsubSgeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// CPU slots per batch
    #[arg(long)]
    cpu: Option<i64>,

    /// Memory request per batch (`-l vf=`); accepts 4, 4G, 500M
    #[arg(long)]
    mem: Option<String>,

    /// Hard virtual memory limit per batch (`-l h_vmem=`)
    #[arg(long)]
    h_vmem: Option<String>,

    /// Queue name(s), comma-separated
    #[arg(long)]
    queue: Option<String>,

    /// SGE project for resource quota accounting
    #[arg(short = 'P', long)]
    sge_project: Option<String>,

    /// CPU request style: pe_smp (-pe smp N) or num_proc (-l p=N)
    #[arg(long, default_value = "pe_smp")]
    mode: String,
}

#[derive(Args, Debug)]
struct StatArgs {
    /// Only show runs of this project (changes the table layout)
    #[arg(short = 'p', long)]
    project: Option<String>,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    /// Project name (required unless --id is given)
    #[arg(short = 'p', long)]
    project: Option<String>,

    /// Module (input file base name without extension)
    #[arg(short = 'm', long)]
    module: Option<String>,

    /// Run id from `stat -p` output
    #[arg(short = 'k', long)]
    id: Option<i64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match dispatch().await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            1
        }
    };
    std::process::exit(code);
}

/// Argument vector with `local` inserted when the invocation leads with a
/// flag (`belay -i file` is shorthand for `belay local -i file`).
fn argv_with_default_verb() -> Vec<String> {
    let mut args: Vec<String> = std::env::args().collect();
    if let Some(first) = args.get(1) {
        if first.starts_with('-') && first != "-h" && first != "--help" && first != "--version" {
            args.insert(1, "local".to_string());
        }
    }
    args
}

async fn dispatch() -> Result<i32> {
    let argv = argv_with_default_verb();
    let command_line = argv.join(" ");
    let cli = Cli::parse_from(&argv);
    let config = Config::load()?;

    match cli.command {
        Command::Local(args) => {
            let opts = RunOptions {
                infile: args.infile.clone(),
                line: args.line.unwrap_or(config.defaults.line),
                threads: args.thread.unwrap_or(config.defaults.thread),
                project: args.project.clone().unwrap_or_else(|| config.project.clone()),
                backend: Backend::Local,
                cpu: config.defaults.cpu,
                mem: 0.0,
                h_vmem: 0.0,
                user_set_mem: false,
                user_set_hvmem: false,
                queue: String::new(),
                sge_project: String::new(),
                pe_mode: PeMode::PeSmp,
                command_line,
            };
            run_tasks(&config, opts).await
        }
        Command::Qsubsge(args) => {
            let host = local_hostname();
            if !config.node_allowed(&host) {
                bail!(
                    "host {host} is not in the configured submission node list {:?}",
                    config.node
                );
            }

            let user_set_mem = args.mem.is_some();
            let user_set_hvmem = args.h_vmem.is_some();
            let mem = match &args.mem {
                Some(s) => parse_memory_gb(s).context("invalid --mem value")?,
                None => 0.0,
            };
            let h_vmem = match &args.h_vmem {
                Some(s) => parse_memory_gb(s).context("invalid --h_vmem value")?,
                None => 0.0,
            };
            let pe_mode: PeMode = args.mode.parse()?;

            let opts = RunOptions {
                infile: args.common.infile.clone(),
                line: args.common.line.unwrap_or(config.defaults.line),
                threads: args.common.thread.unwrap_or(config.defaults.thread),
                project: args
                    .common
                    .project
                    .clone()
                    .unwrap_or_else(|| config.project.clone()),
                backend: Backend::QsubSge,
                cpu: args.cpu.unwrap_or(config.defaults.cpu),
                mem,
                h_vmem,
                user_set_mem,
                user_set_hvmem,
                queue: args.queue.clone().unwrap_or_else(|| config.queue.clone()),
                sge_project: args
                    .sge_project
                    .clone()
                    .unwrap_or_else(|| config.sge_project.clone()),
                pe_mode,
                command_line,
            };
            run_tasks(&config, opts).await
        }
        Command::Stat(args) => {
            run_stat(&config, args.project.as_deref()).await?;
            Ok(0)
        }
        Command::Delete(args) => {
            if args.id.is_none() && args.project.is_none() {
                bail!("-p/--project is required when -k/--id is not given");
            }
            let request = DeleteRequest {
                project: args.project,
                module: args.module,
                run_id: args.id,
            };
            run_delete(&config, &request).await?;
            Ok(0)
        }
    }
}
