//! End-to-end local-backend runs: basic success, failure handling, and
//! sentinel-driven resume.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use belay::config::Config;
use belay::grid::PeMode;
use belay::ledger::{Backend, Ledger};
use belay::runner::{run_tasks, RunOptions};

fn test_config(dir: &TempDir) -> Config {
    Config {
        db: dir.path().join("global").join("belay.db"),
        ..Config::default()
    }
}

fn local_opts(infile: &Path, threads: usize) -> RunOptions {
    RunOptions {
        infile: infile.to_path_buf(),
        line: 1,
        threads,
        project: "itest".to_string(),
        backend: Backend::Local,
        cpu: 1,
        mem: 0.0,
        h_vmem: 0.0,
        user_set_mem: false,
        user_set_hvmem: false,
        queue: String::new(),
        sge_project: String::new(),
        pe_mode: PeMode::PeSmp,
        command_line: "belay local -i test".to_string(),
    }
}

fn script_path(infile: &Path, module: &str, batch: u32) -> PathBuf {
    PathBuf::from(format!(
        "{}.shell/{module}_{batch:04}.sh",
        infile.canonicalize().unwrap().display()
    ))
}

#[tokio::test]
async fn three_echoes_all_finish() {
    let dir = TempDir::new().unwrap();
    let infile = dir.path().join("work.sh");
    fs::write(&infile, "echo a\necho b\necho c\n").unwrap();
    let config = test_config(&dir);

    let code = run_tasks(&config, local_opts(&infile, 2)).await.unwrap();
    assert_eq!(code, 0);

    for batch in 1..=3u32 {
        let script = script_path(&infile, "work", batch);
        assert!(script.exists(), "missing {}", script.display());
        assert!(
            PathBuf::from(format!("{}.sign", script.display())).exists(),
            "missing sentinel for batch {batch}"
        );
    }

    let ledger = Ledger::open(&PathBuf::from(format!(
        "{}.db",
        infile.canonicalize().unwrap().display()
    )))
    .await
    .unwrap();
    let counts = ledger.count_by_state().await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.finished, 3);

    // The run appended a status log.
    assert!(PathBuf::from(format!(
        "{}.log",
        infile.canonicalize().unwrap().display()
    ))
    .exists());

    let global = belay::global::GlobalLedger::open(&config.db).await.unwrap();
    let user = belay::config::current_user();
    let runs = global.runs_for_project(&user, "itest").await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status.as_deref(), Some("completed"));
    assert_eq!(runs[0].finished, 3);
    assert!(runs[0].end_time.is_some());
}

#[tokio::test]
async fn failing_batch_sets_exit_code_one() {
    let dir = TempDir::new().unwrap();
    let infile = dir.path().join("mixed.sh");
    fs::write(&infile, "exit 7\necho ok\n").unwrap();
    let config = test_config(&dir);

    let code = run_tasks(&config, local_opts(&infile, 1)).await.unwrap();
    assert_eq!(code, 1);

    let ledger = Ledger::open(&PathBuf::from(format!(
        "{}.db",
        infile.canonicalize().unwrap().display()
    )))
    .await
    .unwrap();
    let row = ledger.row(1).await.unwrap();
    assert_eq!(row.state, "Failed");
    assert_eq!(row.exit_code, Some(7));
    let row = ledger.row(2).await.unwrap();
    assert_eq!(row.state, "Finished");
    assert_eq!(row.exit_code, Some(0));

    let failed = ledger.failed_scripts().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, 1);

    let global = belay::global::GlobalLedger::open(&config.db).await.unwrap();
    let user = belay::config::current_user();
    let runs = global.runs_for_project(&user, "itest").await.unwrap();
    assert_eq!(runs[0].status.as_deref(), Some("failed"));
}

#[tokio::test]
async fn rerun_repeats_only_unfinished_batches() {
    let dir = TempDir::new().unwrap();
    let infile = dir.path().join("resume.sh");
    fs::write(&infile, "echo a\necho b\necho c\n").unwrap();
    let config = test_config(&dir);

    let code = run_tasks(&config, local_opts(&infile, 2)).await.unwrap();
    assert_eq!(code, 0);

    // Pretend batch 2 never finished: remove its sentinel and outputs.
    let script2 = script_path(&infile, "resume", 2);
    fs::remove_file(format!("{}.sign", script2.display())).unwrap();
    fs::remove_file(format!("{}.o", script2.display())).unwrap();
    fs::remove_file(format!("{}.e", script2.display())).unwrap();

    let code = run_tasks(&config, local_opts(&infile, 2)).await.unwrap();
    assert_eq!(code, 0);

    // Batch 2 ran again and produced fresh outputs.
    assert!(PathBuf::from(format!("{}.sign", script2.display())).exists());
    let out2 = fs::read_to_string(format!("{}.o", script2.display())).unwrap();
    assert_eq!(out2.lines().filter(|l| *l == "b").count(), 1);

    // Batch 1 was not re-executed: its append-only stdout saw one run.
    let script1 = script_path(&infile, "resume", 1);
    let out1 = fs::read_to_string(format!("{}.o", script1.display())).unwrap();
    assert_eq!(out1.lines().filter(|l| *l == "a").count(), 1);

    let ledger = Ledger::open(&PathBuf::from(format!(
        "{}.db",
        infile.canonicalize().unwrap().display()
    )))
    .await
    .unwrap();
    let counts = ledger.count_by_state().await.unwrap();
    assert_eq!(counts.finished, 3);
}
