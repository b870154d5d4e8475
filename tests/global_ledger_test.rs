//! Global-ledger behavior across process boundaries: concurrent upserts and
//! deletion of non-running runs.

use tempfile::TempDir;

use belay::config::{current_user, local_hostname, Config};
use belay::global::{GlobalLedger, RunKey};
use belay::ledger::StateCounts;
use belay::terminate::{run_delete, DeleteRequest};

fn counts_finished(total: i64) -> StateCounts {
    StateCounts {
        total,
        finished: total,
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_monitors_for_distinct_runs_never_collide() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("global.db");

    let mut handles = Vec::new();
    for run in 0..4 {
        let ledger = GlobalLedger::open(&path).await.unwrap();
        handles.push(tokio::spawn(async move {
            let key = RunKey {
                user: "alice".to_string(),
                project: "proj".to_string(),
                module: format!("module-{run}"),
                start_time: format!("2025-03-07 09:0{run}:00"),
            };
            for tick in 0..25i64 {
                let counts = StateCounts {
                    total: 25,
                    finished: tick,
                    pending: 25 - tick,
                    ..Default::default()
                };
                ledger
                    .upsert_run(&key, &counts, "local", "/tmp/m.sh", "host-1", 7)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let ledger = GlobalLedger::open(&path).await.unwrap();
    let rows = ledger.runs_for_project("alice", "proj").await.unwrap();
    assert_eq!(rows.len(), 4, "exactly one row per run tuple");
    for row in rows {
        assert_eq!(row.finished, 24);
    }
}

#[tokio::test]
async fn delete_of_completed_run_only_drops_the_global_row() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        db: dir.path().join("global.db"),
        ..Config::default()
    };

    let global = GlobalLedger::open(&config.db).await.unwrap();
    let key = RunKey {
        user: current_user(),
        project: "cleanup".to_string(),
        module: "done".to_string(),
        start_time: "2025-03-07 09:00:00".to_string(),
    };
    global
        .upsert_run(
            &key,
            &counts_finished(2),
            "local",
            &dir.path().join("done.sh").display().to_string(),
            &local_hostname(),
            0,
        )
        .await
        .unwrap();
    let rows = global.runs_for_project(&key.user, "cleanup").await.unwrap();
    assert_eq!(rows[0].status.as_deref(), Some("completed"));

    run_delete(
        &config,
        &DeleteRequest {
            project: Some("cleanup".to_string()),
            module: None,
            run_id: None,
        },
    )
    .await
    .unwrap();

    let rows = global.runs_for_project(&key.user, "cleanup").await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn delete_by_run_id_does_not_need_a_project() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        db: dir.path().join("global.db"),
        ..Config::default()
    };

    let global = GlobalLedger::open(&config.db).await.unwrap();
    let key = RunKey {
        user: current_user(),
        project: "byid".to_string(),
        module: "done".to_string(),
        start_time: "2025-03-07 09:00:00".to_string(),
    };
    global
        .upsert_run(&key, &counts_finished(1), "local", "/tmp/done.sh", "h", 0)
        .await
        .unwrap();
    let id = global.runs_for_project(&key.user, "byid").await.unwrap()[0].id;

    run_delete(
        &config,
        &DeleteRequest {
            project: None,
            module: None,
            run_id: Some(id),
        },
    )
    .await
    .unwrap();

    assert!(global
        .runs_for_project(&key.user, "byid")
        .await
        .unwrap()
        .is_empty());
}
