// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the state machine executor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedAction, Step, build_executor};

use wipline_core::executor::{ExecutorConfig, RunOutcome};
use wipline_core::persistence::{MemoryStore, SignalStore};
use wipline_core::{ExitStatus, Signal, Task, TaskStatus};

fn store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test]
async fn test_transcript_literal_round_trip() {
    let store = store();
    let executor = build_executor(
        "start {\n'value' finish\n}",
        vec![("start", ScriptedAction::of(&["value"]))],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::Ok
        }
    );
    assert_eq!(
        task.context.transcript().render(),
        "start => 'value' => finish"
    );
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(task.finished_at.is_some());
}

#[tokio::test]
async fn test_simulation_script_groups_per_state() {
    let store = store();
    let src = "start {\n* build\n}\nbuild:run_build {\nretry build\nok deploy\n! failure\n}\ndeploy:run_deploy {\nok finish\n! failure\n}";
    let executor = build_executor(
        src,
        vec![
            ("run_build", ScriptedAction::of(&["retry", "ok"])),
            ("run_deploy", ScriptedAction::of(&["ok"])),
        ],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    executor.run(&mut task).await.unwrap();

    let script = task.context.transcript().simulation_script();
    assert_eq!(
        script,
        vec![
            ("start".to_string(), vec!["*".to_string()]),
            (
                "build".to_string(),
                vec!["retry".to_string(), "ok".to_string()]
            ),
            ("deploy".to_string(), vec!["ok".to_string()]),
        ]
    );
}

#[tokio::test]
async fn test_max_retry_boundary() {
    // Edge build -> build on 'fail' with max=3: three consecutive fails stay
    // on the declared path, the fourth takes '!' instead.
    let store = store();
    let src = "start {\n* build\n}\nbuild {\nfail build max=3\nok finish\n! failure\n}";
    let executor = build_executor(
        src,
        vec![("build", ScriptedAction::of(&["fail", "fail", "fail", "fail"]))],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::ErrorSystem
        }
    );
    let entries = task.context.transcript().entries();
    // start, three declared fail loops, then the overridden '!' edge.
    let fail_loops = entries
        .iter()
        .filter(|e| e.from == "build" && e.symbol == "fail" && e.to == "build")
        .count();
    assert_eq!(fail_loops, 3);
    assert_eq!(entries.last().unwrap().symbol, "!");
    assert_eq!(entries.last().unwrap().to, "failure");
}

#[tokio::test]
async fn test_counter_resets_on_different_symbol() {
    // fail, fail, ok, fail, fail, fail, ok: no run of 'fail' exceeds max=3.
    let store = store();
    let src = "start {\n* build\n}\nbuild {\nfail build max=3\nok check\n! failure\n}\ncheck {\nfail build\nok finish\n}";
    let executor = build_executor(
        src,
        vec![
            (
                "build",
                ScriptedAction::of(&["fail", "fail", "ok", "fail", "fail", "fail", "ok"]),
            ),
            ("check", ScriptedAction::of(&["fail", "ok"])),
        ],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::Ok
        }
    );
}

#[tokio::test]
async fn test_action_error_takes_error_edge_with_user_exit() {
    let store = store();
    let executor = build_executor(
        "start {\nok finish\n! failure\n}",
        vec![(
            "start",
            ScriptedAction::new(vec![Step::UserError("bad manifest: missing version")]),
        )],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::ErrorUser
        }
    );
    // Short operator-facing message, verbose details.
    assert_eq!(
        task.exit_message.as_deref(),
        Some("bad manifest: missing version")
    );
    assert!(task.exit_details.as_deref().unwrap().contains("start"));
}

#[tokio::test]
async fn test_unmatched_symbol_is_system_failure() {
    let store = store();
    let executor = build_executor(
        "start {\nok finish\n}",
        vec![("start", ScriptedAction::of(&["surprise"]))],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();

    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::ErrorSystem
        }
    );
    assert_eq!(task.state, "failure");
    assert!(
        task.exit_details
            .as_deref()
            .unwrap()
            .contains("no transition for symbol 'surprise'")
    );
}

#[tokio::test]
async fn test_wait_transition_suspends() {
    let store = store();
    let src = "start {\nlaunched poll wait=30 exec=false\n! failure\n}\npoll {\nremote_ok finish\nremote_fail failure\n}";
    let executor = build_executor(
        src,
        vec![
            ("start", ScriptedAction::of(&["launched"])),
            ("poll", ScriptedAction::of(&[])),
        ],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let before = chrono::Utc::now();
    let outcome = executor.run(&mut task).await.unwrap();

    let RunOutcome::Suspended { until } = outcome else {
        panic!("expected suspension, got {:?}", outcome);
    };
    assert!(until >= before + chrono::Duration::seconds(29));
    assert_eq!(task.status, TaskStatus::Waiting);
    assert_eq!(task.state, "poll");
    assert_eq!(task.wake_timestamp, Some(until));
}

#[tokio::test]
async fn test_passive_recheck_resumes_on_remote_exit_signal() {
    let store = store();
    let src = "start {\nlaunched poll wait=30 exec=false\n! failure\n}\npoll {\nremote_ok finish\nremote_fail failure\n}";
    let executor = build_executor(
        src,
        vec![
            ("start", ScriptedAction::of(&["launched"])),
            ("poll", ScriptedAction::of(&[])),
        ],
        store.clone(),
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    executor.run(&mut task).await.unwrap();
    assert_eq!(task.state, "poll");

    // Passive re-check with nothing arrived: stays suspended, action never
    // invoked (the scripted action would error on invoke).
    let outcome = executor.run(&mut task).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));

    // A remote completion arrives out of band.
    store
        .send(&Signal::remote_exit(
            task.task_id,
            "build-7",
            4242,
            0,
            "artifact uploaded",
        ))
        .await
        .unwrap();

    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::Ok
        }
    );
    let entries = task.context.transcript().entries();
    assert_eq!(entries.last().unwrap().symbol, "remote_ok");
}

#[tokio::test]
async fn test_failed_remote_exit_takes_failure_path() {
    let store = store();
    let src = "start {\nlaunched poll wait=10 exec=false\n! failure\n}\npoll {\nremote_ok finish\nremote_fail failure\n}";
    let executor = build_executor(
        src,
        vec![
            ("start", ScriptedAction::of(&["launched"])),
            ("poll", ScriptedAction::of(&[])),
        ],
        store.clone(),
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    executor.run(&mut task).await.unwrap();

    store
        .send(&Signal::remote_exit(task.task_id, "build-7", 4242, 2, "boom"))
        .await
        .unwrap();

    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::ErrorSystem
        }
    );
}

#[tokio::test]
async fn test_terminate_signal_routes_to_terminal() {
    let store = store();
    let src = "start {\nlaunched poll wait=30 exec=false\n! failure\n}\npoll {\nremote_ok finish\n}";
    let executor = build_executor(
        src,
        vec![
            ("start", ScriptedAction::of(&["launched"])),
            ("poll", ScriptedAction::of(&[])),
        ],
        store.clone(),
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    executor.run(&mut task).await.unwrap();

    store
        .send(&Signal::terminate(task.task_id, "operator stop"))
        .await
        .unwrap();

    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::Terminated
        }
    );
    assert_eq!(task.state, "terminate");
    assert_eq!(
        task.exit_message.as_deref(),
        Some("terminated: operator stop")
    );

    // The termination request was consumed exactly once.
    assert!(store.load_all_active(task.task_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_no_progress_watchdog_forces_failure_edge() {
    let store = store();
    let src = "start {\nlaunched poll wait=1 exec=false\n! failure\n}\npoll {\nremote_ok finish\nno_progress_fail failure\n}";
    let config = ExecutorConfig {
        no_progress_timeout: Some(Duration::from_millis(0)),
        ..ExecutorConfig::default()
    };
    let executor = build_executor(
        src,
        vec![
            ("start", ScriptedAction::of(&["launched"])),
            ("poll", ScriptedAction::of(&[])),
        ],
        store,
        config,
    );

    let mut task = Task::new("demo");
    executor.run(&mut task).await.unwrap();
    assert_eq!(task.state, "poll");

    // No signal ever arrives; the next tick takes the no_progress_fail edge.
    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::ErrorSystem
        }
    );
    let entries = task.context.transcript().entries();
    assert_eq!(entries.last().unwrap().symbol, "no_progress_fail");
    assert_eq!(entries.last().unwrap().to, "failure");
}

#[tokio::test]
async fn test_custom_terminal_completes_ok() {
    let store = store();
    let executor = build_executor(
        "start {\nok parked\n* finish\n}\nparked {}",
        vec![("start", ScriptedAction::of(&["ok"]))],
        store,
        ExecutorConfig::default(),
    );

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::Ok
        }
    );
    assert_eq!(task.state, "parked");
}

#[tokio::test]
async fn test_tick_budget_cuts_off_runaway_table() {
    // A cycle with no wait anywhere gets cut off as a system failure
    // instead of spinning forever.
    let store = store();
    let src = "start {\n* spin\n}\nspin {\n* start\n}";
    let config = ExecutorConfig {
        max_ticks_per_run: 25,
        ..ExecutorConfig::default()
    };
    let executor = build_executor(src, vec![], store, config);

    let mut task = Task::new("demo");
    let outcome = executor.run(&mut task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            exit: ExitStatus::ErrorSystem
        }
    );
}
