// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the signal store: idempotent send, at-most-once
//! consumption under concurrency.

mod common;

use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use wipline_core::Signal;
use wipline_core::persistence::{MemoryStore, SignalStore};

#[tokio::test]
async fn test_send_load_consume_lifecycle() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();

    let signal = Signal::remote_exit(task, "web-1", 99, 0, "done");
    store.send(&signal).await.unwrap();

    let active = store.load_all_active(task).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].signal_id, signal.signal_id);

    let now = chrono::Utc::now();
    assert!(store.consume(&signal.signal_id, now).await.unwrap());
    assert!(store.load_all_active(task).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_consuming_consumed_signal_is_noop() {
    // Idempotence: the second consume neither errors nor re-consumes.
    let store = MemoryStore::new();
    let task = Uuid::new_v4();
    let signal = Signal::terminate(task, "stop");
    store.send(&signal).await.unwrap();

    let now = chrono::Utc::now();
    assert!(store.consume(&signal.signal_id, now).await.unwrap());
    assert!(!store.consume(&signal.signal_id, now).await.unwrap());
    assert!(!store.consume(&signal.signal_id, now).await.unwrap());
}

#[tokio::test]
async fn test_resend_is_idempotent() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();
    let signal = Signal::remote_exit(task, "web-1", 99, 0, "done");

    // A reporter retrying its delivery sends the identical signal twice.
    store.send(&signal).await.unwrap();
    store.send(&signal).await.unwrap();
    assert_eq!(store.load_all_active(task).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resend_never_resurrects_consumed_signal() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();
    let signal = Signal::terminate(task, "stop");

    store.send(&signal).await.unwrap();
    store.consume(&signal.signal_id, chrono::Utc::now()).await.unwrap();

    store.send(&signal).await.unwrap();
    assert!(store.load_all_active(task).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_consumers_exactly_one_wins() {
    let store = Arc::new(MemoryStore::new());
    let task = Uuid::new_v4();
    let signal = Signal::remote_exit(task, "web-1", 7, 0, "done");
    store.send(&signal).await.unwrap();

    let consumers: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            let id = signal.signal_id.clone();
            tokio::spawn(async move { store.consume(&id, chrono::Utc::now()).await.unwrap() })
        })
        .collect();

    let wins = join_all(consumers)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(wins, 1, "exactly one consumer may flip consumed_time");
}

#[tokio::test]
async fn test_prune_consumed_signals() {
    let store = MemoryStore::new();
    let task = Uuid::new_v4();

    let consumed = Signal::custom(task, "old-one", serde_json::json!({"n": 1}));
    store.send(&consumed).await.unwrap();
    store
        .consume(
            &consumed.signal_id,
            chrono::Utc::now() - chrono::Duration::days(7),
        )
        .await
        .unwrap();

    let active = Signal::custom(task, "live-one", serde_json::json!({"n": 2}));
    store.send(&active).await.unwrap();

    let horizon = chrono::Utc::now() - chrono::Duration::days(1);
    assert_eq!(store.prune_consumed_before(horizon).await.unwrap(), 1);
    // The active signal survives.
    assert_eq!(store.load_all_active(task).await.unwrap().len(), 1);
}
