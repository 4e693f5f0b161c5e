// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrent claimers competing for the same ready instances.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use common::*;
use flowstate_core::model::InstanceStatus;
use flowstate_core::persistence::Persistence;

const INSTANCES: usize = 50;
const CLAIMERS: i32 = 8;

/// Claim in small batches until every instance is taken by someone.
async fn claim_until_drained(
    persistence: Arc<dyn Persistence>,
    executor_group: String,
    executor_id: i32,
    total: Arc<AtomicUsize>,
) -> Vec<i64> {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut mine = Vec::new();
    while total.load(Ordering::SeqCst) < INSTANCES && Instant::now() < deadline {
        match persistence
            .claim_batch(3, &executor_group, executor_id, Utc::now())
            .await
        {
            Ok(ids) => {
                total.fetch_add(ids.len(), Ordering::SeqCst);
                mine.extend(ids);
            }
            // Busy database; try again.
            Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
        }
        tokio::task::yield_now().await;
    }
    mine
}

async fn race(stores: Vec<Arc<dyn Persistence>>, executor_group: &str) -> Vec<(i32, Vec<i64>)> {
    let total = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = stores
        .into_iter()
        .zip(1..=CLAIMERS)
        .map(|(persistence, executor_id)| {
            let total = total.clone();
            let group = executor_group.to_string();
            tokio::spawn(async move {
                let claimed = claim_until_drained(persistence, group, executor_id, total).await;
                (executor_id, claimed)
            })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|result| result.expect("claimer panicked"))
        .collect()
}

fn assert_claimed_once(results: &[(i32, Vec<i64>)], inserted: &HashSet<i64>) {
    let mut seen = HashSet::new();
    for (executor_id, ids) in results {
        for id in ids {
            assert!(
                seen.insert(*id),
                "instance {} claimed twice (second time by executor {})",
                id,
                executor_id
            );
        }
    }
    assert_eq!(seen.len(), INSTANCES);
    assert_eq!(&seen, inserted);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_instances_are_claimed_exactly_once() {
    let store = TestStore::new().await;
    let mut inserted = HashSet::new();
    for _ in 0..INSTANCES {
        inserted.insert(insert_ready(store.persistence.as_ref(), "race", "start").await);
    }

    // One pool per claimer, as if each were its own executor process.
    let mut stores: Vec<Arc<dyn Persistence>> = Vec::new();
    for _ in 0..CLAIMERS {
        stores.push(store.connect_again().await);
    }
    let results = race(stores, GROUP).await;
    assert_claimed_once(&results, &inserted);

    for (executor_id, ids) in &results {
        for id in ids {
            let instance = store.persistence.get_instance(*id).await.unwrap().unwrap();
            assert_eq!(instance.executor_id, Some(*executor_id));
            assert_eq!(instance.status, InstanceStatus::Executing);
        }
    }

    let leftovers = store
        .persistence
        .claim_batch(100, GROUP, 99, Utc::now())
        .await
        .unwrap();
    assert!(leftovers.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_instances_are_claimed_exactly_once() {
    skip_if_no_db!();
    let Some(persistence) = pg_persistence().await else {
        eprintln!("Skipping test: could not connect to TEST_DATABASE_URL");
        return;
    };

    // Fresh group so leftovers from earlier runs do not interfere.
    let group = format!("race-{}", uuid::Uuid::new_v4());
    let mut inserted = HashSet::new();
    for _ in 0..INSTANCES {
        inserted.insert(insert_ready_in(persistence.as_ref(), &group, "race", "start").await);
    }

    let stores: Vec<Arc<dyn Persistence>> = (0..CLAIMERS)
        .map(|_| persistence.clone() as Arc<dyn Persistence>)
        .collect();
    let results = race(stores, &group).await;
    assert_claimed_once(&results, &inserted);
}
