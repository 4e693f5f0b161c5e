// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowstate-core integration tests.
//!
//! Provides a file-backed SQLite store that several independent pools can
//! open at once, standing in for executor processes sharing one database.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tempfile::TempDir;
use uuid::Uuid;

use flowstate_core::model::{InstanceStatus, StateVariables};
use flowstate_core::persistence::{
    InstanceInsert, Persistence, PostgresPersistence, SqlitePersistence,
};

pub const GROUP: &str = "test";

/// SQLite database in a temporary directory.
pub struct TestStore {
    dir: TempDir,
    pub persistence: Arc<SqlitePersistence>,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let persistence = Arc::new(
            SqlitePersistence::from_path(dir.path().join("flowstate.db"))
                .await
                .expect("Failed to open test database"),
        );
        Self { dir, persistence }
    }

    /// A separate connection pool on the same database, like another process.
    pub async fn connect_again(&self) -> Arc<SqlitePersistence> {
        let url = format!("sqlite:{}", self.dir.path().join("flowstate.db").display());
        Arc::new(
            SqlitePersistence::connect(&url, 4)
                .await
                .expect("Failed to open second connection pool"),
        )
    }
}

/// Connect to the PostgreSQL test database, if configured.
pub async fn pg_persistence() -> Option<Arc<PostgresPersistence>> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    flowstate_core::migrations::POSTGRES.run(&pool).await.ok()?;
    Some(Arc::new(PostgresPersistence::new(pool)))
}

/// Insert a ready instance of `workflow_type` in `state`.
pub async fn insert_ready(
    persistence: &dyn Persistence,
    workflow_type: &str,
    state: &str,
) -> i64 {
    insert_ready_in(persistence, GROUP, workflow_type, state).await
}

pub async fn insert_ready_in(
    persistence: &dyn Persistence,
    executor_group: &str,
    workflow_type: &str,
    state: &str,
) -> i64 {
    let now = Utc::now();
    persistence
        .insert_instance(
            &InstanceInsert {
                workflow_type: workflow_type.to_string(),
                external_id: Uuid::new_v4().to_string(),
                business_key: None,
                executor_group: executor_group.to_string(),
                state: state.to_string(),
                status: InstanceStatus::Created,
                next_activation: Some(now),
                state_variables: StateVariables::new(),
                parent_workflow_id: None,
                parent_action_id: None,
                root_workflow_id: None,
            },
            now,
        )
        .await
        .expect("Failed to insert instance")
}

/// Claim exactly `instance_id` for `executor_id`.
pub async fn claim(persistence: &dyn Persistence, instance_id: i64, executor_id: i32) {
    let claimed = persistence
        .claim_batch(100, GROUP, executor_id, Utc::now())
        .await
        .expect("Failed to claim");
    assert_eq!(claimed, vec![instance_id], "expected to claim only {}", instance_id);
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}
