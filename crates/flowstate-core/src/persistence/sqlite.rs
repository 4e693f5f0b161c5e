// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed instance store.
//!
//! SQLite has no row locks, so claiming selects candidates first and then
//! claims each one with a conditional update. An update that matches no row
//! means another executor won the race for that id; it is dropped from the
//! batch. Write transactions always start with their write statement.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use super::dialect::{Queries, QueryParam, SqliteDialect, list_instances_sql};
use super::{
    ActionRecord, ExecutorRegistration, ExternalUpdate, InstanceInsert, InstanceQuery,
    InstanceRecord, InstanceUpdate, NewAction, Persistence, RecoveredInstance, encode_variables,
    map_insert_error, retries_column,
};
use crate::error::{CoreError, Result};
use crate::model::{ActionType, StateVariables, WorkflowInstance, WorkflowInstanceAction};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    queries: Arc<Queries>,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            queries: Arc::new(Queries::new(&SqliteDialect)),
        }
    }

    /// Connect to `url` in WAL mode with a busy timeout and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self::new(pool))
    }

    /// Create and initialize a SQLite store at `path`, creating parent directories.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/flowstate.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Claim one candidate, failing with [`CoreError::ClaimRace`] if it was
    /// taken, parked or rescheduled since it was selected.
    async fn claim_one(
        &self,
        instance_id: i64,
        executor_group: &str,
        executor_id: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(&self.queries.claim_one)
            .bind(executor_id)
            .bind(now)
            .bind(instance_id)
            .bind(executor_group)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::ClaimRace { instance_id });
        }
        Ok(())
    }
}

async fn insert_instance_row(
    conn: &mut SqliteConnection,
    sql: &str,
    instance: &InstanceInsert,
    now: DateTime<Utc>,
) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(sql)
        .bind(&instance.workflow_type)
        .bind(&instance.external_id)
        .bind(instance.business_key.as_deref())
        .bind(instance.parent_workflow_id)
        .bind(instance.parent_action_id)
        .bind(instance.root_workflow_id)
        .bind(&instance.state)
        .bind(instance.status.as_str())
        .bind(instance.next_activation)
        .bind(&instance.executor_group)
        .bind(encode_variables(&instance.state_variables)?)
        .bind(now)
        .fetch_one(conn)
        .await
        .map_err(|e| map_insert_error(e, instance))
}

async fn insert_action_row(
    conn: &mut SqliteConnection,
    sql: &str,
    action: &NewAction,
) -> Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(sql)
        .bind(action.workflow_instance_id)
        .bind(action.executor_id)
        .bind(action.action_type.as_str())
        .bind(&action.state)
        .bind(action.state_text.as_deref())
        .bind(retries_column(action.retry_no))
        .bind(action.execution_start)
        .bind(action.execution_end)
        .bind(encode_variables(&action.updated_state_variables)?)
        .fetch_one(conn)
        .await?;
    Ok(id)
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_instance(&self, instance: &InstanceInsert, now: DateTime<Utc>) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_instance_row(&mut conn, &self.queries.insert_instance, instance, now).await
    }

    async fn get_instance(&self, instance_id: i64) -> Result<Option<WorkflowInstance>> {
        let record = sqlx::query_as::<_, InstanceRecord>(&self.queries.select_instance)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(WorkflowInstance::try_from).transpose()
    }

    async fn list_instances(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstance>> {
        let (sql, params) = list_instances_sql(&SqliteDialect, query);
        let mut sqlx_query = sqlx::query_as::<_, InstanceRecord>(&sql);
        for param in params {
            sqlx_query = match param {
                QueryParam::Text(value) => sqlx_query.bind(value),
                QueryParam::Int(value) => sqlx_query.bind(value),
            };
        }
        sqlx_query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WorkflowInstance::try_from)
            .collect()
    }

    async fn list_actions(&self, instance_id: i64) -> Result<Vec<WorkflowInstanceAction>> {
        sqlx::query_as::<_, ActionRecord>(&self.queries.select_actions)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WorkflowInstanceAction::try_from)
            .collect()
    }

    async fn claim_batch(
        &self,
        limit: u32,
        executor_group: &str,
        executor_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates: Vec<i64> = sqlx::query_scalar(&self.queries.claim_candidates)
            .bind(now)
            .bind(executor_group)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for instance_id in candidates {
            match self.claim_one(instance_id, executor_group, executor_id, now).await {
                Ok(()) => claimed.push(instance_id),
                Err(e) if e.is_ownership_conflict() => {
                    debug!(instance_id, executor_id, "Lost claim race, skipping instance");
                }
                // Instances claimed so far must still be processed.
                Err(e) if !claimed.is_empty() => {
                    warn!(instance_id, executor_id, error = %e, "Claim failed, returning partial batch");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(claimed)
    }

    async fn persist_execution(
        &self,
        update: &InstanceUpdate,
        action: &NewAction,
        children: &[InstanceInsert],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&self.queries.persist_update)
            .bind(&update.state)
            .bind(update.state_text.as_deref())
            .bind(update.status.as_str())
            .bind(retries_column(update.retries))
            .bind(update.next_activation)
            .bind(update.keep_claim.then_some(update.executor_id))
            .bind(encode_variables(&update.state_variables)?)
            .bind(update.started)
            .bind(update.modified)
            .bind(update.signal.is_some())
            .bind(update.signal.flatten())
            .bind(update.instance_id)
            .bind(update.executor_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::StaleOwnership {
                instance_id: update.instance_id,
                executor_id: update.executor_id,
            });
        }

        let action_id = insert_action_row(&mut tx, &self.queries.insert_action, action).await?;
        for child in children {
            let child = InstanceInsert {
                parent_action_id: Some(action_id),
                ..child.clone()
            };
            insert_instance_row(&mut tx, &self.queries.insert_instance, &child, update.modified)
                .await?;
        }

        tx.commit().await?;
        Ok(action_id)
    }

    async fn park_instance(
        &self,
        instance_id: i64,
        executor_id: i32,
        state_text: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(&self.queries.park_instance)
            .bind(state_text)
            .bind(now)
            .bind(instance_id)
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::StaleOwnership {
                instance_id,
                executor_id,
            });
        }
        Ok(())
    }

    async fn update_unclaimed(&self, update: &ExternalUpdate, action: &NewAction) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&self.queries.update_unclaimed)
            .bind(&update.state)
            .bind(update.state_text.as_deref())
            .bind(update.status.as_str())
            .bind(retries_column(update.retries))
            .bind(update.next_activation)
            .bind(encode_variables(&update.state_variables)?)
            .bind(update.modified)
            .bind(update.instance_id)
            .bind(update.expected_modified)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        insert_action_row(&mut tx, &self.queries.insert_action, action).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn request_activation(&self, instance_id: i64, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(&self.queries.request_activation)
            .bind(at)
            .bind(instance_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_signal(
        &self,
        instance_id: i64,
        signal: Option<i32>,
        expected_modified: DateTime<Utc>,
        action: &NewAction,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&self.queries.set_signal)
            .bind(signal)
            .bind(action.execution_end)
            .bind(instance_id)
            .bind(expected_modified)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        insert_action_row(&mut tx, &self.queries.insert_action, action).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn register_executor(&self, registration: &ExecutorRegistration) -> Result<i32> {
        let id = sqlx::query_scalar::<_, i32>(&self.queries.insert_executor)
            .bind(&registration.host)
            .bind(registration.pid)
            .bind(&registration.executor_group)
            .bind(registration.started)
            .bind(registration.expires)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn keepalive_executor(
        &self,
        executor_id: i32,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(&self.queries.keepalive_executor)
            .bind(now)
            .bind(expires)
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stop_executor(&self, executor_id: i32, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(&self.queries.stop_executor)
            .bind(now)
            .bind(executor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_executor_live(&self, executor_id: i32, now: DateTime<Utc>) -> Result<bool> {
        let row: Option<(DateTime<Utc>, Option<DateTime<Utc>>)> =
            sqlx::query_as(&self.queries.select_executor)
                .bind(executor_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(row, Some((expires, None)) if expires > now))
    }

    async fn recover_orphaned_instances(
        &self,
        executor_group: &str,
        recovering_executor: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveredInstance>> {
        let orphans: Vec<(i64, i32, String, i32)> = sqlx::query_as(&self.queries.select_orphans)
            .bind(executor_group)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        let mut recovered = Vec::with_capacity(orphans.len());
        for (instance_id, previous_executor_id, state, retries) in orphans {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(&self.queries.release_orphan)
                .bind(now)
                .bind(instance_id)
                .bind(previous_executor_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                continue;
            }
            let action = NewAction {
                workflow_instance_id: instance_id,
                executor_id: Some(recovering_executor),
                action_type: ActionType::Recovery,
                state,
                state_text: Some(format!(
                    "Recovered from dead executor {}",
                    previous_executor_id
                )),
                retry_no: u32::try_from(retries).unwrap_or(0),
                execution_start: now,
                execution_end: now,
                updated_state_variables: StateVariables::new(),
            };
            insert_action_row(&mut tx, &self.queries.insert_action, &action).await?;
            tx.commit().await?;
            recovered.push(RecoveredInstance {
                instance_id,
                previous_executor_id,
            });
        }
        Ok(recovered)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i32,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
