// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for flowstate-core.
//!
//! The [`Persistence`] trait is the instance store protocol shared by every
//! executor process: claiming ready instances, persisting execution results
//! under an ownership check, external updates, and executor liveness. The
//! database is the only synchronization point between executors.
//!
//! SQL text is generated once per backend from a [`SqlDialect`], so both
//! backends run the same statements with dialect-specific placeholders,
//! row locking and timestamp merging.

pub mod dialect;
pub mod postgres;
pub mod sqlite;

pub use self::dialect::{PostgresDialect, SqlDialect, SqliteDialect};
pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::model::{
    ActionType, InstanceStatus, StateVariables, WorkflowInstance, WorkflowInstanceAction,
};

/// Instance row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InstanceRecord {
    pub id: i64,
    pub workflow_type: String,
    pub external_id: String,
    pub business_key: Option<String>,
    pub parent_workflow_id: Option<i64>,
    pub parent_action_id: Option<i64>,
    pub root_workflow_id: Option<i64>,
    pub state: String,
    pub state_text: Option<String>,
    /// One of created, inProgress, executing, manual, finished.
    pub status: String,
    pub retries: i32,
    pub next_activation: Option<DateTime<Utc>>,
    /// Activation requested while the instance was claimed, merged on persist.
    pub external_next_activation: Option<DateTime<Utc>>,
    pub executor_id: Option<i32>,
    pub executor_group: String,
    pub signal: Option<i32>,
    /// JSON object of string values.
    pub state_variables: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRecord> for WorkflowInstance {
    type Error = CoreError;

    fn try_from(record: InstanceRecord) -> Result<Self> {
        let status = record
            .status
            .parse::<InstanceStatus>()
            .map_err(|details| CoreError::DatabaseError {
                operation: "decode_instance".to_string(),
                details,
            })?;
        let state_variables = decode_variables(&record.state_variables)?;
        Ok(WorkflowInstance {
            id: record.id,
            external_id: record.external_id,
            business_key: record.business_key,
            parent_workflow_id: record.parent_workflow_id,
            parent_action_id: record.parent_action_id,
            root_workflow_id: record.root_workflow_id,
            workflow_type: record.workflow_type,
            state: record.state,
            state_text: record.state_text,
            status,
            retries: u32::try_from(record.retries).unwrap_or(0),
            next_activation: record.next_activation,
            executor_id: record.executor_id,
            executor_group: record.executor_group,
            signal: record.signal,
            original_state_variables: state_variables.clone(),
            state_variables,
            created: record.created,
            modified: record.modified,
            started: record.started,
        })
    }
}

/// Action row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActionRecord {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub executor_id: Option<i32>,
    pub action_type: String,
    pub state: String,
    pub state_text: Option<String>,
    pub retry_no: i32,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
    pub updated_state_variables: String,
}

impl TryFrom<ActionRecord> for WorkflowInstanceAction {
    type Error = CoreError;

    fn try_from(record: ActionRecord) -> Result<Self> {
        let action_type = record
            .action_type
            .parse::<ActionType>()
            .map_err(|details| CoreError::DatabaseError {
                operation: "decode_action".to_string(),
                details,
            })?;
        Ok(WorkflowInstanceAction {
            id: record.id,
            workflow_instance_id: record.workflow_instance_id,
            executor_id: record.executor_id,
            action_type,
            state: record.state,
            state_text: record.state_text,
            retry_no: u32::try_from(record.retry_no).unwrap_or(0),
            execution_start: record.execution_start,
            execution_end: record.execution_end,
            updated_state_variables: decode_variables(&record.updated_state_variables)?,
        })
    }
}

/// Fully resolved instance ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInsert {
    pub workflow_type: String,
    pub external_id: String,
    pub business_key: Option<String>,
    pub executor_group: String,
    pub state: String,
    pub status: InstanceStatus,
    pub next_activation: Option<DateTime<Utc>>,
    pub state_variables: StateVariables,
    pub parent_workflow_id: Option<i64>,
    /// Overwritten with the creating action's id for child workflows.
    pub parent_action_id: Option<i64>,
    pub root_workflow_id: Option<i64>,
}

/// Result of one execution attempt, written under the executor's claim.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub instance_id: i64,
    /// Executor that must still own the instance.
    pub executor_id: i32,
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    pub retries: u32,
    /// Merged with any external activation request, earliest wins.
    pub next_activation: Option<DateTime<Utc>>,
    /// Keep the claim because processing continues immediately.
    pub keep_claim: bool,
    pub state_variables: StateVariables,
    /// Written only when `Some`.
    pub signal: Option<Option<i32>>,
    pub modified: DateTime<Utc>,
    /// Recorded as `started` unless already set.
    pub started: DateTime<Utc>,
}

/// Compare-and-swap update of an unclaimed instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalUpdate {
    pub instance_id: i64,
    /// `modified` value the caller read; the update fails if it changed.
    pub expected_modified: DateTime<Utc>,
    pub state: String,
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    pub retries: u32,
    pub next_activation: Option<DateTime<Utc>>,
    pub state_variables: StateVariables,
    pub modified: DateTime<Utc>,
}

/// History record to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub workflow_instance_id: i64,
    pub executor_id: Option<i32>,
    pub action_type: ActionType,
    pub state: String,
    pub state_text: Option<String>,
    pub retry_no: u32,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
    pub updated_state_variables: StateVariables,
}

/// Filter for listing instances. Empty fields match everything.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceQuery {
    pub workflow_type: Option<String>,
    pub state: Option<String>,
    pub status: Option<InstanceStatus>,
    pub business_key: Option<String>,
    pub executor_group: Option<String>,
    pub parent_workflow_id: Option<i64>,
    pub limit: i64,
}

impl Default for InstanceQuery {
    fn default() -> Self {
        Self {
            workflow_type: None,
            state: None,
            status: None,
            business_key: None,
            executor_group: None,
            parent_workflow_id: None,
            limit: 100,
        }
    }
}

/// Executor row inserted on startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorRegistration {
    pub host: String,
    pub pid: i32,
    pub executor_group: String,
    pub started: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// Instance reset by orphan recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredInstance {
    pub instance_id: i64,
    /// The dead executor that held the claim.
    pub previous_executor_id: i32,
}

/// Instance store protocol used by the engine and the management API.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new instance and return its id.
    async fn insert_instance(&self, instance: &InstanceInsert, now: DateTime<Utc>) -> Result<i64>;

    async fn get_instance(&self, instance_id: i64) -> Result<Option<WorkflowInstance>>;

    async fn list_instances(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstance>>;

    /// History of an instance, oldest first.
    async fn list_actions(&self, instance_id: i64) -> Result<Vec<WorkflowInstanceAction>>;

    /// Claim up to `limit` ready instances of `executor_group` for `executor_id`.
    ///
    /// Ready means unclaimed, `created` or `inProgress`, with
    /// `next_activation <= now`. Claimed instances become `executing`. Oldest
    /// activation first. Ids lost to a concurrent executor are left out.
    async fn claim_batch(
        &self,
        limit: u32,
        executor_group: &str,
        executor_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>>;

    /// Write an execution result, its action and any child instances in one
    /// transaction and return the action id.
    ///
    /// Fails with [`CoreError::StaleOwnership`] and writes nothing if
    /// `update.executor_id` no longer owns the instance.
    async fn persist_execution(
        &self,
        update: &InstanceUpdate,
        action: &NewAction,
        children: &[InstanceInsert],
    ) -> Result<i64>;

    /// Release a claimed instance with no activation and an explanation.
    async fn park_instance(
        &self,
        instance_id: i64,
        executor_id: i32,
        state_text: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Apply `update` if the instance is unclaimed and unchanged since it was read.
    /// Returns false when the compare-and-swap fails.
    async fn update_unclaimed(&self, update: &ExternalUpdate, action: &NewAction) -> Result<bool>;

    /// Ask the claiming executor to activate the instance no later than `at`.
    /// Returns false if the instance is not claimed.
    async fn request_activation(&self, instance_id: i64, at: DateTime<Utc>) -> Result<bool>;

    /// Set the instance signal and record the change if the instance is
    /// unchanged since it was read as `expected_modified`.
    /// Returns false when the instance is missing or the compare-and-swap fails.
    async fn set_signal(
        &self,
        instance_id: i64,
        signal: Option<i32>,
        expected_modified: DateTime<Utc>,
        action: &NewAction,
    ) -> Result<bool>;

    async fn register_executor(&self, registration: &ExecutorRegistration) -> Result<i32>;

    async fn keepalive_executor(
        &self,
        executor_id: i32,
        now: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Result<()>;

    async fn stop_executor(&self, executor_id: i32, now: DateTime<Utc>) -> Result<()>;

    /// Whether the executor has neither expired nor stopped at `now`.
    async fn is_executor_live(&self, executor_id: i32, now: DateTime<Utc>) -> Result<bool>;

    /// Release instances of `executor_group` held by dead executors, recording a
    /// `recovery` action by `recovering_executor` for each.
    async fn recover_orphaned_instances(
        &self,
        executor_group: &str,
        recovering_executor: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveredInstance>>;

    async fn health_check(&self) -> Result<bool>;
}

pub(crate) fn encode_variables(variables: &StateVariables) -> Result<String> {
    Ok(serde_json::to_string(variables)?)
}

pub(crate) fn decode_variables(raw: &str) -> Result<StateVariables> {
    if raw.is_empty() {
        return Ok(StateVariables::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Map unique violations on insert to a validation error.
pub(crate) fn map_insert_error(err: sqlx::Error, instance: &InstanceInsert) -> CoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => CoreError::ValidationError {
            field: "external_id".to_string(),
            message: format!(
                "instance with external id '{}' already exists in group '{}'",
                instance.external_id, instance.executor_group
            ),
        },
        _ => err.into(),
    }
}

pub(crate) fn retries_column(retries: u32) -> i32 {
    i32::try_from(retries).unwrap_or(i32::MAX)
}
