// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External operations on workflow instances.
//!
//! Instances are changed from outside the engine only through
//! compare-and-swap updates: an unclaimed instance is updated only if it was
//! not modified since it was read, and a claimed instance only accepts an
//! earlier activation request, which the claiming executor merges into its
//! own result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::definition::DefinitionRegistry;
use crate::error::{CoreError, Result};
use crate::model::{
    ActionType, InstanceStatus, NewInstance, StateVariables, WorkflowInstance,
    WorkflowInstanceAction, WorkflowStateType, changed_variables,
};
use crate::persistence::{ExternalUpdate, InstanceInsert, InstanceQuery, NewAction, Persistence};

/// Attempts at a compare-and-swap before giving up on a busy instance.
const CAS_ATTEMPTS: usize = 3;

/// Requested change of an instance. Empty fields leave the value as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceChange {
    /// Move to this state. Only for unclaimed instances.
    pub state: Option<String>,
    /// New activation; `Some(None)` parks the instance.
    pub next_activation: Option<Option<DateTime<Utc>>>,
    /// Variables to set. Only for unclaimed instances.
    pub state_variables: StateVariables,
    /// Reason recorded in the history.
    pub reason: Option<String>,
}

impl InstanceChange {
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn next_activation(mut self, activation: Option<DateTime<Utc>>) -> Self {
        self.next_activation = Some(activation);
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state_variables.insert(key.into(), value.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn changes_content(&self) -> bool {
        self.state.is_some() || !self.state_variables.is_empty()
    }
}

/// Management API over the instance store.
#[derive(Clone)]
pub struct WorkflowManager {
    persistence: Arc<dyn Persistence>,
    registry: Arc<DefinitionRegistry>,
    executor_group: String,
}

impl WorkflowManager {
    /// `executor_group` is used for instances submitted without a group.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<DefinitionRegistry>,
        executor_group: impl Into<String>,
    ) -> Self {
        Self {
            persistence,
            registry,
            executor_group: executor_group.into(),
        }
    }

    /// Create a new instance and return its id.
    ///
    /// The state defaults to the definition's initial state and must be a
    /// start state.
    #[instrument(skip(self, instance), fields(workflow_type = %instance.workflow_type))]
    pub async fn submit(&self, instance: NewInstance) -> Result<i64> {
        let definition = self.registry.require(&instance.workflow_type)?;

        let state = match instance.state {
            Some(name) => {
                let state = definition.state(&name).ok_or_else(|| CoreError::ValidationError {
                    field: "state".to_string(),
                    message: format!("'{}' is not a state of '{}'", name, definition.workflow_type()),
                })?;
                if state.state_type() != WorkflowStateType::Start {
                    return Err(CoreError::ValidationError {
                        field: "state".to_string(),
                        message: format!("'{}' is not a start state", name),
                    });
                }
                name
            }
            None => definition.initial_state().name().to_string(),
        };

        let external_id = match instance.external_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CoreError::ValidationError {
                    field: "external_id".to_string(),
                    message: "must not be empty".to_string(),
                });
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let insert = InstanceInsert {
            workflow_type: instance.workflow_type,
            external_id,
            business_key: instance.business_key,
            executor_group: instance
                .executor_group
                .unwrap_or_else(|| self.executor_group.clone()),
            state,
            status: InstanceStatus::Created,
            next_activation: instance.next_activation,
            state_variables: instance.state_variables,
            parent_workflow_id: instance.parent_workflow_id,
            parent_action_id: instance.parent_action_id,
            root_workflow_id: instance.root_workflow_id,
        };
        let instance_id = self.persistence.insert_instance(&insert, Utc::now()).await?;
        info!(
            instance_id,
            external_id = %insert.external_id,
            state = %insert.state,
            "Workflow instance submitted"
        );
        Ok(instance_id)
    }

    pub async fn get(&self, instance_id: i64) -> Result<WorkflowInstance> {
        self.persistence
            .get_instance(instance_id)
            .await?
            .ok_or(CoreError::InstanceNotFound { instance_id })
    }

    pub async fn list(&self, query: &InstanceQuery) -> Result<Vec<WorkflowInstance>> {
        self.persistence.list_instances(query).await
    }

    /// History of an instance, oldest first.
    pub async fn actions(&self, instance_id: i64) -> Result<Vec<WorkflowInstanceAction>> {
        self.get(instance_id).await?;
        self.persistence.list_actions(instance_id).await
    }

    /// Apply `change` to an instance.
    ///
    /// An unclaimed instance may be moved to any declared state and get new
    /// variables and activation. A claimed instance only accepts an earlier
    /// activation; any other change fails with
    /// [`CoreError::InvalidInstanceState`].
    #[instrument(skip(self, change))]
    pub async fn update(&self, instance_id: i64, change: InstanceChange) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let instance = self.get(instance_id).await?;

            if instance.is_claimed() {
                if change.changes_content() {
                    return Err(CoreError::InvalidInstanceState {
                        instance_id,
                        expected: "unclaimed".to_string(),
                        actual: instance.status.to_string(),
                    });
                }
                let Some(Some(at)) = change.next_activation else {
                    return Err(CoreError::ValidationError {
                        field: "next_activation".to_string(),
                        message: "a claimed instance only accepts an earlier activation"
                            .to_string(),
                    });
                };
                if self.persistence.request_activation(instance_id, at).await? {
                    debug!(instance_id, %at, "Activation requested from claiming executor");
                    return Ok(());
                }
                continue;
            }

            if self.apply_unclaimed(&instance, &change).await? {
                return Ok(());
            }
        }
        Err(concurrently_modified(instance_id))
    }

    /// Activate an instance now if it is in one of `expected_states`.
    ///
    /// An empty `expected_states` matches any state. Returns false if the
    /// instance is in another state.
    #[instrument(skip(self))]
    pub async fn wakeup(&self, instance_id: i64, expected_states: &[&str]) -> Result<bool> {
        for _ in 0..CAS_ATTEMPTS {
            let instance = self.get(instance_id).await?;
            if !expected_states.is_empty() && !expected_states.contains(&instance.state.as_str()) {
                debug!(instance_id, state = %instance.state, "Wakeup skipped, unexpected state");
                return Ok(false);
            }

            let now = Utc::now();
            if instance.is_claimed() {
                if self.persistence.request_activation(instance_id, now).await? {
                    return Ok(true);
                }
                continue;
            }

            let change = InstanceChange::default()
                .next_activation(Some(now))
                .reason("Woken up");
            if self.apply_unclaimed(&instance, &change).await? {
                return Ok(true);
            }
        }
        Err(concurrently_modified(instance_id))
    }

    /// Set or clear the signal of an instance.
    ///
    /// Claimed instances accept a signal too; the handler sees it on its next
    /// execution.
    #[instrument(skip(self, reason))]
    pub async fn signal(&self, instance_id: i64, signal: Option<i32>, reason: &str) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let instance = self.get(instance_id).await?;
            let now = Utc::now();
            let action = NewAction {
                workflow_instance_id: instance_id,
                executor_id: None,
                action_type: ActionType::ExternalChange,
                state: instance.state,
                state_text: Some(reason.to_string()),
                retry_no: instance.retries,
                execution_start: now,
                execution_end: now,
                updated_state_variables: StateVariables::new(),
            };
            if self
                .persistence
                .set_signal(instance_id, signal, instance.modified, &action)
                .await?
            {
                info!(instance_id, ?signal, "Signal set");
                return Ok(());
            }
            debug!(instance_id, "Instance changed concurrently, retrying");
        }
        Err(concurrently_modified(instance_id))
    }

    /// Compare-and-swap `change` onto an unclaimed instance read as `instance`.
    async fn apply_unclaimed(&self, instance: &WorkflowInstance, change: &InstanceChange) -> Result<bool> {
        let definition = self.registry.require(&instance.workflow_type)?;

        let state_name = change.state.as_deref().unwrap_or(&instance.state);
        let state = definition
            .state(state_name)
            .ok_or_else(|| CoreError::ValidationError {
                field: "state".to_string(),
                message: format!(
                    "'{}' is not a state of '{}'",
                    state_name,
                    definition.workflow_type()
                ),
            })?;
        let state_changed = state_name != instance.state;

        let status = if !state_changed && instance.status == InstanceStatus::Created {
            InstanceStatus::Created
        } else {
            state.state_type().status()
        };
        let retries = if state_changed { 0 } else { instance.retries };
        let next_activation = change.next_activation.unwrap_or(instance.next_activation);

        let mut variables = instance.state_variables.clone();
        variables.extend(change.state_variables.clone());

        let now = Utc::now();
        let reason = change
            .reason
            .clone()
            .unwrap_or_else(|| "External change".to_string());
        let update = ExternalUpdate {
            instance_id: instance.id,
            expected_modified: instance.modified,
            state: state_name.to_string(),
            state_text: Some(reason.clone()),
            status,
            retries,
            next_activation,
            state_variables: variables.clone(),
            modified: now,
        };
        let action = NewAction {
            workflow_instance_id: instance.id,
            executor_id: None,
            action_type: ActionType::ExternalChange,
            state: state_name.to_string(),
            state_text: Some(reason),
            retry_no: instance.retries,
            execution_start: now,
            execution_end: now,
            updated_state_variables: changed_variables(&instance.state_variables, &variables),
        };

        let applied = self.persistence.update_unclaimed(&update, &action).await?;
        if applied {
            info!(
                instance_id = instance.id,
                state = %update.state,
                status = %status,
                "Instance changed externally"
            );
        } else {
            debug!(instance_id = instance.id, "Instance changed concurrently, retrying");
        }
        Ok(applied)
    }
}

fn concurrently_modified(instance_id: i64) -> CoreError {
    CoreError::InvalidInstanceState {
        instance_id,
        expected: "unchanged during update".to_string(),
        actual: "concurrently modified".to_string(),
    }
}
