// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow instances and their action history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State variables of an instance, keyed by variable name.
pub type StateVariables = BTreeMap<String, String>;

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceStatus {
    /// Submitted, never processed.
    Created,
    /// Waiting for its next activation.
    InProgress,
    /// Claimed by an executor and currently being processed.
    Executing,
    /// Stopped in a manual state.
    Manual,
    /// Reached an end state.
    Finished,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "inProgress",
            Self::Executing => "executing",
            Self::Manual => "manual",
            Self::Finished => "finished",
        }
    }

    /// Statuses the dispatcher may claim.
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Created | Self::InProgress)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "inProgress" => Ok(Self::InProgress),
            "executing" => Ok(Self::Executing),
            "manual" => Ok(Self::Manual),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// One durable, resumable execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: i64,
    /// Caller-supplied identifier, unique per executor group.
    pub external_id: String,
    pub business_key: Option<String>,
    pub parent_workflow_id: Option<i64>,
    pub parent_action_id: Option<i64>,
    pub root_workflow_id: Option<i64>,
    /// Workflow definition type name.
    pub workflow_type: String,
    /// Current state name.
    pub state: String,
    /// Human-readable reason for the current state.
    pub state_text: Option<String>,
    pub status: InstanceStatus,
    /// Failed attempts in the current state since the last successful transition.
    pub retries: u32,
    /// When the instance may run next; `None` parks it indefinitely.
    pub next_activation: Option<DateTime<Utc>>,
    /// Executor holding the claim, `None` when idle.
    pub executor_id: Option<i32>,
    pub executor_group: String,
    /// Out-of-band interrupt value set by external actors.
    pub signal: Option<i32>,
    /// Current variables, mutated by handlers.
    pub state_variables: StateVariables,
    /// Snapshot taken when the instance was loaded for this run.
    pub original_state_variables: StateVariables,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Start time of the first action.
    pub started: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Variables that differ from the snapshot taken at load time.
    pub fn changed_variables(&self) -> StateVariables {
        changed_variables(&self.original_state_variables, &self.state_variables)
    }

    pub fn is_claimed(&self) -> bool {
        self.executor_id.is_some()
    }
}

/// Keys of `current` that are new or have a different value than in `original`.
pub fn changed_variables(original: &StateVariables, current: &StateVariables) -> StateVariables {
    current
        .iter()
        .filter(|(key, value)| original.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Parameters for submitting a new workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewInstance {
    pub workflow_type: String,
    /// Initial state; defaults to the definition's initial state on submit.
    pub state: Option<String>,
    /// Defaults to a random UUID on submit.
    pub external_id: Option<String>,
    pub business_key: Option<String>,
    /// Defaults to the submitting executor's group.
    pub executor_group: Option<String>,
    pub next_activation: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state_variables: StateVariables,
    pub parent_workflow_id: Option<i64>,
    pub parent_action_id: Option<i64>,
    pub root_workflow_id: Option<i64>,
}

impl NewInstance {
    /// A new instance of `workflow_type`, activated immediately.
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            state: None,
            external_id: None,
            business_key: None,
            executor_group: None,
            next_activation: Some(Utc::now()),
            state_variables: StateVariables::new(),
            parent_workflow_id: None,
            parent_action_id: None,
            root_workflow_id: None,
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn executor_group(mut self, group: impl Into<String>) -> Self {
        self.executor_group = Some(group.into());
        self
    }

    /// `None` creates the instance parked until woken up.
    pub fn next_activation(mut self, activation: Option<DateTime<Utc>>) -> Self {
        self.next_activation = activation;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.state_variables.insert(key.into(), value.into());
        self
    }
}

/// Kind of history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    /// A handler ran and produced an allowed outcome.
    StateExecution,
    /// A handler failed or requested a disallowed transition.
    StateExecutionFailed,
    /// The instance was changed through the management API.
    ExternalChange,
    /// The instance was reclaimed from a dead executor.
    Recovery,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateExecution => "stateExecution",
            Self::StateExecutionFailed => "stateExecutionFailed",
            Self::ExternalChange => "externalChange",
            Self::Recovery => "recovery",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stateExecution" => Ok(Self::StateExecution),
            "stateExecutionFailed" => Ok(Self::StateExecutionFailed),
            "externalChange" => Ok(Self::ExternalChange),
            "recovery" => Ok(Self::Recovery),
            other => Err(format!("unknown action type '{}'", other)),
        }
    }
}

/// Append-only history record of one execution attempt or external change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceAction {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub executor_id: Option<i32>,
    pub action_type: ActionType,
    /// State the attempt ran in.
    pub state: String,
    pub state_text: Option<String>,
    pub retry_no: u32,
    pub execution_start: DateTime<Utc>,
    pub execution_end: DateTime<Utc>,
    /// Only the variables changed during this attempt.
    pub updated_state_variables: StateVariables,
}
