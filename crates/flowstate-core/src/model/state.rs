// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow states and their types.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::instance::InstanceStatus;

/// Type of a workflow state.
///
/// The type decides whether an instance resting in the state is still
/// progressing (`start`, `normal`, `wait`) or needs no further automatic
/// processing (`manual`, `end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStateType {
    /// Entry point of a workflow. New instances may only be submitted here.
    Start,
    /// Regular processing state.
    Normal,
    /// State waiting for an external event, signal or child workflow.
    Wait,
    /// Final state requiring human intervention.
    Manual,
    /// Successful final state.
    End,
}

impl WorkflowStateType {
    /// Whether instances in this state are no longer processed automatically.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Manual | Self::End)
    }

    /// Status an idle instance resting in this state should have.
    pub fn status(self) -> InstanceStatus {
        match self {
            Self::Manual => InstanceStatus::Manual,
            Self::End => InstanceStatus::Finished,
            Self::Start | Self::Normal | Self::Wait => InstanceStatus::InProgress,
        }
    }

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Normal => "normal",
            Self::Wait => "wait",
            Self::Manual => "manual",
            Self::End => "end",
        }
    }
}

impl fmt::Display for WorkflowStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named node in a workflow definition's state machine.
///
/// States are usually declared as constants next to the definition:
///
/// ```
/// use flowstate_core::model::{WorkflowState, WorkflowStateType};
///
/// const BEGIN: WorkflowState = WorkflowState::new("begin", WorkflowStateType::Start);
/// const DONE: WorkflowState = WorkflowState::new("done", WorkflowStateType::End);
/// assert!(DONE.is_final());
/// assert!(!BEGIN.is_final());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkflowState {
    name: Cow<'static, str>,
    state_type: WorkflowStateType,
    description: Cow<'static, str>,
}

impl WorkflowState {
    /// Create a state with a static name.
    pub const fn new(name: &'static str, state_type: WorkflowStateType) -> Self {
        Self {
            name: Cow::Borrowed(name),
            state_type,
            description: Cow::Borrowed(""),
        }
    }

    /// Create a state with a static name and a human-readable description.
    pub const fn with_description(
        name: &'static str,
        state_type: WorkflowStateType,
        description: &'static str,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            state_type,
            description: Cow::Borrowed(description),
        }
    }

    /// Create a state from a runtime string.
    pub fn owned(name: impl Into<String>, state_type: WorkflowStateType) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            state_type,
            description: Cow::Borrowed(""),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state_type(&self) -> WorkflowStateType {
        self.state_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_final(&self) -> bool {
        self.state_type.is_final()
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
