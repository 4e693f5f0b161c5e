// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outcome of a single state handler invocation.

use chrono::{DateTime, Utc};

use super::state::WorkflowState;

/// What a state handler wants to happen next.
///
/// Either retry the current state at a given time, or move to another state
/// with an optional activation time. A move without activation parks the
/// instance until something external wakes it up.
#[derive(Debug, Clone, PartialEq)]
pub struct NextAction {
    next_state: Option<WorkflowState>,
    activation: Option<DateTime<Utc>>,
    reason: String,
}

impl NextAction {
    /// Retry the current state at `activation`.
    pub fn retry_after(activation: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            next_state: None,
            activation: Some(activation),
            reason: reason.into(),
        }
    }

    /// Move to `state` and process it immediately.
    pub fn move_to_state(state: WorkflowState, reason: impl Into<String>) -> Self {
        Self::move_to_state_after(state, Utc::now(), reason)
    }

    /// Move to `state` and process it at `activation`.
    pub fn move_to_state_after(
        state: WorkflowState,
        activation: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            next_state: Some(state),
            activation: Some(activation),
            reason: reason.into(),
        }
    }

    /// Move to `state` and stop processing there.
    pub fn stop_in_state(state: WorkflowState, reason: impl Into<String>) -> Self {
        Self {
            next_state: Some(state),
            activation: None,
            reason: reason.into(),
        }
    }

    pub fn is_retry(&self) -> bool {
        self.next_state.is_none()
    }

    /// Target state, `None` for retries.
    pub fn next_state(&self) -> Option<&WorkflowState> {
        self.next_state.as_ref()
    }

    pub fn activation(&self) -> Option<DateTime<Utc>> {
        self.activation
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}
