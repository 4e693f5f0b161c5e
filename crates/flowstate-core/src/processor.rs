// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runs claimed workflow instances through their state handlers.
//!
//! One [`StateProcessor::process`] call handles one claimed instance: it
//! invokes the handler of the current state, turns the outcome (or failure)
//! into the next state and activation, and persists the result together with
//! an action record. While the computed activation is not in the future the
//! claim is kept and the next state runs immediately.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::{JsonVariableCodec, VariableCodec};
use crate::definition::{DefinitionRegistry, Transition, WorkflowDefinition};
use crate::error::{CoreError, Result};
use crate::execution::StateExecution;
use crate::model::{
    ActionType, InstanceStatus, NewInstance, NextAction, WorkflowInstance, changed_variables,
};
use crate::persistence::{InstanceInsert, InstanceUpdate, NewAction, Persistence};

/// State text recorded when no local definition exists for an instance.
pub const UNSUPPORTED_TYPE: &str = "unsupported type";

/// Executes claimed instances on behalf of one executor.
#[derive(Clone)]
pub struct StateProcessor {
    persistence: Arc<dyn Persistence>,
    registry: Arc<DefinitionRegistry>,
    codec: Arc<dyn VariableCodec>,
    executor_id: i32,
    busy_loop_limit: u32,
    lag_warning: Duration,
}

impl std::fmt::Debug for StateProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProcessor")
            .field("executor_id", &self.executor_id)
            .field("workflow_types", &self.registry.workflow_types())
            .field("busy_loop_limit", &self.busy_loop_limit)
            .field("lag_warning", &self.lag_warning)
            .finish()
    }
}

/// Outcome of one handler attempt, before timing rules are applied.
struct Attempt {
    transition: Transition,
    action_type: ActionType,
    /// Retry policy picked the transition, so the retry count is not reset.
    failed: bool,
    children: Vec<InstanceInsert>,
}

impl StateProcessor {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<DefinitionRegistry>,
        executor_id: i32,
    ) -> Self {
        Self {
            persistence,
            registry,
            codec: Arc::new(JsonVariableCodec),
            executor_id,
            busy_loop_limit: 100,
            lag_warning: Duration::from_secs(60),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn VariableCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Consecutive immediate transitions before a short delay is forced.
    pub fn with_busy_loop_limit(mut self, limit: u32) -> Self {
        self.busy_loop_limit = limit.max(1);
        self
    }

    pub fn with_lag_warning(mut self, lag_warning: Duration) -> Self {
        self.lag_warning = lag_warning;
        self
    }

    pub fn executor_id(&self) -> i32 {
        self.executor_id
    }

    /// Process one claimed instance until it needs to wait.
    ///
    /// Never fails: losing the claim is logged as a warning and any other
    /// error as an unexpected failure. The instance is then left as last
    /// persisted for orphan recovery to pick up.
    #[instrument(skip(self), fields(executor_id = self.executor_id))]
    pub async fn process(&self, instance_id: i64) {
        match self.run(instance_id).await {
            Ok(()) => {}
            Err(e) if e.is_ownership_conflict() => {
                warn!(instance_id, error = %e, "Discarding result of instance claimed by another executor");
            }
            Err(e) => {
                error!(instance_id, error = %e, "Unexpected failure while processing instance");
            }
        }
    }

    async fn run(&self, instance_id: i64) -> Result<()> {
        let mut instance = self
            .persistence
            .get_instance(instance_id)
            .await?
            .ok_or(CoreError::InstanceNotFound { instance_id })?;

        if instance.executor_id != Some(self.executor_id) {
            return Err(CoreError::StaleOwnership {
                instance_id,
                executor_id: self.executor_id,
            });
        }

        let now = Utc::now();
        if let Some(activation) = instance.next_activation
            && let Ok(lag) = (now - activation).to_std()
            && lag > self.lag_warning
        {
            warn!(
                instance_id,
                lag_secs = lag.as_secs(),
                "Instance processed long after its activation"
            );
        }

        let Some(definition) = self.registry.get(&instance.workflow_type) else {
            warn!(
                instance_id,
                workflow_type = %instance.workflow_type,
                "No definition for workflow type, parking instance"
            );
            return self
                .persistence
                .park_instance(instance_id, self.executor_id, UNSUPPORTED_TYPE, now)
                .await;
        };

        let mut consecutive_immediate = 0u32;
        loop {
            let processing = self
                .execute_attempt(&definition, &mut instance, &mut consecutive_immediate)
                .await?;
            if !processing {
                break;
            }
        }
        debug!(
            instance_id,
            state = %instance.state,
            status = %instance.status,
            "Instance released"
        );
        Ok(())
    }

    /// Run the current state once and persist the outcome.
    ///
    /// Returns whether processing continues immediately under the same claim.
    async fn execute_attempt(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        consecutive_immediate: &mut u32,
    ) -> Result<bool> {
        let execution_start = Utc::now();
        let current_state = instance.state.clone();
        let mut execution = StateExecution::new(instance);

        let handled = self
            .invoke_handler(definition, &current_state, &mut execution)
            .await;
        let now = Utc::now();

        let mut attempt = match handled {
            Ok(action) if action.is_retry() => Attempt {
                transition: definition.handle_retry_after(
                    &current_state,
                    instance.retries,
                    action.activation(),
                    action.reason(),
                    now,
                ),
                action_type: ActionType::StateExecution,
                failed: true,
                children: Vec::new(),
            },
            Ok(action) => match self.resolve_children(instance, execution.take_children()) {
                Ok(children) => Attempt {
                    transition: Transition {
                        next_state: action
                            .next_state()
                            .map_or_else(|| current_state.clone(), |s| s.name().to_string()),
                        next_activation: action.activation(),
                        reason: action.reason().to_string(),
                        retry: false,
                    },
                    action_type: ActionType::StateExecution,
                    failed: false,
                    children,
                },
                Err(e) => self.failed_attempt(definition, instance, &current_state, e, now),
            },
            Err(e) => self.failed_attempt(definition, instance, &current_state, e, now),
        };

        let settings = definition.settings();
        let transition = &mut attempt.transition;

        if !attempt.failed
            && !settings.immediate_transition_delay.is_zero()
            && transition.next_activation.is_some_and(|at| at <= now)
        {
            transition.next_activation = Some(crate::model::settings::add_saturating(
                now,
                settings.immediate_transition_delay,
            ));
        }

        if definition.method(&transition.next_state).is_none() {
            transition.next_activation = None;
        }

        if let Some(activation) = transition.next_activation
            && activation <= now
        {
            *consecutive_immediate += 1;
            if *consecutive_immediate >= self.busy_loop_limit {
                warn!(
                    instance_id = instance.id,
                    state = %transition.next_state,
                    iterations = *consecutive_immediate,
                    "Busy loop detected, delaying next activation"
                );
                transition.next_activation = Some(settings.short_transition_activation(now));
            }
        }

        let processing = transition.next_activation.is_some_and(|at| at <= now);
        let status = if processing {
            InstanceStatus::Executing
        } else {
            definition
                .state(&transition.next_state)
                .map_or(InstanceStatus::InProgress, |s| s.state_type().status())
        };
        let retries = if transition.retry {
            instance.retries.saturating_add(1)
        } else if attempt.failed {
            instance.retries
        } else {
            0
        };

        let signal = execution.changed_signal();
        let variables = execution.into_variables();
        let reason = transition.reason.clone();

        let update = InstanceUpdate {
            instance_id: instance.id,
            executor_id: self.executor_id,
            state: transition.next_state.clone(),
            state_text: Some(reason.clone()),
            status,
            retries,
            next_activation: transition.next_activation,
            keep_claim: processing,
            state_variables: variables.clone(),
            signal,
            modified: now,
            started: execution_start,
        };
        let action = NewAction {
            workflow_instance_id: instance.id,
            executor_id: Some(self.executor_id),
            action_type: attempt.action_type,
            state: current_state.clone(),
            state_text: Some(reason.clone()),
            retry_no: instance.retries,
            execution_start,
            execution_end: now,
            updated_state_variables: changed_variables(&instance.state_variables, &variables),
        };

        self.persistence
            .persist_execution(&update, &action, &attempt.children)
            .await?;

        info!(
            instance_id = instance.id,
            from = %current_state,
            to = %update.state,
            status = %status,
            retries,
            reason = %reason,
            "State executed"
        );

        instance.state = update.state;
        instance.state_text = update.state_text;
        instance.status = status;
        instance.retries = retries;
        instance.next_activation = update.next_activation;
        instance.state_variables = variables;
        if let Some(signal) = signal {
            instance.signal = signal;
        }
        instance.started.get_or_insert(execution_start);
        instance.modified = now;

        Ok(processing)
    }

    /// Bind arguments, run the handler and validate the requested transition.
    async fn invoke_handler(
        &self,
        definition: &WorkflowDefinition,
        current_state: &str,
        execution: &mut StateExecution,
    ) -> anyhow::Result<NextAction> {
        let state = definition
            .state(current_state)
            .ok_or_else(|| anyhow!("state '{}' is not declared", current_state))?;
        let Some(method) = definition.method(current_state) else {
            return Ok(NextAction::stop_in_state(
                state.clone(),
                "State has no handler, processing stopped",
            ));
        };

        let mut args = method.bind_arguments(execution.variables(), self.codec.as_ref())?;
        let action = method.handler().execute(execution, &mut args).await?;

        if !definition.is_allowed_next_action(current_state, &action) {
            let target = action.next_state().map_or("", |s| s.name());
            anyhow::bail!(
                "transition from '{}' to '{}' is not permitted",
                current_state,
                target
            );
        }
        method.write_back(&args, execution.variables_mut(), self.codec.as_ref())?;
        Ok(action)
    }

    fn failed_attempt(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        current_state: &str,
        error: anyhow::Error,
        now: DateTime<Utc>,
    ) -> Attempt {
        warn!(
            instance_id = instance.id,
            state = %current_state,
            retries = instance.retries,
            error = %format!("{:#}", error),
            "State handler failed"
        );
        let transition = if definition.state(current_state).is_some() {
            definition.handle_retry(current_state, instance.retries, format!("{:#}", error), now)
        } else {
            Transition {
                next_state: definition.error_state().name().to_string(),
                next_activation: Some(now),
                reason: format!("{:#}", error),
                retry: false,
            }
        };
        Attempt {
            transition,
            action_type: ActionType::StateExecutionFailed,
            failed: true,
            children: Vec::new(),
        }
    }

    /// Fill in defaults of child workflows created by a handler.
    fn resolve_children(
        &self,
        parent: &WorkflowInstance,
        children: Vec<NewInstance>,
    ) -> anyhow::Result<Vec<InstanceInsert>> {
        children
            .into_iter()
            .map(|child| {
                let state = match child.state {
                    Some(state) => state,
                    None => self
                        .registry
                        .require(&child.workflow_type)?
                        .initial_state()
                        .name()
                        .to_string(),
                };
                Ok(InstanceInsert {
                    workflow_type: child.workflow_type,
                    external_id: child
                        .external_id
                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                    business_key: child.business_key,
                    executor_group: child
                        .executor_group
                        .unwrap_or_else(|| parent.executor_group.clone()),
                    state,
                    status: InstanceStatus::Created,
                    next_activation: child.next_activation,
                    state_variables: child.state_variables,
                    parent_workflow_id: child.parent_workflow_id,
                    parent_action_id: None,
                    root_workflow_id: child.root_workflow_id,
                })
            })
            .collect()
    }
}
