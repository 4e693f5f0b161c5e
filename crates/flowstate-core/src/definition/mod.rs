// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions: states, transitions, failure routing and retry policy.
//!
//! A definition is assembled once at startup through
//! [`WorkflowDefinitionBuilder`] and validated in [`build`]: a definition
//! that could fail at runtime because of a missing handler or an illegal
//! transition table is rejected before any instance is processed.
//!
//! ```
//! use flowstate_core::definition::{WorkflowDefinition, handler_fn};
//! use flowstate_core::model::{NextAction, WorkflowState, WorkflowStateType};
//!
//! const BEGIN: WorkflowState = WorkflowState::new("begin", WorkflowStateType::Start);
//! const DONE: WorkflowState = WorkflowState::new("done", WorkflowStateType::End);
//! const ERROR: WorkflowState = WorkflowState::new("error", WorkflowStateType::Manual);
//!
//! let definition = WorkflowDefinition::builder("greeting", BEGIN, ERROR)
//!     .state(BEGIN, handler_fn(|_, _| Ok(NextAction::move_to_state(DONE, "greeted"))))
//!     .permit(BEGIN, DONE)
//!     .build()
//!     .unwrap();
//! assert_eq!(definition.initial_state().name(), "begin");
//! ```
//!
//! [`build`]: WorkflowDefinitionBuilder::build

pub mod handler;
pub mod registry;

pub use self::handler::{
    FnHandler, StateArgs, StateHandler, StateMethod, StateVariable, handler_fn,
};
pub use self::registry::DefinitionRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, Result};
use crate::model::{NextAction, WorkflowSettings, WorkflowState, WorkflowStateType};

/// Next state, activation and reason computed for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next_state: String,
    /// `None` stops automatic processing.
    pub next_activation: Option<DateTime<Utc>>,
    pub reason: String,
    /// The attempt will be repeated in the same state.
    pub retry: bool,
}

/// Static description of one workflow type.
#[derive(Debug)]
pub struct WorkflowDefinition {
    workflow_type: String,
    description: String,
    initial_state: WorkflowState,
    error_state: WorkflowState,
    settings: WorkflowSettings,
    states: HashMap<String, WorkflowState>,
    methods: HashMap<String, StateMethod>,
    allowed_transitions: HashMap<String, Vec<String>>,
    failure_transitions: HashMap<String, String>,
}

impl WorkflowDefinition {
    /// Start building a definition.
    pub fn builder(
        workflow_type: impl Into<String>,
        initial_state: WorkflowState,
        error_state: WorkflowState,
    ) -> WorkflowDefinitionBuilder {
        WorkflowDefinitionBuilder::new(workflow_type, initial_state, error_state)
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn initial_state(&self) -> &WorkflowState {
        &self.initial_state
    }

    /// Generic error state used when retries run out without a failure transition.
    pub fn error_state(&self) -> &WorkflowState {
        &self.error_state
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn state(&self, name: &str) -> Option<&WorkflowState> {
        self.states.get(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &WorkflowState> {
        self.states.values()
    }

    /// Handler registered for a state, `None` for final states.
    pub fn method(&self, state: &str) -> Option<&StateMethod> {
        self.methods.get(state)
    }

    pub fn allowed_transitions(&self, state: &str) -> &[String] {
        self.allowed_transitions
            .get(state)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn failure_transition(&self, state: &str) -> Option<&WorkflowState> {
        self.failure_transitions
            .get(state)
            .and_then(|target| self.states.get(target))
    }

    /// Whether a handler in `current_state` may return `action`.
    ///
    /// Retries are always allowed. Moves are allowed to the registered
    /// failure transition, to the error state, and to permitted targets.
    pub fn is_allowed_next_action(&self, current_state: &str, action: &NextAction) -> bool {
        let Some(target) = action.next_state() else {
            return true;
        };
        let target = target.name();
        if !self.states.contains_key(target) {
            return false;
        }
        target == self.error_state.name()
            || self.failure_transitions.get(current_state).map(String::as_str) == Some(target)
            || self
                .allowed_transitions(current_state)
                .iter()
                .any(|allowed| allowed == target)
    }

    /// Transition after a failed attempt, using the default retry delay.
    pub fn handle_retry(
        &self,
        current_state: &str,
        retries: u32,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        let activation = self.settings.error_transition_activation(retries, now);
        self.handle_retry_after(current_state, retries, Some(activation), reason, now)
    }

    /// Transition after a failed or retried attempt, retrying at `activation`.
    ///
    /// Once `retries` reaches `max_retries` the instance moves to the
    /// state's failure transition, or to the error state. Exhausting retries
    /// in the error state itself stops processing.
    pub fn handle_retry_after(
        &self,
        current_state: &str,
        retries: u32,
        activation: Option<DateTime<Utc>>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        if retries < self.settings.max_retries {
            return Transition {
                next_state: current_state.to_string(),
                next_activation: activation,
                reason: reason.into(),
                retry: true,
            };
        }

        if let Some(failure_state) = self.failure_transitions.get(current_state) {
            return Transition {
                next_state: failure_state.clone(),
                next_activation: Some(now),
                reason: "Max retry count exceeded, going to failure state".to_string(),
                retry: false,
            };
        }

        let error_state = self.error_state.name();
        if current_state == error_state {
            Transition {
                next_state: error_state.to_string(),
                next_activation: None,
                reason: "Max retry count exceeded when handling error state, processing stopped"
                    .to_string(),
                retry: false,
            }
        } else {
            Transition {
                next_state: error_state.to_string(),
                next_activation: Some(now),
                reason: "Max retry count exceeded, going to error state".to_string(),
                retry: false,
            }
        }
    }
}

/// Builder collecting states, handlers and transitions of a definition.
///
/// Registration problems are collected and reported by [`build`](Self::build).
pub struct WorkflowDefinitionBuilder {
    workflow_type: String,
    description: String,
    initial_state: WorkflowState,
    error_state: WorkflowState,
    settings: WorkflowSettings,
    states: HashMap<String, WorkflowState>,
    methods: HashMap<String, StateMethod>,
    allowed_transitions: HashMap<String, Vec<String>>,
    failure_transitions: HashMap<String, String>,
    errors: Vec<String>,
}

impl WorkflowDefinitionBuilder {
    fn new(
        workflow_type: impl Into<String>,
        initial_state: WorkflowState,
        error_state: WorkflowState,
    ) -> Self {
        let mut builder = Self {
            workflow_type: workflow_type.into(),
            description: String::new(),
            initial_state: initial_state.clone(),
            error_state: error_state.clone(),
            settings: WorkflowSettings::default(),
            states: HashMap::new(),
            methods: HashMap::new(),
            allowed_transitions: HashMap::new(),
            failure_transitions: HashMap::new(),
            errors: Vec::new(),
        };
        builder.register_state(&initial_state);
        builder.register_state(&error_state);
        builder
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a handler without declared variables.
    pub fn state(self, state: WorkflowState, handler: impl StateHandler + 'static) -> Self {
        self.state_with_variables(state, Vec::new(), handler)
    }

    /// Register a handler receiving the declared variables as arguments.
    pub fn state_with_variables(
        mut self,
        state: WorkflowState,
        variables: Vec<StateVariable>,
        handler: impl StateHandler + 'static,
    ) -> Self {
        self.register_state(&state);
        if self.methods.contains_key(state.name()) {
            self.errors
                .push(format!("state '{}' has more than one handler", state.name()));
            return self;
        }
        self.methods.insert(
            state.name().to_string(),
            StateMethod::new(Arc::new(handler), variables),
        );
        self
    }

    /// Register a state that has no handler. Only valid for final states.
    pub fn final_state(mut self, state: WorkflowState) -> Self {
        self.register_state(&state);
        self
    }

    /// Allow handlers in `origin` to move to `target`.
    pub fn permit(mut self, origin: WorkflowState, target: WorkflowState) -> Self {
        self.add_transition(&origin, &target);
        self
    }

    /// Allow `origin` → `target`, and route `origin` to `failure` once its retries run out.
    pub fn permit_with_failure(
        mut self,
        origin: WorkflowState,
        target: WorkflowState,
        failure: WorkflowState,
    ) -> Self {
        self.add_transition(&origin, &target);
        self.register_state(&failure);
        match self.failure_transitions.get(origin.name()) {
            Some(existing) if existing != failure.name() => self.errors.push(format!(
                "state '{}' already has failure transition to '{}', cannot add '{}'",
                origin.name(),
                existing,
                failure.name()
            )),
            Some(_) => {}
            None => {
                self.failure_transitions
                    .insert(origin.name().to_string(), failure.name().to_string());
            }
        }
        self
    }

    /// Validate and build the definition.
    pub fn build(self) -> Result<WorkflowDefinition> {
        let workflow_type = self.workflow_type;
        if let Some(first) = self.errors.into_iter().next() {
            return Err(CoreError::invalid_definition(&workflow_type, first));
        }
        self.settings
            .validate()
            .map_err(|reason| CoreError::invalid_definition(&workflow_type, reason))?;

        if self.initial_state.state_type() != WorkflowStateType::Start {
            return Err(CoreError::invalid_definition(
                &workflow_type,
                format!(
                    "initial state '{}' must be of type start, not {}",
                    self.initial_state.name(),
                    self.initial_state.state_type()
                ),
            ));
        }
        if !self.error_state.is_final() {
            return Err(CoreError::invalid_definition(
                &workflow_type,
                format!(
                    "error state '{}' must be of type manual or end, not {}",
                    self.error_state.name(),
                    self.error_state.state_type()
                ),
            ));
        }

        let mut names: Vec<&String> = self.states.keys().collect();
        names.sort();
        for name in names {
            let state = &self.states[name];
            if !state.is_final() && !self.methods.contains_key(name) {
                return Err(CoreError::invalid_definition(
                    &workflow_type,
                    format!("non-final state '{}' has no handler", name),
                ));
            }
        }

        Ok(WorkflowDefinition {
            workflow_type,
            description: self.description,
            initial_state: self.initial_state,
            error_state: self.error_state,
            settings: self.settings,
            states: self.states,
            methods: self.methods,
            allowed_transitions: self.allowed_transitions,
            failure_transitions: self.failure_transitions,
        })
    }

    fn register_state(&mut self, state: &WorkflowState) {
        match self.states.get(state.name()) {
            Some(existing) if existing.state_type() != state.state_type() => {
                self.errors.push(format!(
                    "state '{}' registered as both {} and {}",
                    state.name(),
                    existing.state_type(),
                    state.state_type()
                ));
            }
            Some(_) => {}
            None => {
                self.states.insert(state.name().to_string(), state.clone());
            }
        }
    }

    fn add_transition(&mut self, origin: &WorkflowState, target: &WorkflowState) {
        self.register_state(origin);
        self.register_state(target);
        let targets = self
            .allowed_transitions
            .entry(origin.name().to_string())
            .or_default();
        if !targets.iter().any(|t| t == target.name()) {
            targets.push(target.name().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::time::Duration;

    const BEGIN: WorkflowState = WorkflowState::new("begin", WorkflowStateType::Start);
    const PROCESS: WorkflowState = WorkflowState::new("process", WorkflowStateType::Normal);
    const DONE: WorkflowState = WorkflowState::new("done", WorkflowStateType::End);
    const FAILED: WorkflowState = WorkflowState::new("failed", WorkflowStateType::Manual);
    const ERROR: WorkflowState = WorkflowState::new("error", WorkflowStateType::Manual);

    struct Noop;

    #[async_trait::async_trait]
    impl StateHandler for Noop {
        async fn execute(
            &self,
            _execution: &mut crate::execution::StateExecution,
            _args: &mut StateArgs,
        ) -> anyhow::Result<NextAction> {
            Ok(NextAction::stop_in_state(DONE, "noop"))
        }
    }

    fn noop() -> Noop {
        Noop
    }

    fn definition(max_retries: u32) -> WorkflowDefinition {
        WorkflowDefinition::builder("test", BEGIN, ERROR)
            .settings(
                WorkflowSettings::default()
                    .max_retries(max_retries)
                    .error_transition_delays(Duration::from_secs(10), Duration::from_secs(1000)),
            )
            .state(BEGIN, noop())
            .state(PROCESS, noop())
            .permit(BEGIN, PROCESS)
            .permit_with_failure(PROCESS, DONE, FAILED)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_registers_states_and_transitions() {
        let definition = definition(3);
        assert_eq!(definition.workflow_type(), "test");
        assert_eq!(definition.allowed_transitions("begin"), ["process".to_string()]);
        assert_eq!(definition.failure_transition("process"), Some(&FAILED));
        assert!(definition.method("begin").is_some());
        assert!(definition.method("done").is_none());
        assert_eq!(definition.states().count(), 5);
    }

    #[test]
    fn test_non_final_state_without_handler_fails_at_build() {
        let err = WorkflowDefinition::builder("test", BEGIN, ERROR)
            .state(BEGIN, noop())
            .permit(BEGIN, PROCESS)
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DEFINITION");
        assert!(err.to_string().contains("'process' has no handler"));
    }

    #[test]
    fn test_initial_state_must_be_start() {
        let err = WorkflowDefinition::builder("test", PROCESS, ERROR)
            .state(PROCESS, noop())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must be of type start"));
    }

    #[test]
    fn test_error_state_must_be_final() {
        let err = WorkflowDefinition::builder("test", BEGIN, PROCESS)
            .state(BEGIN, noop())
            .state(PROCESS, noop())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must be of type manual or end"));
    }

    #[test]
    fn test_conflicting_failure_transition_rejected() {
        let err = WorkflowDefinition::builder("test", BEGIN, ERROR)
            .state(BEGIN, noop())
            .permit_with_failure(BEGIN, DONE, FAILED)
            .permit_with_failure(BEGIN, DONE, ERROR)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("already has failure transition"));
    }

    #[test]
    fn test_same_failure_transition_twice_is_fine() {
        let result = WorkflowDefinition::builder("test", BEGIN, ERROR)
            .state(BEGIN, noop())
            .permit_with_failure(BEGIN, DONE, FAILED)
            .permit_with_failure(BEGIN, DONE, FAILED)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let err = WorkflowDefinition::builder("test", BEGIN, ERROR)
            .state(BEGIN, noop())
            .state(BEGIN, noop())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("more than one handler"));
    }

    #[test]
    fn test_allowed_next_actions() {
        let definition = definition(3);
        let now = Utc::now();
        assert!(definition.is_allowed_next_action("begin", &NextAction::retry_after(now, "r")));
        assert!(definition.is_allowed_next_action("begin", &NextAction::move_to_state(PROCESS, "ok")));
        assert!(definition.is_allowed_next_action("begin", &NextAction::move_to_state(ERROR, "err")));
        assert!(definition.is_allowed_next_action("process", &NextAction::move_to_state(FAILED, "f")));
        assert!(!definition.is_allowed_next_action("begin", &NextAction::move_to_state(DONE, "skip")));
        let unknown = WorkflowState::new("unknown", WorkflowStateType::End);
        assert!(!definition.is_allowed_next_action("begin", &NextAction::move_to_state(unknown, "?")));
    }

    #[test]
    fn test_retry_below_max_keeps_state() {
        let definition = definition(3);
        let now = Utc::now();
        let transition = definition.handle_retry("process", 1, "boom", now);
        assert!(transition.retry);
        assert_eq!(transition.next_state, "process");
        assert_eq!(transition.next_activation, Some(now + TimeDelta::seconds(20)));
        assert_eq!(transition.reason, "boom");
    }

    #[test]
    fn test_retry_delay_monotonic_within_bounds() {
        let definition = definition(100);
        let now = Utc::now();
        let settings = definition.settings();
        let min = now + TimeDelta::from_std(settings.min_error_transition_delay).unwrap();
        let max = now + TimeDelta::from_std(settings.max_error_transition_delay).unwrap();
        let mut previous = min;
        for retries in 0..99 {
            let activation = definition
                .handle_retry("process", retries, "boom", now)
                .next_activation
                .unwrap();
            assert!(activation >= previous);
            assert!(activation >= min && activation <= max);
            previous = activation;
        }
    }

    #[test]
    fn test_max_retries_routes_to_failure_state() {
        let definition = definition(3);
        let now = Utc::now();
        let transition = definition.handle_retry("process", 3, "boom", now);
        assert!(!transition.retry);
        assert_eq!(transition.next_state, "failed");
        assert_eq!(transition.next_activation, Some(now));
        assert_eq!(
            transition.reason,
            "Max retry count exceeded, going to failure state"
        );
    }

    #[test]
    fn test_max_retries_without_failure_state_goes_to_error_state() {
        let definition = definition(3);
        let now = Utc::now();
        let transition = definition.handle_retry("begin", 5, "boom", now);
        assert_eq!(transition.next_state, "error");
        assert_eq!(transition.next_activation, Some(now));
    }

    #[test]
    fn test_max_retries_in_error_state_stops_processing() {
        let definition = definition(3);
        let now = Utc::now();
        let first = definition.handle_retry("error", 3, "boom", now);
        let second = definition.handle_retry("error", 4, "boom", now);
        assert_eq!(first.next_state, "error");
        assert!(first.next_activation.is_none());
        assert_eq!(first, second);
    }
}
