// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-attempt execution context handed to state handlers.

use std::str::FromStr;

use crate::model::{NewInstance, StateVariables, WorkflowInstance};

/// Context of one state handler invocation.
///
/// Holds a working copy of the instance's variables. Changes made here are
/// persisted together with the attempt's outcome, and discarded if the
/// executor loses its claim on the instance.
#[derive(Debug, Clone)]
pub struct StateExecution {
    instance_id: i64,
    external_id: String,
    business_key: Option<String>,
    workflow_type: String,
    current_state: String,
    retries: u32,
    parent_workflow_id: Option<i64>,
    root_workflow_id: Option<i64>,
    variables: StateVariables,
    signal: Option<i32>,
    signal_changed: bool,
    new_children: Vec<NewInstance>,
}

impl StateExecution {
    pub(crate) fn new(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            external_id: instance.external_id.clone(),
            business_key: instance.business_key.clone(),
            workflow_type: instance.workflow_type.clone(),
            current_state: instance.state.clone(),
            retries: instance.retries,
            parent_workflow_id: instance.parent_workflow_id,
            root_workflow_id: instance.root_workflow_id,
            variables: instance.state_variables.clone(),
            signal: instance.signal,
            signal_changed: false,
            new_children: Vec::new(),
        }
    }

    pub fn workflow_instance_id(&self) -> i64 {
        self.instance_id
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn business_key(&self) -> Option<&str> {
        self.business_key.as_deref()
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    /// Failed attempts so far in the current state.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn parent_workflow_id(&self) -> Option<i64> {
        self.parent_workflow_id
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn variable_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.variable(name).unwrap_or(default)
    }

    /// Parse a variable, `None` if it is missing or does not parse.
    pub fn variable_as<T: FromStr>(&self, name: &str) -> Option<T> {
        self.variable(name).and_then(|raw| raw.parse().ok())
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variables(&self) -> &StateVariables {
        &self.variables
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// Set or clear the instance signal. Only written back when called.
    pub fn set_signal(&mut self, signal: Option<i32>) {
        self.signal = signal;
        self.signal_changed = true;
    }

    /// Queue a child workflow to be created together with this attempt's result.
    pub fn add_child_workflow(&mut self, child: NewInstance) {
        self.new_children.push(child);
    }

    pub(crate) fn variables_mut(&mut self) -> &mut StateVariables {
        &mut self.variables
    }

    /// Signal to persist, if the handler changed it.
    pub(crate) fn changed_signal(&self) -> Option<Option<i32>> {
        self.signal_changed.then_some(self.signal)
    }

    /// Children with the parent and root links filled in.
    pub(crate) fn take_children(&mut self) -> Vec<NewInstance> {
        let root = self.root_workflow_id.unwrap_or(self.instance_id);
        std::mem::take(&mut self.new_children)
            .into_iter()
            .map(|mut child| {
                child.parent_workflow_id = Some(self.instance_id);
                child.root_workflow_id = Some(root);
                child
            })
            .collect()
    }

    pub(crate) fn into_variables(self) -> StateVariables {
        self.variables
    }
}
