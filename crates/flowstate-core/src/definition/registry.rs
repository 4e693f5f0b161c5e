// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of workflow definitions known to an executor.

use std::collections::HashMap;
use std::sync::Arc;

use super::WorkflowDefinition;
use crate::error::{CoreError, Result};

/// Definitions by workflow type. Built at startup, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Fails if its type is already registered.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<()> {
        let workflow_type = definition.workflow_type().to_string();
        if self.definitions.contains_key(&workflow_type) {
            return Err(CoreError::invalid_definition(
                &workflow_type,
                "workflow type registered twice",
            ));
        }
        self.definitions
            .insert(workflow_type, Arc::new(definition));
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, definition: WorkflowDefinition) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).cloned()
    }

    /// Like [`get`](Self::get), failing with `WorkflowTypeNotFound`.
    pub fn require(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>> {
        self.get(workflow_type)
            .ok_or_else(|| CoreError::WorkflowTypeNotFound {
                workflow_type: workflow_type.to_string(),
            })
    }

    /// Registered types, sorted.
    pub fn workflow_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
