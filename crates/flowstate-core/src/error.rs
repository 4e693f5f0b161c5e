// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for flowstate-core.
//!
//! Provides a unified error type shared by the definition model, the
//! persistence backends and the execution engine.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while defining, storing or executing workflows.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Instance was not found in the database.
    InstanceNotFound {
        /// The instance ID that was not found.
        instance_id: i64,
    },

    /// No workflow definition is registered for the requested type.
    WorkflowTypeNotFound {
        /// The workflow type name.
        workflow_type: String,
    },

    /// A workflow definition failed validation while it was being built.
    InvalidDefinition {
        /// The workflow type name.
        workflow_type: String,
        /// What is wrong with the definition.
        reason: String,
    },

    /// Instance is in an invalid state for the requested operation.
    InvalidInstanceState {
        /// The instance ID.
        instance_id: i64,
        /// The expected status or state.
        expected: String,
        /// The actual status or state.
        actual: String,
    },

    /// Another executor claimed the instance between candidate selection and
    /// the conditional claim update.
    ClaimRace {
        /// The instance that was lost to the other executor.
        instance_id: i64,
    },

    /// The executor no longer owns the instance it tried to persist.
    StaleOwnership {
        /// The instance ID.
        instance_id: i64,
        /// The executor that attempted the write.
        executor_id: i32,
    },

    /// A state variable could not be decoded or encoded.
    VariableCodec {
        /// Variable name.
        name: String,
        /// Codec failure details.
        reason: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::WorkflowTypeNotFound { .. } => "WORKFLOW_TYPE_NOT_FOUND",
            Self::InvalidDefinition { .. } => "INVALID_DEFINITION",
            Self::InvalidInstanceState { .. } => "INVALID_INSTANCE_STATE",
            Self::ClaimRace { .. } => "CLAIM_RACE",
            Self::StaleOwnership { .. } => "STALE_OWNERSHIP",
            Self::VariableCodec { .. } => "VARIABLE_CODEC",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error only means another executor got there first.
    ///
    /// Claim races and stale ownership are expected under concurrency and
    /// callers drop the affected instance instead of failing.
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(self, Self::ClaimRace { .. } | Self::StaleOwnership { .. })
    }

    pub(crate) fn invalid_definition(workflow_type: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            workflow_type: workflow_type.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstanceNotFound { instance_id } => {
                write!(f, "Workflow instance {} not found", instance_id)
            }
            Self::WorkflowTypeNotFound { workflow_type } => {
                write!(f, "No workflow definition registered for type '{}'", workflow_type)
            }
            Self::InvalidDefinition {
                workflow_type,
                reason,
            } => {
                write!(f, "Invalid workflow definition '{}': {}", workflow_type, reason)
            }
            Self::InvalidInstanceState {
                instance_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Workflow instance {} is in invalid state: expected '{}', got '{}'",
                    instance_id, expected, actual
                )
            }
            Self::ClaimRace { instance_id } => {
                write!(
                    f,
                    "Workflow instance {} was claimed by another executor",
                    instance_id
                )
            }
            Self::StaleOwnership {
                instance_id,
                executor_id,
            } => {
                write!(
                    f,
                    "Executor {} no longer owns workflow instance {}",
                    executor_id, instance_id
                )
            }
            Self::VariableCodec { name, reason } => {
                write!(f, "State variable '{}' could not be mapped: {}", name, reason)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
