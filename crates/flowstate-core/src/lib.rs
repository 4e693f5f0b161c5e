// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowstate Core - Durable Workflow Execution Engine
//!
//! This crate persists long-running, resumable workflow instances in a shared
//! relational store (PostgreSQL or SQLite) and drives them forward by invoking
//! state handlers until each instance reaches a final state. Any number of
//! executor processes may poll the same store; claiming is arbitrated by the
//! database so that no instance is processed by two executors at once.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Executor process                          │
//! │                                                                  │
//! │  ┌────────────┐ admit ┌────────────────┐ submit ┌─────────────┐  │
//! │  │ Dispatcher │──────►│ CongestionGate │◄───────│ WorkerPool  │  │
//! │  └────────────┘       └────────────────┘ signal └─────────────┘  │
//! │        │ claim_batch                              │ process(id)  │
//! │        │                                   ┌────────────────┐    │
//! │        │                                   │ StateProcessor │    │
//! │        │                                   └────────────────┘    │
//! │        │                                          │ persist      │
//! │  ┌─────▼──────────────────────────────────────────▼──────────┐   │
//! │  │                    Persistence                            │   │
//! │  └───────────────────────────────────────────────────────────┘   │
//! │  LivenessMonitor: keepalive + orphan recovery                    │
//! └──────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                 ┌──────────────────────────┐
//!                 │  PostgreSQL / SQLite     │
//!                 │  workflow_instances      │
//!                 │  workflow_actions        │
//!                 │  executors               │
//!                 └──────────────────────────┘
//! ```
//!
//! # Instance lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `created` | Submitted, never processed |
//! | `inProgress` | Waiting for its next activation |
//! | `executing` | Claimed by an executor |
//! | `manual` | Stopped in a manual state |
//! | `finished` | Reached an end state |
//!
//! Only `created` and `inProgress` instances whose activation is due are
//! claimed. Every handler attempt appends one action to the instance history.
//!
//! # Failure handling
//!
//! | Failure | Effect |
//! |---------|--------|
//! | Handler error or disallowed transition | Attempt fails, retried with growing delay |
//! | Retries exhausted | Failure transition of the state, else the error state |
//! | Claim lost to another executor | Id dropped from the batch |
//! | Claim revoked before persist | Result discarded |
//! | Unknown workflow type | Instance parked for a capable executor |
//! | Executor died | Its instances released by orphan recovery |

/// Environment-based configuration.
pub mod config;

/// Admission gate bounding locally queued work.
pub mod congestion;

/// Codec between stored variable strings and handler arguments.
pub mod codec;

/// Workflow definitions, handlers and the definition registry.
pub mod definition;

/// Polling dispatcher.
pub mod dispatcher;

/// Error types with machine-readable codes.
pub mod error;

/// Per-attempt handler context.
pub mod execution;

/// Executor registration, keepalive and orphan recovery.
pub mod liveness;

/// Submit, inspect and change instances from outside the engine.
pub mod management;

/// Embedded database migrations.
pub mod migrations;

/// States, instances, actions and settings.
pub mod model;

/// Instance store protocol and its PostgreSQL and SQLite backends.
pub mod persistence;

/// State machine runner for claimed instances.
pub mod processor;

/// Embeddable runtime wiring the engine together.
pub mod runtime;

/// Bounded worker pool.
pub mod worker_pool;

pub use config::{Config, ConfigError, EngineConfig};
pub use definition::{DefinitionRegistry, WorkflowDefinition};
pub use error::{CoreError, Result};
pub use management::{InstanceChange, WorkflowManager};
pub use model::{
    InstanceStatus, NewInstance, NextAction, WorkflowInstance, WorkflowSettings, WorkflowState,
    WorkflowStateType,
};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use runtime::EngineRuntime;
