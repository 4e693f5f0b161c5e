// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`EngineRuntime`] registers the process as an executor and runs the
//! liveness monitor and the dispatcher inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowstate_core::definition::DefinitionRegistry;
//! use flowstate_core::persistence::SqlitePersistence;
//! use flowstate_core::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/flowstate.db").await?);
//!     let registry = DefinitionRegistry::new().with(my_workflow()?)?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .registry(registry)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.manager().submit(NewInstance::new("order")).await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::codec::{JsonVariableCodec, VariableCodec};
use crate::config::EngineConfig;
use crate::definition::DefinitionRegistry;
use crate::dispatcher::{Dispatcher, DispatcherHandle};
use crate::liveness::{LivenessConfig, LivenessMonitor, register_executor};
use crate::management::WorkflowManager;
use crate::persistence::Persistence;
use crate::processor::StateProcessor;

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    registry: Option<Arc<DefinitionRegistry>>,
    codec: Option<Arc<dyn VariableCodec>>,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the workflow definitions this executor runs (required).
    pub fn registry(mut self, registry: DefinitionRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Replace the default JSON variable codec.
    pub fn codec(mut self, codec: Arc<dyn VariableCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Default: [`EngineConfig::default`]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        if registry.is_empty() {
            anyhow::bail!("registry has no workflow definitions");
        }
        if self.config.executor_group.trim().is_empty() {
            anyhow::bail!("executor group must not be empty");
        }

        Ok(EngineRuntimeConfig {
            persistence,
            registry,
            codec: self.codec.unwrap_or_else(|| Arc::new(JsonVariableCodec)),
            config: self.config,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    registry: Arc<DefinitionRegistry>,
    codec: Arc<dyn VariableCodec>,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("persistence", &"...")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Register the executor and spawn the liveness monitor and dispatcher.
    pub async fn start(self) -> Result<EngineRuntime> {
        let liveness_config = LivenessConfig::from(&self.config);
        let executor_id = register_executor(self.persistence.as_ref(), &liveness_config).await?;

        let monitor = LivenessMonitor::new(self.persistence.clone(), executor_id, liveness_config);
        let liveness_shutdown = monitor.shutdown_handle();
        let liveness_handle = tokio::spawn(async move { monitor.run().await });

        let processor = StateProcessor::new(self.persistence.clone(), self.registry.clone(), executor_id)
            .with_codec(self.codec)
            .with_busy_loop_limit(self.config.busy_loop_limit)
            .with_lag_warning(self.config.lag_warning);
        let dispatcher = Dispatcher::new(self.persistence.clone(), processor, &self.config).spawn();

        let manager = WorkflowManager::new(
            self.persistence.clone(),
            self.registry.clone(),
            self.config.executor_group.clone(),
        );

        info!(
            executor_id,
            executor_group = %self.config.executor_group,
            workflow_types = ?self.registry.workflow_types(),
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            executor_id,
            dispatcher,
            liveness_shutdown,
            liveness_handle,
            manager,
            persistence: self.persistence,
        })
    }
}

/// A running executor embedded in an application.
///
/// The runtime manages:
/// - the dispatcher claiming and processing ready instances
/// - the liveness monitor keeping this executor registered and recovering orphans
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    executor_id: i32,
    dispatcher: DispatcherHandle,
    liveness_shutdown: Arc<Notify>,
    liveness_handle: JoinHandle<()>,
    manager: WorkflowManager,
    persistence: Arc<dyn Persistence>,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    pub fn executor_id(&self) -> i32 {
        self.executor_id
    }

    /// Management API bound to this executor's group.
    pub fn manager(&self) -> &WorkflowManager {
        &self.manager
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Check if the dispatcher is still running.
    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops claiming, waits for running instances to finish, then stops the
    /// liveness monitor, which marks this executor stopped.
    pub async fn shutdown(self) -> Result<()> {
        info!(executor_id = self.executor_id, "EngineRuntime shutting down...");

        self.dispatcher.shutdown().await;

        self.liveness_shutdown.notify_one();
        match self.liveness_handle.await {
            Ok(()) => {
                info!("EngineRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Liveness monitor task panicked: {}", e);
                Err(anyhow::anyhow!("liveness monitor task panicked: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{WorkflowDefinition, handler_fn};
    use crate::model::{InstanceStatus, NewInstance, NextAction, WorkflowState, WorkflowStateType};
    use crate::persistence::SqlitePersistence;
    use chrono::Utc;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    const BEGIN: WorkflowState = WorkflowState::new("begin", WorkflowStateType::Start);
    const DONE: WorkflowState = WorkflowState::new("done", WorkflowStateType::End);
    const ERROR: WorkflowState = WorkflowState::new("error", WorkflowStateType::Manual);

    async fn test_persistence() -> Arc<SqlitePersistence> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        Arc::new(SqlitePersistence::new(pool))
    }

    fn registry() -> DefinitionRegistry {
        let definition = WorkflowDefinition::builder("greeting", BEGIN, ERROR)
            .state(BEGIN, handler_fn(|_, _| Ok(NextAction::move_to_state(DONE, "greeted"))))
            .permit(BEGIN, DONE)
            .build()
            .unwrap();
        DefinitionRegistry::new().with(definition).unwrap()
    }

    #[test]
    fn test_builder_requires_persistence() {
        let result = EngineRuntime::builder().registry(registry()).build();
        assert!(result.unwrap_err().to_string().contains("persistence is required"));
    }

    #[tokio::test]
    async fn test_builder_requires_definitions() {
        let persistence = test_persistence().await;
        let result = EngineRuntime::builder().persistence(persistence.clone()).build();
        assert!(result.unwrap_err().to_string().contains("registry is required"));

        let result = EngineRuntime::builder()
            .persistence(persistence)
            .registry(DefinitionRegistry::new())
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_process_and_shutdown() {
        let persistence = test_persistence().await;
        let runtime = EngineRuntime::builder()
            .persistence(persistence.clone())
            .registry(registry())
            .config(EngineConfig {
                executor_group: "default".to_string(),
                thread_count: 2,
                queue_threshold: 2,
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        let executor_id = runtime.executor_id();
        assert!(persistence.is_executor_live(executor_id, Utc::now()).await.unwrap());

        let id = runtime.manager().submit(NewInstance::new("greeting")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), async {
            while runtime.manager().get(id).await.unwrap().status != InstanceStatus::Finished {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("instance was not processed");

        runtime.shutdown().await.unwrap();
        assert!(!persistence.is_executor_live(executor_id, Utc::now()).await.unwrap());
    }
}
