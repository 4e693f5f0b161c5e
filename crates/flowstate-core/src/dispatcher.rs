// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Polling loop claiming ready instances and feeding them to the worker pool.
//!
//! Each iteration waits for the congestion gate, sizes a batch from the idle
//! worker capacity, claims that many ready instances and submits one
//! [`StateProcessor`] task per claimed id. Empty polls and failed iterations
//! sleep for the poll interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::congestion::CongestionGate;
use crate::error::Result;
use crate::persistence::Persistence;
use crate::processor::StateProcessor;
use crate::worker_pool::WorkerPool;

/// Polling dispatcher of one executor.
pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    processor: StateProcessor,
    pool: WorkerPool,
    gate: Arc<CongestionGate>,
    executor_group: String,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        processor: StateProcessor,
        config: &EngineConfig,
    ) -> Self {
        let pool = WorkerPool::new(config.thread_count);
        let gate = Arc::new(CongestionGate::new(
            config.queue_threshold,
            pool.queue_depth(),
        ));
        Self {
            persistence,
            processor,
            pool,
            gate,
            executor_group: config.executor_group.clone(),
            poll_interval: config.poll_interval,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Instances to claim next: twice the pool size minus the running tasks.
    pub fn batch_size(&self) -> u32 {
        let capacity = (2 * self.pool.max_size()).saturating_sub(self.pool.active());
        u32::try_from(capacity).unwrap_or(u32::MAX)
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        DispatcherHandle {
            shutdown_tx,
            handle,
            pool,
        }
    }

    /// Poll until `shutdown` becomes true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            executor_id = self.processor.executor_id(),
            executor_group = %self.executor_group,
            pool_size = self.pool.max_size(),
            queue_threshold = self.gate.threshold(),
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if !self.gate.admit(&mut shutdown).await {
                break;
            }

            let claimed = match self.dispatch_batch().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "Dispatcher iteration failed");
                    0
                }
            };
            if claimed > 0 {
                continue;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Dispatcher stopped");
    }

    /// Claim one batch and submit it. Returns the number of claimed instances.
    async fn dispatch_batch(&self) -> Result<usize> {
        let batch_size = self.batch_size();
        if batch_size == 0 {
            debug!("No idle worker capacity");
            return Ok(0);
        }

        let ids = self
            .persistence
            .claim_batch(
                batch_size,
                &self.executor_group,
                self.processor.executor_id(),
                Utc::now(),
            )
            .await?;
        if ids.is_empty() {
            debug!("No ready instances");
            return Ok(0);
        }
        debug!(count = ids.len(), batch_size, "Claimed instances");

        for &instance_id in &ids {
            let processor = self.processor.clone();
            let submitted = self.pool.submit(
                async move { processor.process(instance_id).await },
                Some(self.gate.clone()),
            );
            if !submitted {
                warn!(instance_id, "Worker pool closed, claimed instance left for recovery");
            }
        }
        Ok(ids.len())
    }
}

/// Handle to a dispatcher running on its own task.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    pool: WorkerPool,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Stop polling, wait for the loop to exit, then drain the worker pool.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Dispatcher task panicked");
        }
        self.pool.shutdown().await;
        info!("Dispatcher shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{DefinitionRegistry, WorkflowDefinition, handler_fn};
    use crate::model::{InstanceStatus, NextAction, WorkflowState, WorkflowStateType};
    use crate::persistence::{InstanceInsert, InstanceQuery, SqlitePersistence};
    use sqlx::sqlite::SqlitePoolOptions;

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

    fn config(thread_count: usize) -> EngineConfig {
        EngineConfig {
            executor_group: "default".to_string(),
            thread_count,
            queue_threshold: thread_count,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn dispatcher(persistence: Arc<SqlitePersistence>, config: &EngineConfig) -> Dispatcher {
        let definition = WorkflowDefinition::builder("order", BEGIN, ERROR)
            .state(BEGIN, handler_fn(|_, _| Ok(NextAction::move_to_state(DONE, "ok"))))
            .permit(BEGIN, DONE)
            .build()
            .unwrap();
        let registry = Arc::new(DefinitionRegistry::new().with(definition).unwrap());
        let processor = StateProcessor::new(persistence.clone(), registry, 1);
        Dispatcher::new(persistence, processor, config)
    }

    #[tokio::test]
    async fn test_batch_size_is_twice_the_pool() {
        let persistence = test_persistence().await;
        let dispatcher = dispatcher(persistence, &config(3));
        assert_eq!(dispatcher.batch_size(), 6);
    }

    #[tokio::test]
    async fn test_dispatches_ready_instances_to_completion() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        for i in 0..12 {
            persistence
                .insert_instance(
                    &InstanceInsert {
                        workflow_type: "order".to_string(),
                        external_id: format!("order-{}", i),
                        business_key: None,
                        executor_group: "default".to_string(),
                        state: "begin".to_string(),
                        status: InstanceStatus::Created,
                        next_activation: Some(now),
                        state_variables: Default::default(),
                        parent_workflow_id: None,
                        parent_action_id: None,
                        root_workflow_id: None,
                    },
                    now,
                )
                .await
                .unwrap();
        }

        let handle = dispatcher(persistence.clone(), &config(2)).spawn();
        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let finished = persistence
                    .list_instances(&InstanceQuery {
                        status: Some(InstanceStatus::Finished),
                        ..Default::default()
                    })
                    .await
                    .unwrap();
                if finished.len() == 12 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        handle.shutdown().await;
        assert!(finished.is_ok(), "instances were not all processed");
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_idle_sleep() {
        let persistence = test_persistence().await;
        let mut config = config(1);
        config.poll_interval = Duration::from_secs(3600);
        let handle = dispatcher(persistence, &config).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_running());
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown did not interrupt the poll sleep");
    }

    #[tokio::test]
    async fn test_poll_interval_beyond_u64_millis() {
        let persistence = test_persistence().await;
        let mut config = config(1);
        config.poll_interval = Duration::MAX;
        let handle = dispatcher(persistence, &config).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_running());
        tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
            .await
            .expect("shutdown did not interrupt the poll sleep");
    }
}
