// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor registration, keepalive and recovery of orphaned instances.
//!
//! Every executor owns a row in the `executors` table whose `expires` column
//! is pushed forward on each keepalive. An executor whose row expired or was
//! marked stopped is dead; instances it left in `executing` are released back
//! to `inProgress` by any live executor of the same group, without touching
//! their state, variables or retry count.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::settings::add_saturating;
use crate::persistence::{ExecutorRegistration, Persistence, RecoveredInstance};

/// Configuration for the liveness monitor.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub executor_group: String,
    /// How often the keepalive and recovery tick runs.
    pub keepalive_interval: Duration,
    /// Lifetime granted by one keepalive.
    pub executor_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            executor_group: "flowstate".to_string(),
            keepalive_interval: Duration::from_secs(60),
            executor_timeout: Duration::from_secs(900),
        }
    }
}

impl From<&EngineConfig> for LivenessConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            executor_group: config.executor_group.clone(),
            keepalive_interval: config.keepalive_interval,
            executor_timeout: config.executor_timeout,
        }
    }
}

/// Register this process as an executor and return its id.
pub async fn register_executor(
    persistence: &dyn Persistence,
    config: &LivenessConfig,
) -> Result<i32> {
    let now = Utc::now();
    let registration = ExecutorRegistration {
        host: host_name(),
        pid: i32::try_from(std::process::id()).unwrap_or(i32::MAX),
        executor_group: config.executor_group.clone(),
        started: now,
        expires: add_saturating(now, config.executor_timeout),
    };
    let executor_id = persistence.register_executor(&registration).await?;
    info!(
        executor_id,
        host = %registration.host,
        pid = registration.pid,
        executor_group = %registration.executor_group,
        "Executor registered"
    );
    Ok(executor_id)
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Background worker keeping this executor alive and reclaiming orphans.
pub struct LivenessMonitor {
    persistence: Arc<dyn Persistence>,
    executor_id: i32,
    config: LivenessConfig,
    shutdown: Arc<Notify>,
}

impl LivenessMonitor {
    pub fn new(persistence: Arc<dyn Persistence>, executor_id: i32, config: LivenessConfig) -> Self {
        Self {
            persistence,
            executor_id,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn executor_id(&self) -> i32 {
        self.executor_id
    }

    /// Whether `executor_id` is live now.
    pub async fn is_live(&self, executor_id: i32) -> Result<bool> {
        self.persistence.is_executor_live(executor_id, Utc::now()).await
    }

    /// Run keepalive and recovery every interval until shutdown, then mark
    /// this executor stopped.
    pub async fn run(&self) {
        info!(
            executor_id = self.executor_id,
            keepalive_interval_secs = self.config.keepalive_interval.as_secs(),
            executor_timeout_secs = self.config.executor_timeout.as_secs(),
            "Liveness monitor started"
        );

        if let Err(e) = self.recover_orphans().await {
            error!(error = %e, "Failed to recover orphaned instances on startup");
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Liveness monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.keepalive_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Liveness tick failed");
                    }
                }
            }
        }

        if let Err(e) = self.persistence.stop_executor(self.executor_id, Utc::now()).await {
            warn!(executor_id = self.executor_id, error = %e, "Failed to mark executor stopped");
        }
        info!("Liveness monitor stopped");
    }

    /// Refresh this executor's lease and release instances of dead executors.
    pub async fn tick(&self) -> Result<Vec<RecoveredInstance>> {
        let now = Utc::now();
        self.persistence
            .keepalive_executor(
                self.executor_id,
                now,
                add_saturating(now, self.config.executor_timeout),
            )
            .await?;
        debug!(executor_id = self.executor_id, "Executor keepalive");
        self.recover_orphans().await
    }

    async fn recover_orphans(&self) -> Result<Vec<RecoveredInstance>> {
        let recovered = self
            .persistence
            .recover_orphaned_instances(&self.config.executor_group, self.executor_id, Utc::now())
            .await?;
        for orphan in &recovered {
            info!(
                instance_id = orphan.instance_id,
                dead_executor_id = orphan.previous_executor_id,
                "Recovered orphaned instance"
            );
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceStatus, StateVariables};
    use crate::persistence::{InstanceInsert, SqlitePersistence};
    use chrono::TimeDelta;
    use sqlx::sqlite::SqlitePoolOptions;

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

    fn config(timeout: Duration) -> LivenessConfig {
        LivenessConfig {
            executor_group: "default".to_string(),
            keepalive_interval: Duration::from_millis(20),
            executor_timeout: timeout,
        }
    }

    #[test]
    fn test_config_from_engine_config() {
        let engine = EngineConfig {
            executor_group: "billing".to_string(),
            keepalive_interval: Duration::from_secs(5),
            executor_timeout: Duration::from_secs(50),
            ..Default::default()
        };
        let config = LivenessConfig::from(&engine);
        assert_eq!(config.executor_group, "billing");
        assert_eq!(config.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.executor_timeout, Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_registered_executor_is_live_until_stopped() {
        let persistence = test_persistence().await;
        let config = config(Duration::from_secs(60));
        let executor_id = register_executor(persistence.as_ref(), &config).await.unwrap();

        let monitor = LivenessMonitor::new(persistence.clone(), executor_id, config);
        assert!(monitor.is_live(executor_id).await.unwrap());

        let shutdown = monitor.shutdown_handle();
        let task = tokio::spawn(async move { monitor.run().await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert!(!persistence.is_executor_live(executor_id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_tick_recovers_instances_of_expired_executor() {
        let persistence = test_persistence().await;
        let now = Utc::now();
        let dead = persistence
            .register_executor(&ExecutorRegistration {
                host: "gone".to_string(),
                pid: 1,
                executor_group: "default".to_string(),
                started: now - TimeDelta::hours(1),
                expires: now - TimeDelta::minutes(1),
            })
            .await
            .unwrap();
        let id = persistence
            .insert_instance(
                &InstanceInsert {
                    workflow_type: "order".to_string(),
                    external_id: "orphan".to_string(),
                    business_key: None,
                    executor_group: "default".to_string(),
                    state: "process".to_string(),
                    status: InstanceStatus::InProgress,
                    next_activation: Some(now),
                    state_variables: StateVariables::from([("k".to_string(), "v".to_string())]),
                    parent_workflow_id: None,
                    parent_action_id: None,
                    root_workflow_id: None,
                },
                now,
            )
            .await
            .unwrap();
        persistence.claim_batch(1, "default", dead, Utc::now()).await.unwrap();

        let config = config(Duration::from_secs(60));
        let live = register_executor(persistence.as_ref(), &config).await.unwrap();
        let monitor = LivenessMonitor::new(persistence.clone(), live, config);
        assert!(!monitor.is_live(dead).await.unwrap());

        let recovered = monitor.tick().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].instance_id, id);

        let stored = persistence.get_instance(id).await.unwrap().unwrap();
        assert_eq!(stored.executor_id, None);
        assert_eq!(stored.status, InstanceStatus::InProgress);
        assert_eq!(stored.state, "process");
        assert_eq!(stored.state_variables.get("k").map(String::as_str), Some("v"));
        assert!(monitor.tick().await.unwrap().is_empty());
    }
}
