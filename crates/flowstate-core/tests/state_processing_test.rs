// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the state machine runner against a SQLite store.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tokio::sync::Notify;

use common::*;
use flowstate_core::definition::{
    DefinitionRegistry, StateArgs, StateHandler, WorkflowDefinition, handler_fn,
};
use flowstate_core::execution::StateExecution;
use flowstate_core::model::{
    ActionType, InstanceStatus, NextAction, WorkflowSettings, WorkflowState, WorkflowStateType,
};
use flowstate_core::persistence::{ExecutorRegistration, Persistence};
use flowstate_core::processor::StateProcessor;

const START: WorkflowState = WorkflowState::new("start", WorkflowStateType::Start);
const WORK: WorkflowState = WorkflowState::new("work", WorkflowStateType::Normal);
const DONE: WorkflowState = WorkflowState::new("done", WorkflowStateType::End);
const FAILED: WorkflowState = WorkflowState::new("failed", WorkflowStateType::Manual);
const ERROR: WorkflowState = WorkflowState::new("error", WorkflowStateType::Manual);

const EXECUTOR: i32 = 1;

fn processor(persistence: Arc<dyn Persistence>, definition: WorkflowDefinition) -> StateProcessor {
    let registry = DefinitionRegistry::new()
        .with(definition)
        .expect("Failed to register definition");
    StateProcessor::new(persistence, Arc::new(registry), EXECUTOR)
}

#[tokio::test]
async fn test_start_to_done_in_one_run() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let definition = WorkflowDefinition::builder("simple", START, ERROR)
        .state(START, handler_fn(|_, _| Ok(NextAction::move_to_state(DONE, "ok"))))
        .permit(START, DONE)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "simple", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    processor(persistence.clone(), definition).process(id).await;

    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Finished);
    assert_eq!(instance.state, "done");
    assert_eq!(instance.retries, 0);
    assert_eq!(instance.executor_id, None);
    assert!(instance.started.is_some());

    let actions = persistence.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::StateExecution);
    assert_eq!(actions[0].state, "start");
    assert_eq!(actions[0].state_text.as_deref(), Some("ok"));
    assert_eq!(actions[0].executor_id, Some(EXECUTOR));
}

#[tokio::test]
async fn test_exhausted_retries_route_to_failure_state() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();

    // Zero retry delays keep every attempt inside one run.
    let settings = WorkflowSettings::default()
        .max_retries(3)
        .error_transition_delays(Duration::ZERO, Duration::ZERO);
    let definition = WorkflowDefinition::builder("flaky", START, ERROR)
        .settings(settings)
        .state(
            START,
            handler_fn(move |_, _| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                anyhow::bail!("backend unavailable (attempt {})", attempt)
            }),
        )
        .permit_with_failure(START, DONE, FAILED)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "flaky", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    processor(persistence.clone(), definition).process(id).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "failed");
    assert_eq!(instance.status, InstanceStatus::Manual);
    assert_eq!(instance.retries, 3);
    assert_eq!(instance.next_activation, None);

    let actions = persistence.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 4);
    assert!(actions.iter().all(|a| a.action_type == ActionType::StateExecutionFailed));
    let retry_numbers: Vec<u32> = actions.iter().map(|a| a.retry_no).collect();
    assert_eq!(retry_numbers, vec![0, 1, 2, 3]);
    assert_eq!(
        actions[3].state_text.as_deref(),
        Some("Max retry count exceeded, going to failure state")
    );
}

#[tokio::test]
async fn test_exhausted_retries_without_failure_state_go_to_error_state() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let settings = WorkflowSettings::default()
        .max_retries(1)
        .error_transition_delays(Duration::ZERO, Duration::ZERO);
    let definition = WorkflowDefinition::builder("flaky", START, ERROR)
        .settings(settings)
        .state(START, handler_fn(|_, _| anyhow::bail!("always fails")))
        .permit(START, DONE)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "flaky", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    processor(persistence.clone(), definition).process(id).await;

    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "error");
    assert_eq!(instance.status, InstanceStatus::Manual);
    assert_eq!(instance.next_activation, None);
    assert_eq!(persistence.list_actions(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_attempt_is_delayed_and_released() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let definition = WorkflowDefinition::builder("flaky", START, ERROR)
        .settings(WorkflowSettings::default().error_transition_delays(
            Duration::from_secs(10),
            Duration::from_secs(600),
        ))
        .state(START, handler_fn(|_, _| anyhow::bail!("not yet")))
        .permit(START, DONE)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "flaky", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    let before = Utc::now();
    processor(persistence.clone(), definition).process(id).await;

    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "start");
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.retries, 1);
    assert_eq!(instance.executor_id, None);
    let activation = instance.next_activation.unwrap();
    assert!(activation >= before + TimeDelta::seconds(10));
    assert!(activation <= Utc::now() + TimeDelta::seconds(10));
}

#[tokio::test]
async fn test_busy_loop_is_broken_by_the_hundredth_iteration() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();

    let definition = WorkflowDefinition::builder("spinner", START, ERROR)
        .state(
            START,
            handler_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(NextAction::move_to_state(START, "spin"))
            }),
        )
        .permit(START, START)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "spinner", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    let before = Utc::now();
    tokio::time::timeout(
        Duration::from_secs(30),
        processor(persistence.clone(), definition).process(id),
    )
    .await
    .expect("processor never left the busy loop");

    assert_eq!(runs.load(Ordering::SeqCst), 100);
    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "start");
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.executor_id, None);
    assert!(instance.next_activation.unwrap() >= before + TimeDelta::seconds(30));
}

/// Handler that blocks until released, then finishes the workflow.
struct Gated {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StateHandler for Gated {
    async fn execute(
        &self,
        execution: &mut StateExecution,
        _args: &mut StateArgs,
    ) -> anyhow::Result<NextAction> {
        self.entered.notify_one();
        self.release.notified().await;
        execution.set_variable("result", "late");
        Ok(NextAction::move_to_state(DONE, "finished late"))
    }
}

#[tokio::test]
async fn test_result_of_revoked_claim_is_discarded() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let now = Utc::now();
    let registration = ExecutorRegistration {
        host: "test".to_string(),
        pid: 1,
        executor_group: GROUP.to_string(),
        started: now,
        expires: now + TimeDelta::hours(1),
    };
    let first = persistence.register_executor(&registration).await.unwrap();
    let second = persistence.register_executor(&registration).await.unwrap();

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let definition = WorkflowDefinition::builder("slow", START, ERROR)
        .state(
            START,
            Gated {
                entered: entered.clone(),
                release: release.clone(),
            },
        )
        .permit(START, DONE)
        .build()
        .unwrap();
    let registry = Arc::new(DefinitionRegistry::new().with(definition).unwrap());

    let id = insert_ready(persistence.as_ref(), "slow", "start").await;
    claim(persistence.as_ref(), id, first).await;

    let processor = StateProcessor::new(persistence.clone(), registry, first);
    let running = tokio::spawn(async move { processor.process(id).await });
    entered.notified().await;

    // The first executor is declared dead while its handler is still running.
    persistence.stop_executor(first, Utc::now()).await.unwrap();
    let recovered = persistence
        .recover_orphaned_instances(GROUP, second, Utc::now())
        .await
        .unwrap();
    assert_eq!(recovered.len(), 1);

    release.notify_one();
    running.await.unwrap();

    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "start");
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.executor_id, None);
    assert!(!instance.state_variables.contains_key("result"));
    let actions = persistence.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action_type, ActionType::Recovery);
}

#[tokio::test]
async fn test_unsupported_type_is_left_for_another_executor() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let definition = WorkflowDefinition::builder("simple", START, ERROR)
        .state(START, handler_fn(|_, _| Ok(NextAction::move_to_state(DONE, "ok"))))
        .permit(START, DONE)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "unknown", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    processor(persistence.clone(), definition).process(id).await;

    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "start");
    assert_eq!(instance.next_activation, None);
    assert_eq!(instance.executor_id, None);
    assert_eq!(instance.state_text.as_deref(), Some("unsupported type"));
}

#[tokio::test]
async fn test_external_activation_request_merges_into_result() {
    let store = TestStore::new().await;
    let persistence = store.persistence.clone();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    struct WaitThenPark {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl StateHandler for WaitThenPark {
        async fn execute(
            &self,
            _execution: &mut StateExecution,
            _args: &mut StateArgs,
        ) -> anyhow::Result<NextAction> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(NextAction::stop_in_state(WORK, "waiting for input"))
        }
    }

    let definition = WorkflowDefinition::builder("waiter", START, ERROR)
        .state(
            START,
            WaitThenPark {
                entered: entered.clone(),
                release: release.clone(),
            },
        )
        .state(WORK, handler_fn(|_, _| Ok(NextAction::move_to_state(DONE, "ok"))))
        .permit(START, WORK)
        .permit(WORK, DONE)
        .build()
        .unwrap();

    let id = insert_ready(persistence.as_ref(), "waiter", "start").await;
    claim(persistence.as_ref(), id, EXECUTOR).await;
    let processor = processor(persistence.clone(), definition);
    let running = tokio::spawn(async move { processor.process(id).await });
    entered.notified().await;

    let wake_at = Utc::now() + TimeDelta::minutes(5);
    assert!(persistence.request_activation(id, wake_at).await.unwrap());
    release.notify_one();
    running.await.unwrap();

    let instance = persistence.get_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "work");
    assert_eq!(instance.next_activation, Some(wake_at));
    assert_eq!(instance.executor_id, None);
}
