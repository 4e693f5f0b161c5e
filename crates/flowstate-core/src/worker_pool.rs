// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded pool running instance processors as tokio tasks.
//!
//! At most `max_size` tasks run at once; the rest wait in the queue. The pool
//! exposes its active and queued counts so the dispatcher can size batches and
//! the congestion gate can watch the queue.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error};

use crate::congestion::{CongestionGate, QueueDepth};

#[derive(Debug)]
struct PoolState {
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    queued: AtomicUsize,
    /// Submitted and not yet completed.
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

impl QueueDepth for PoolState {
    fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

/// Bounded async worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_size: usize,
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            max_size,
            state: Arc::new(PoolState {
                permits: Arc::new(Semaphore::new(max_size)),
                active: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Tasks waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }

    /// Queue length source for a [`CongestionGate`].
    pub fn queue_depth(&self) -> Arc<dyn QueueDepth> {
        self.state.clone()
    }

    /// Queue `task`. When it leaves the queue and when it completes, `gate`
    /// is signalled. Returns false if the pool is shut down.
    ///
    /// A panicking task is logged and counted as completed.
    pub fn submit<F>(&self, task: F, gate: Option<Arc<CongestionGate>>) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.state.closed.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.clone();
        state.pending.fetch_add(1, Ordering::SeqCst);
        state.queued.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let permit = state.permits.clone().acquire_owned().await;
            state.queued.fetch_sub(1, Ordering::SeqCst);
            if let Some(gate) = &gate {
                gate.signal();
            }

            if permit.is_ok() {
                state.active.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = tokio::spawn(task).await
                    && e.is_panic()
                {
                    error!(error = %e, "Worker task panicked");
                }
                state.active.fetch_sub(1, Ordering::SeqCst);
            }
            drop(permit);

            if let Some(gate) = &gate {
                gate.signal();
            }
            if state.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                state.idle.notify_waiters();
            }
        });
        true
    }

    /// Stop accepting tasks and wait for queued and running ones to complete.
    ///
    /// Running tasks are not interrupted.
    pub async fn shutdown(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        loop {
            let idle = self.state.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let pending = self.state.pending.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            debug!(pending, "Waiting for worker tasks to finish");
            idle.await;
        }
        debug!("Worker pool drained");
    }
}
