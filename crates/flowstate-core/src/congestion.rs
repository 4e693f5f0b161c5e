// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission gate pausing the dispatcher while too much work is queued locally.
//!
//! The gate compares a live queue length, read through [`QueueDepth`], against
//! a threshold. Every finished unit of work calls [`CongestionGate::signal`],
//! which wakes one waiting [`admit`](CongestionGate::admit) call to re-check the
//! queue. A signal sent while nobody waits is kept for the next waiter, so no
//! wakeup is lost between the check and the wait.

use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tracing::debug;

/// Source of the current local queue length.
pub trait QueueDepth: Send + Sync {
    /// Number of submitted tasks not yet started.
    fn queued(&self) -> usize;
}

/// Bounded admission gate over a worker queue.
pub struct CongestionGate {
    threshold: usize,
    depth: Arc<dyn QueueDepth>,
    notify: Notify,
}

impl std::fmt::Debug for CongestionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CongestionGate")
            .field("threshold", &self.threshold)
            .field("queued", &self.depth.queued())
            .finish()
    }
}

impl CongestionGate {
    pub fn new(threshold: usize, depth: Arc<dyn QueueDepth>) -> Self {
        Self {
            threshold,
            depth,
            notify: Notify::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Wait until the queue length is at most the threshold.
    ///
    /// Returns `false` without admitting if `shutdown` becomes true (or its
    /// sender is dropped) while waiting.
    pub async fn admit(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a signal between check and wait is not missed.
            notified.as_mut().enable();

            let queued = self.depth.queued();
            if queued <= self.threshold {
                return true;
            }
            if *shutdown.borrow() {
                return false;
            }
            debug!(queued, threshold = self.threshold, "Queue congested, waiting");

            tokio::select! {
                _ = &mut notified => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Report a finished unit of work, releasing one blocked `admit` call.
    pub fn signal(&self) {
        self.notify.notify_one();
    }
}
