// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hierarchical cancellation and lifetime tracking.
//!
//! A [`SupervisionContext`] pairs a [`CancellationToken`] with a
//! [`TaskTracker`]. Children get a child token, so cancelling a parent
//! cancels every descendant, and every task spawned through a context is
//! also counted by all ancestor trackers, so waiting on a parent covers
//! the whole subtree.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Tasks of a context were still running when the timeout elapsed.
#[derive(Debug, Error)]
#[error("tasks of '{name}' still running after {timeout:?}")]
pub struct ShutdownTimeout {
    /// Context name.
    pub name: String,
    /// Timeout that elapsed.
    pub timeout: Duration,
}

/// Cancellation token plus task tracking for one node of the supervision tree.
#[derive(Clone)]
pub struct SupervisionContext {
    name: Arc<str>,
    token: CancellationToken,
    // own tracker first, then ancestors up to the root
    trackers: Arc<[TaskTracker]>,
}

impl SupervisionContext {
    /// Create a root context.
    pub fn root(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            trackers: Arc::from([TaskTracker::new()]),
        }
    }

    /// Create a child context. Cancelling `self` cancels the child, and
    /// tasks spawned on the child are awaited by `self`.
    pub fn child(&self, name: impl Into<Arc<str>>) -> Self {
        let trackers: Vec<TaskTracker> = std::iter::once(TaskTracker::new())
            .chain(self.trackers.iter().cloned())
            .collect();
        Self {
            name: name.into(),
            token: self.token.child_token(),
            trackers: trackers.into(),
        }
    }

    /// Context name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn a task tracked by this context and all of its ancestors.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let tokens: Vec<_> = self.trackers.iter().map(TaskTracker::token).collect();
        tokio::spawn(async move {
            let _tokens = tokens;
            future.await
        })
    }

    /// Request cancellation of this context and its descendants.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested here or on an ancestor.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Number of live tasks spawned in this subtree.
    pub fn active_tasks(&self) -> usize {
        self.trackers[0].len()
    }

    /// Wait up to `timeout` for every task in this subtree to finish,
    /// without cancelling anything.
    pub async fn wait(&self, timeout: Duration) -> Result<(), ShutdownTimeout> {
        let tracker = &self.trackers[0];
        // a closed tracker still counts tasks spawned later
        tracker.close();
        tokio::time::timeout(timeout, tracker.wait())
            .await
            .map_err(|_| ShutdownTimeout {
                name: self.name.to_string(),
                timeout,
            })
    }

    /// Cancel the subtree and wait up to `timeout` for it to finish.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownTimeout> {
        debug!(context = %self.name, tasks = self.active_tasks(), "Shutting down");
        self.cancel();
        let result = self.wait(timeout).await;
        if result.is_err() {
            warn!(
                context = %self.name,
                tasks = self.active_tasks(),
                timeout_ms = timeout.as_millis() as u64,
                "Shutdown timed out"
            );
        }
        result
    }
}

impl fmt::Debug for SupervisionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisionContext")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .field("active_tasks", &self.active_tasks())
            .finish()
    }
}
