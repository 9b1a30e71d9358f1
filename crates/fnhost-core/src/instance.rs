// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Running instances of a function.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::function::Function;
use crate::proxy::ReverseProxy;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Process launched, waiting for its listener.
    Starting,
    /// Accepting invocations through the proxy.
    Ready,
    /// Termination requested.
    Stopping,
    /// Terminated on request or exited cleanly.
    Stopped,
    /// Failed to start, or exited with an error.
    Failed,
}

impl InstanceState {
    /// Whether the instance will never serve again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance cannot take an invocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotReady {
    /// The instance left the Starting state without becoming Ready.
    #[error("instance is {0}")]
    State(InstanceState),
    /// The instance was still Starting when the wait ended.
    #[error("instance not ready after {0:?}")]
    Timeout(Duration),
}

/// One running (or starting, or finished) execution of a function's artifact.
///
/// Fields set during startup (address, pid, proxy) are written once by the
/// owning supervisor task. Everyone else only reads.
#[derive(Debug)]
pub struct Instance {
    id: Uuid,
    function: Function,
    state: watch::Sender<InstanceState>,
    bound_addr: OnceLock<SocketAddr>,
    pid: OnceLock<u32>,
    proxy: OnceLock<ReverseProxy>,
    started_at: DateTime<Utc>,
}

impl Instance {
    /// Create an instance in the Starting state.
    pub fn new(function: Function) -> Self {
        Self {
            id: Uuid::new_v4(),
            function,
            state: watch::Sender::new(InstanceState::Starting),
            bound_addr: OnceLock::new(),
            pid: OnceLock::new(),
            proxy: OnceLock::new(),
            started_at: Utc::now(),
        }
    }

    /// Unique instance id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The function this instance runs.
    pub fn function(&self) -> &Function {
        &self.function
    }

    /// Shorthand for `function().name()`.
    pub fn name(&self) -> &str {
        self.function.name()
    }

    /// Current state.
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Receiver observing state transitions.
    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    /// Loopback address the process was told to bind.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// OS process id, once spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Creation time.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Proxy handle, present only while Ready.
    pub fn proxy(&self) -> Option<&ReverseProxy> {
        match self.state() {
            InstanceState::Ready => self.proxy.get(),
            _ => None,
        }
    }

    /// Wait until the instance is Ready and return its proxy.
    ///
    /// Returns immediately with [`NotReady::State`] if the instance is past
    /// Starting without being Ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<&ReverseProxy, NotReady> {
        let mut rx = self.state.subscribe();
        let state = match tokio::time::timeout(
            timeout,
            rx.wait_for(|s| *s != InstanceState::Starting),
        )
        .await
        {
            Err(_) => return Err(NotReady::Timeout(timeout)),
            Ok(Ok(state)) => *state,
            // the sender lives in `self`, so the channel cannot close here
            Ok(Err(_)) => self.state(),
        };
        match state {
            InstanceState::Ready => self.proxy.get().ok_or(NotReady::State(state)),
            other => Err(NotReady::State(other)),
        }
    }

    pub(crate) fn set_state(&self, state: InstanceState) {
        self.state.send_replace(state);
    }

    pub(crate) fn set_bound_addr(&self, addr: SocketAddr) {
        let _ = self.bound_addr.set(addr);
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        let _ = self.pid.set(pid);
    }

    /// Install the proxy, then publish Ready.
    pub(crate) fn mark_ready(&self, proxy: ReverseProxy) {
        let _ = self.proxy.set(proxy);
        self.set_state(InstanceState::Ready);
    }
}
