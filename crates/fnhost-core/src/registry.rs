// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function registry: name to current instance.
//!
//! Every registration starts one supervision task under the registry's
//! context. Replacing a function is a swap: the current instance's context
//! is cancelled and its task awaited before the new instance is installed,
//! so a name never has two live processes once a swap completes.
//!
//! Entries carry a generation number. A supervision task removes its entry
//! when it ends, but only if the entry still belongs to its generation, so a
//! finished old instance can never evict its replacement.
//!
//! Swaps of one name are serialised by a per-name lock ([`NameGuard`]);
//! different names never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::function::{Function, Layout};
use crate::instance::Instance;
use crate::supervision::{ShutdownTimeout, SupervisionContext};
use crate::supervisor::{InstanceSupervisor, SupervisorError};

/// Errors from registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The previous instance did not stop in time, even after a kill.
    #[error("previous instance of '{name}' did not stop within {timeout:?}")]
    SupersessionTimeout {
        /// Function name.
        name: String,
        /// Supersession timeout that elapsed.
        timeout: Duration,
    },

    /// The registry is shutting down and accepts no new instances.
    #[error("registry is shutting down")]
    ShutDown,

    /// A name guard was used for a different function.
    #[error("lock held for '{held}' but registering '{requested}'")]
    GuardMismatch {
        /// Name the guard locks.
        held: String,
        /// Name being registered.
        requested: String,
    },
}

/// Registry timing.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a swap waits for the previous instance to stop.
    pub supersession_timeout: Duration,
    /// Extra wait after force-killing an instance that outlived the timeout.
    pub kill_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            supersession_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_secs(2),
        }
    }
}

struct Entry {
    instance: Arc<Instance>,
    context: SupervisionContext,
    generation: u64,
}

/// Exclusive right to swap one function name.
///
/// Dropping the guard releases the lock and forgets it when nothing is
/// registered under the name and nobody else is waiting.
pub struct NameGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    registry: Weak<FunctionRegistry>,
}

impl NameGuard {
    /// The locked name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(registry) = self.registry.upgrade() {
            registry.prune_swap_lock(&self.name);
        }
    }
}

/// Concurrent map of running functions.
pub struct FunctionRegistry {
    entries: DashMap<String, Entry>,
    swap_locks: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,
    context: SupervisionContext,
    supervisor: InstanceSupervisor,
    config: RegistryConfig,
}

impl FunctionRegistry {
    /// Create a registry whose instances run under a child of `parent`.
    pub fn new(
        parent: &SupervisionContext,
        supervisor: InstanceSupervisor,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            swap_locks: DashMap::new(),
            generation: AtomicU64::new(0),
            context: parent.child("instances"),
            supervisor,
            config,
        })
    }

    /// Current instance for `name`. Never blocks on swaps.
    pub fn lookup(&self, name: &str) -> Option<Arc<Instance>> {
        self.entries.get(name).map(|e| e.instance.clone())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// All current instances, sorted by name.
    pub fn instances(&self) -> Vec<Arc<Instance>> {
        let mut instances: Vec<_> = self.entries.iter().map(|e| e.instance.clone()).collect();
        instances.sort_by(|a, b| a.name().cmp(b.name()));
        instances
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no function is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Supervision context all instances run under.
    pub fn context(&self) -> &SupervisionContext {
        &self.context
    }

    /// Take the swap lock for `name`, waiting for any swap in progress.
    pub async fn lock_name(self: &Arc<Self>, name: &str) -> NameGuard {
        let lock = self.swap_locks.entry(name.to_string()).or_default().clone();
        NameGuard {
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
            registry: Arc::downgrade(self),
        }
    }

    /// Drop the swap lock of an unregistered name once no one holds or awaits it.
    fn prune_swap_lock(&self, name: &str) {
        if self.entries.contains_key(name) {
            return;
        }
        // the map's own reference is the only one left
        self.swap_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Install `function` as the current instance for its name, replacing
    /// and stopping any previous one.
    pub async fn register(self: &Arc<Self>, function: Function) -> Result<Arc<Instance>, RegistryError> {
        let guard = self.lock_name(function.name()).await;
        self.register_guarded(&guard, function).await
    }

    /// [`register`](Self::register) for callers already holding the name lock.
    pub async fn register_guarded(
        self: &Arc<Self>,
        guard: &NameGuard,
        function: Function,
    ) -> Result<Arc<Instance>, RegistryError> {
        if guard.name() != function.name() {
            return Err(RegistryError::GuardMismatch {
                held: guard.name().to_string(),
                requested: function.name().to_string(),
            });
        }
        if self.context.is_cancelled() {
            return Err(RegistryError::ShutDown);
        }
        self.supersede(function.name()).await?;

        info!(
            function = %function.name(),
            artifact = %function.artifact_path().display(),
            "Registering function"
        );
        Ok(self.spawn_instance(function))
    }

    /// Register every executable artifact found under `layout`'s binary root.
    /// Returns how many were registered.
    pub async fn rehydrate(self: &Arc<Self>, layout: &Layout) -> crate::Result<usize> {
        let functions = layout.scan_artifacts()?;
        let mut registered = 0;
        for function in functions {
            let name = function.name().to_string();
            match self.register(function).await {
                Ok(_) => registered += 1,
                Err(e) => warn!(function = %name, error = %e, "Failed to rehydrate function"),
            }
        }
        info!(
            binary_root = %layout.binary_root().display(),
            registered,
            "Registry rehydrated"
        );
        Ok(registered)
    }

    /// Cancel every instance and wait up to `timeout` for their tasks.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownTimeout> {
        info!(instances = self.len(), "Stopping all instances");
        self.context.shutdown(timeout).await
    }

    /// Remove `name` only if its entry is still generation `generation`.
    pub fn remove_if_current(&self, name: &str, generation: u64) -> bool {
        let removed = self
            .entries
            .remove_if(name, |_, entry| entry.generation == generation)
            .is_some();
        if removed {
            self.prune_swap_lock(name);
        }
        removed
    }

    /// Stop the current instance of `name`, if any, and wait for its task.
    async fn supersede(&self, name: &str) -> Result<(), RegistryError> {
        let Some((context, instance)) = self
            .entries
            .get(name)
            .map(|e| (e.context.clone(), e.instance.clone()))
        else {
            return Ok(());
        };

        info!(function = %name, instance_id = %instance.id(), "Superseding running instance");
        let timeout = self.config.supersession_timeout;
        if context.shutdown(timeout).await.is_ok() {
            return Ok(());
        }

        if let Some(pid) = instance.pid() {
            warn!(function = %name, pid, "Previous instance outlived supersession timeout, killing");
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!(function = %name, pid, error = %e, "SIGKILL failed");
            }
        }
        if context.wait(self.config.kill_grace).await.is_ok() {
            return Ok(());
        }

        error!(function = %name, timeout_ms = timeout.as_millis() as u64, "Supersession timed out");
        Err(RegistryError::SupersessionTimeout {
            name: name.to_string(),
            timeout,
        })
    }

    fn spawn_instance(self: &Arc<Self>, function: Function) -> Arc<Instance> {
        let name = function.name().to_string();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let instance = Arc::new(Instance::new(function));
        let context = self.context.child(format!("instance:{name}"));

        // the entry must exist before the task can try to remove it
        self.entries.insert(
            name.clone(),
            Entry {
                instance: instance.clone(),
                context: context.clone(),
                generation,
            },
        );

        let registry: Weak<Self> = Arc::downgrade(self);
        let supervisor = self.supervisor.clone();
        let task_instance = instance.clone();
        let task_context = context.clone();
        context.spawn(async move {
            let reason = match supervisor.run(&task_instance, &task_context).await {
                Ok(never) => match never {},
                Err(reason) => reason,
            };
            match &reason {
                SupervisorError::Cancelled => {
                    info!(function = %name, instance_id = %task_instance.id(), "Instance task finished")
                }
                _ => warn!(
                    function = %name,
                    instance_id = %task_instance.id(),
                    error = %reason,
                    "Instance task ended with error"
                ),
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove_if_current(&name, generation);
            }
        });

        instance
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .field("context", &self.context)
            .finish()
    }
}
