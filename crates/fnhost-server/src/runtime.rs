// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for fnhost-server.
//!
//! [`ServerRuntime`] wires the core components together under one root
//! supervision context: the instance registry and the HTTP listener are
//! both children of it, so cancelling the root stops everything.
//!
//! ```rust,ignore
//! use fnhost_server::runtime::ServerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ServerRuntime::builder()
//!         .bind_addr("127.0.0.1:9000".parse()?)
//!         .base_dir("/var/lib/fnhost")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fnhost_core::{
    Builder, Deployer, FunctionRegistry, InstanceSupervisor, Layout, RegistryConfig,
    SupervisionContext, SupervisorConfig, Toolchain,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::router::{self, AppState};

/// Builder for creating a [`ServerRuntime`].
pub struct ServerRuntimeBuilder {
    config: Config,
    rehydrate: bool,
}

impl Default for ServerRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            rehydrate: true,
        }
    }
}

impl ServerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the listen address. Port 0 picks a free port.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.listen_addr = addr;
        self
    }

    /// Set the base directory for sources and binaries.
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.base_dir = path.into();
        self
    }

    /// Set the build toolchain.
    pub fn toolchain(mut self, toolchain: Toolchain) -> Self {
        self.config.toolchain = toolchain;
        self
    }

    /// Set the readiness deadline for new instances.
    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.config.readiness_timeout = timeout;
        self
    }

    /// Set the SIGTERM to SIGKILL grace for stopping instances.
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace = grace;
        self
    }

    /// Set how long a recompile waits for the previous instance.
    pub fn supersession_timeout(mut self, timeout: Duration) -> Self {
        self.config.supersession_timeout = timeout;
        self
    }

    /// Set the upload size limit.
    pub fn max_upload_bytes(mut self, limit: usize) -> Self {
        self.config.max_upload_bytes = limit;
        self
    }

    /// Whether to start every previously built function on startup.
    ///
    /// Default: `true`.
    pub fn rehydrate(mut self, enabled: bool) -> Self {
        self.rehydrate = enabled;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<ServerRuntimeConfig> {
        if self.config.max_upload_bytes == 0 {
            anyhow::bail!("max_upload_bytes must be positive");
        }
        if self.config.probe_interval.is_zero() {
            anyhow::bail!("probe_interval must be positive");
        }
        Ok(ServerRuntimeConfig {
            config: self.config,
            rehydrate: self.rehydrate,
        })
    }
}

/// Configuration for a [`ServerRuntime`].
pub struct ServerRuntimeConfig {
    config: Config,
    rehydrate: bool,
}

impl ServerRuntimeConfig {
    /// Start the runtime: prepare directories, rehydrate functions and
    /// start serving HTTP.
    pub async fn start(self) -> Result<ServerRuntime> {
        let config = self.config;
        let root = SupervisionContext::root("fnhost");

        let base_dir = std::path::absolute(&config.base_dir)
            .with_context(|| format!("invalid base dir {}", config.base_dir.display()))?;
        let layout = Layout::under(&base_dir);
        for dir in [layout.source_root(), layout.binary_root()] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let supervisor = InstanceSupervisor::new(SupervisorConfig {
            readiness_timeout: config.readiness_timeout,
            probe_interval: config.probe_interval,
            stop_grace: config.stop_grace,
            ..SupervisorConfig::default()
        })?;
        let registry = FunctionRegistry::new(
            &root,
            supervisor,
            RegistryConfig {
                supersession_timeout: config.supersession_timeout,
                ..RegistryConfig::default()
            },
        );

        if self.rehydrate
            && let Err(e) = registry.rehydrate(&layout).await
        {
            warn!(error = %e, "Failed to rehydrate functions");
        }

        let deployer = Deployer::new(layout, Builder::new(config.toolchain.clone()), registry.clone());
        let app = router::router(
            AppState::new(deployer, config.readiness_timeout),
            config.max_upload_bytes,
        );

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;

        let http = root.child("http");
        let token = http.token().clone();
        let server_handle = http.spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
        });

        info!(
            addr = %local_addr,
            base_dir = %base_dir.display(),
            toolchain = %config.toolchain,
            functions = registry.len(),
            "Server runtime started"
        );

        Ok(ServerRuntime {
            root,
            registry,
            server_handle,
            local_addr,
            shutdown_timeout: config.shutdown_timeout,
        })
    }
}

/// A running fnhost server.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ServerRuntime {
    root: SupervisionContext,
    registry: Arc<FunctionRegistry>,
    server_handle: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
    shutdown_timeout: Duration,
}

impl ServerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ServerRuntimeBuilder {
        ServerRuntimeBuilder::new()
    }

    /// Address the HTTP listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The function registry.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Root supervision context. Cancelling it stops the server.
    pub fn context(&self) -> &SupervisionContext {
        &self.root
    }

    /// Check if the HTTP listener is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Gracefully shut down: cancel the root context, wait for the listener,
    /// then wait for every instance to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!(functions = self.registry.len(), "Server runtime shutting down...");
        self.root.cancel();

        let served = match self.server_handle.await {
            Ok(result) => result.context("HTTP server failed"),
            Err(e) => Err(anyhow::anyhow!("server task panicked: {e}")),
        };

        if let Err(e) = self.registry.shutdown(self.shutdown_timeout).await {
            error!(error = %e, "Instances did not stop in time");
            return Err(e.into());
        }

        match served {
            Ok(()) => {
                info!("Server runtime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Server runtime error during shutdown");
                Err(e)
            }
        }
    }
}
