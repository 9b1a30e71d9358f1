// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upload to running instance: extract, build, register.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::info;

use crate::archive::{self, ArchiveError};
use crate::builder::{BuildError, BuildOutput, Builder};
use crate::function::{self, Function, Layout, NameError};
use crate::instance::Instance;
use crate::registry::{FunctionRegistry, RegistryError};

/// Errors from a deployment, tagged by stage.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeployError {
    /// The function name is not acceptable.
    #[error("name error: {0}")]
    InvalidName(#[from] NameError),

    /// The archive was rejected or could not be unpacked.
    #[error("extract error: {0}")]
    Extract(#[from] ArchiveError),

    /// The toolchain failed. Carries the full toolchain output.
    #[error("compile error: {0}")]
    Build(#[from] BuildError),

    /// The built function could not be installed.
    #[error("register error: {0}")]
    Register(#[from] RegistryError),

    /// Preparing the source directory failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A blocking task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] JoinError),
}

impl DeployError {
    /// Whether the uploader is at fault: bad name, bad archive or code that
    /// does not build.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidName(_) | Self::Build(BuildError::Failed { .. }) => true,
            Self::Extract(e) => !matches!(e, ArchiveError::Io { .. }),
            _ => false,
        }
    }
}

/// A completed deployment.
#[derive(Debug, Clone)]
pub struct Deployment {
    /// The new instance, possibly still starting.
    pub instance: Arc<Instance>,
    /// Build result.
    pub build: BuildOutput,
}

/// Runs the upload pipeline against a layout, builder and registry.
#[derive(Debug, Clone)]
pub struct Deployer {
    layout: Layout,
    builder: Builder,
    registry: Arc<FunctionRegistry>,
}

impl Deployer {
    /// Create a deployer.
    pub fn new(layout: Layout, builder: Builder, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            layout,
            builder,
            registry,
        }
    }

    /// On-disk layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The registry deployments install into.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Deploy the zip `bundle` as function `name`.
    ///
    /// Holds the name's swap lock throughout, so concurrent uploads of one
    /// name run one after another. A failure at any stage leaves the running
    /// instance (if any) untouched.
    pub async fn deploy(&self, name: &str, bundle: Bytes) -> Result<Deployment, DeployError> {
        function::validate_name(name)?;
        let guard = self.registry.lock_name(name).await;
        let started = Instant::now();

        let source_dir = self.layout.source_dir(name);
        match tokio::fs::remove_dir_all(&source_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let summary = {
            let source_dir = source_dir.clone();
            tokio::task::spawn_blocking(move || archive::extract_bytes(&bundle, &source_dir))
                .await??
        };
        info!(
            function = %name,
            files = summary.files,
            bytes = summary.bytes,
            "Sources extracted"
        );

        let artifact_path = self.layout.artifact_path(name);
        let build = self.builder.build(&source_dir, &artifact_path).await?;

        let instance = self
            .registry
            .register_guarded(&guard, Function::from_artifact(&build.artifact_path))
            .await?;

        info!(
            function = %name,
            instance_id = %instance.id(),
            checksum = %build.checksum,
            duration_ms = started.elapsed().as_millis() as u64,
            "Function deployed"
        );
        Ok(Deployment { instance, build })
    }
}
