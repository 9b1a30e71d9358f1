// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-core.

use thiserror::Error;

/// Aggregate error for callers that drive several components.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Archive extraction failed.
    #[error("Archive error: {0}")]
    Archive(#[from] crate::archive::ArchiveError),

    /// Toolchain invocation failed.
    #[error("Build error: {0}")]
    Build(#[from] crate::builder::BuildError),

    /// Instance supervision failed.
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] crate::supervisor::SupervisorError),

    /// Registry operation failed.
    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    /// Deployment failed.
    #[error("Deploy error: {0}")]
    Deploy(#[from] crate::deploy::DeployError),

    /// Waiting for supervised tasks timed out.
    #[error("Shutdown error: {0}")]
    Shutdown(#[from] crate::supervision::ShutdownTimeout),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using the core Error.
pub type Result<T> = std::result::Result<T, Error>;
