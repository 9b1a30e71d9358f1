// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-client.

use std::path::PathBuf;

use thiserror::Error;

/// Result type using ClientError.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while bundling or uploading a function.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The source directory could not be walked.
    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },

    /// A file could not be read.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bundle could not be written.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The router address is not a valid URL base.
    #[error("invalid router address: {0}")]
    InvalidAddress(String),

    /// The request could not be sent or its response read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The router refused the deployment.
    #[error("router returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The bundling task failed.
    #[error("bundle task failed: {0}")]
    Task(String),
}

impl ClientError {
    /// Whether the router refused the request because of the bundle itself
    /// (bad name, unsafe paths, failed build).
    pub fn is_rejected_bundle(&self) -> bool {
        matches!(self, Self::Rejected { status: 400..=499, .. })
    }
}
