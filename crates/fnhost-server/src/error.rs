// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP-facing errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fnhost_core::DeployError;
use thiserror::Error;

/// Errors returned to HTTP callers.
///
/// Invocation errors carry minimal detail since the caller is an arbitrary
/// client. Deployment errors carry the full cause, including toolchain output.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    /// No function is registered under the name.
    #[error("function not found")]
    NotFound,

    /// The function is registered but its instance is not serving.
    #[error("function not ready")]
    NotReady,

    /// The instance accepted the function but the request could not be forwarded.
    #[error("bad gateway")]
    BadGateway,

    /// A recompile failed.
    #[error(transparent)]
    Deploy(#[from] DeployError),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway => StatusCode::BAD_GATEWAY,
            Self::Deploy(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Deploy(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
