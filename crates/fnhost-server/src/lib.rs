// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost server - HTTP front for the function lifecycle engine
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (and `.env`):
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FNHOST_BIND_ADDR` | `0.0.0.0` | Listen address |
//! | `FNHOST_PORT` | `9000` | Listen port |
//! | `FNHOST_BASE_DIR` | `.data` | Sources in `src/`, binaries in `bin/` |
//! | `FNHOST_BUILD_COMMAND` | `rustc --edition=2021 -C opt-level=2 -o {output} src/main.rs` | Toolchain command |
//! | `FNHOST_READINESS_TIMEOUT_MS` | `5000` | Readiness deadline |
//! | `FNHOST_PROBE_INTERVAL_MS` | `50` | Readiness poll interval |
//! | `FNHOST_STOP_GRACE_MS` | `5000` | SIGTERM to SIGKILL grace |
//! | `FNHOST_SUPERSESSION_TIMEOUT_SECS` | `60` | Recompile swap wait |
//! | `FNHOST_MAX_UPLOAD_BYTES` | `67108864` | Upload size limit |
//! | `FNHOST_SHUTDOWN_TIMEOUT_SECS` | `30` | Instance stop wait at shutdown |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`error`]: HTTP error mapping
//! - [`router`]: Admin, health and invocation routes
//! - [`runtime`]: Embeddable server runtime

#![warn(missing_docs)]

/// Server configuration loaded from environment variables.
pub mod config;

/// HTTP error mapping.
pub mod error;

/// Admin, health and invocation routes.
pub mod router;

/// Embeddable server runtime.
pub mod runtime;
