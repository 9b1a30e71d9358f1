// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost core - function lifecycle engine
//!
//! Turns uploaded source archives into running HTTP processes and keeps
//! exactly one current process per function name.
//!
//! # Pipeline
//!
//! ```text
//!   zip bundle ──► archive ──► builder ──► registry ──► supervisor ──► child process
//!                 (extract)   (toolchain)   (swap)     (spawn/probe)   BIND_ADDR:BIND_PORT
//!                                              │
//!                                              ▼
//!                                  lookup ──► instance ──► proxy ──► child process
//! ```
//!
//! # Instance State Machine
//!
//! ```text
//!   ┌──────────┐  listener up  ┌───────┐  cancel  ┌──────────┐      ┌─────────┐
//!   │ STARTING │──────────────►│ READY │─────────►│ STOPPING │─────►│ STOPPED │
//!   └────┬─────┘               └───┬───┘          └──────────┘      └─────────┘
//!        │ exit / timeout          │ exit
//!        ▼                         ▼
//!   ┌────────┐               ┌─────────────────┐
//!   │ FAILED │               │ FAILED / STOPPED│
//!   └────────┘               └─────────────────┘
//! ```
//!
//! A name resolves to its instance from registration until the instance's
//! supervision task ends, whatever the cause. There is no automatic restart.
//!
//! # Modules
//!
//! - [`function`]: function names and the on-disk layout
//! - [`archive`]: zip extraction with path-traversal protection
//! - [`builder`]: toolchain invocation
//! - [`supervision`]: hierarchical cancellation
//! - [`instance`]: instance state
//! - [`supervisor`]: process spawn, readiness probe, stop
//! - [`proxy`]: streaming reverse proxy
//! - [`registry`]: name to instance map and swap protocol
//! - [`deploy`]: the upload pipeline
//! - [`error`]: aggregate error type

#![warn(missing_docs)]

pub mod archive;
pub mod builder;
pub mod deploy;
pub mod error;
pub mod function;
pub mod instance;
pub mod proxy;
pub mod registry;
pub mod supervision;
pub mod supervisor;

pub use builder::{BuildOutput, Builder, Toolchain};
pub use deploy::{DeployError, Deployer, Deployment};
pub use error::{Error, Result};
pub use function::{Function, Layout};
pub use instance::{Instance, InstanceState};
pub use proxy::ReverseProxy;
pub use registry::{FunctionRegistry, RegistryConfig};
pub use supervision::SupervisionContext;
pub use supervisor::{InstanceSupervisor, SupervisorConfig};
