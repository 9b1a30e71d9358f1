// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost client
//!
//! Packs a function source directory into a zip bundle and deploys it to a
//! running fnhost router.
//!
//! # Example
//!
//! ```no_run
//! use fnhost_client::UploadClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = UploadClient::new("http://127.0.0.1:9000")?;
//! let response = client.upload("hello", "./hello".as_ref()).await?;
//! println!("deployed {}", response.func_name);
//! # Ok(())
//! # }
//! ```
//!
//! Files matched by `.gitignore` or `.fnhostignore` are left out of the bundle,
//! as are hidden files.

mod bundle;
mod client;
mod error;

pub use bundle::{IGNORE_FILE, bundle_dir};
pub use client::{UploadClient, UploadResponse};
pub use error::{ClientError, Result};
