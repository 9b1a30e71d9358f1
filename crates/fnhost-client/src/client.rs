// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Upload client for the recompile endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use tracing::{debug, info};

use crate::bundle::bundle_dir;
use crate::error::{ClientError, Result};

/// Builds can take a while; the router answers only once the new instance
/// is registered.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Successful deployment reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    /// Always `"ok"`.
    pub status: String,
    /// Name the function was deployed under.
    pub func_name: String,
}

/// Client for a fnhost router's admin API.
#[derive(Debug, Clone)]
pub struct UploadClient {
    base_url: String,
    http: reqwest::Client,
}

impl UploadClient {
    /// Create a client for the router at `base_url`, e.g. `http://127.0.0.1:9000`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidAddress(base_url));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, http })
    }

    /// Router base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the recompile endpoint for `name`.
    pub fn recompile_url(&self, name: &str) -> String {
        format!("{}/_admin/{}/recompile", self.base_url, name)
    }

    /// Bundle `dir` and deploy it as `name`.
    pub async fn upload(&self, name: &str, dir: &Path) -> Result<UploadResponse> {
        let dir: PathBuf = dir.to_path_buf();
        let bundle = tokio::task::spawn_blocking(move || bundle_dir(&dir))
            .await
            .map_err(|e| ClientError::Task(e.to_string()))??;
        self.upload_bundle(name, bundle).await
    }

    /// Deploy an already zipped bundle as `name`.
    pub async fn upload_bundle(&self, name: &str, bundle: Vec<u8>) -> Result<UploadResponse> {
        let url = self.recompile_url(name);
        info!(function = %name, bytes = bundle.len(), url = %url, "Uploading function");

        let response = self
            .http
            .put(&url)
            .header(CONTENT_TYPE, "application/zip")
            .body(bundle)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(function = %name, status = status.as_u16(), "Upload rejected");
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recompile_url() {
        let client = UploadClient::new("http://127.0.0.1:9000/").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
        assert_eq!(
            client.recompile_url("hello"),
            "http://127.0.0.1:9000/_admin/hello/recompile"
        );
    }

    #[test]
    fn test_invalid_address() {
        let err = UploadClient::new("127.0.0.1:9000").unwrap_err();
        assert!(matches!(err, ClientError::InvalidAddress(_)));
    }

    #[test]
    fn test_rejected_classification() {
        let err = ClientError::Rejected {
            status: 400,
            body: "compile error: boom".into(),
        };
        assert!(err.is_rejected_bundle());
        let err = ClientError::Rejected {
            status: 500,
            body: "register error".into(),
        };
        assert!(!err.is_rejected_bundle());
    }
}
