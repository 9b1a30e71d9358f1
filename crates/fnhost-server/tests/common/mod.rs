// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for fnhost-server tests.
//!
//! Provides TestContext for running a full server runtime against a temp
//! base directory, plus bundle builders.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fnhost_core::Toolchain;
use fnhost_server::runtime::ServerRuntime;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Test context that owns a running server and its base directory.
pub struct TestContext {
    pub runtime: ServerRuntime,
    pub client: reqwest::Client,
    pub addr: SocketAddr,
    pub base_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Start a server that builds with `toolchain`.
    pub async fn new(toolchain: Toolchain) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let base_dir = temp_dir.path().to_path_buf();

        let runtime = ServerRuntime::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .base_dir(&base_dir)
            .toolchain(toolchain)
            .readiness_timeout(Duration::from_secs(10))
            .stop_grace(Duration::from_secs(1))
            .supersession_timeout(Duration::from_secs(10))
            .rehydrate(false)
            .build()
            .expect("Failed to build runtime config")
            .start()
            .await
            .expect("Failed to start runtime");

        let addr = runtime.local_addr();
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            runtime,
            client,
            addr,
            base_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Start a server that compiles `src/main.rs` with rustc.
    pub async fn with_rustc() -> Self {
        Self::new(Toolchain::rustc()).await
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// PUT a bundle to the recompile endpoint.
    pub async fn recompile(&self, name: &str, bundle: Vec<u8>) -> (u16, String) {
        let response = self
            .client
            .put(self.url(&format!("/_admin/{name}/recompile")))
            .header("content-type", "application/zip")
            .body(bundle)
            .send()
            .await
            .expect("recompile request failed");
        let status = response.status().as_u16();
        (status, response.text().await.unwrap_or_default())
    }

    /// GET `path` and return the status and body.
    pub async fn get(&self, path: &str) -> (u16, String) {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("request failed");
        let status = response.status().as_u16();
        (status, response.text().await.unwrap_or_default())
    }

    /// Split into the runtime and the directory guard, to restart on the same base dir.
    pub fn into_parts(self) -> (ServerRuntime, tempfile::TempDir) {
        (self.runtime, self._temp_dir)
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("shutdown failed");
    }
}

/// Zip `(name, contents)` pairs.
pub fn bundle(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        for (name, contents) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// A std-only HTTP function answering `"{version} {path}"` on every request.
pub fn rust_function(version: &str) -> Vec<u8> {
    let source = r#"
use std::io::{Read, Write};
use std::net::TcpListener;

const VERSION: &str = "__VERSION__";

fn main() {
    let host = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("BIND_PORT").expect("BIND_PORT not set");
    let listener = TcpListener::bind(format!("{host}:{port}")).expect("bind failed");
    for stream in listener.incoming() {
        let Ok(mut stream) = stream else { continue };
        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).unwrap_or(0);
        let request = String::from_utf8_lossy(&buf[..n]);
        let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
        let body = format!("{VERSION} {path}");
        let _ = write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
    }
}
"#
    .replace("__VERSION__", version);
    bundle(&[("src/main.rs", &source)])
}

/// Whether a rustc is available on PATH.
pub fn has_rustc() -> bool {
    std::process::Command::new("rustc")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Whether `pid` is still a live process.
pub fn process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Helper macro to skip tests if rustc is not installed.
#[macro_export]
macro_rules! skip_if_no_rustc {
    () => {
        if !common::has_rustc() {
            eprintln!("Skipping test: rustc not found on PATH");
            return;
        }
    };
}
